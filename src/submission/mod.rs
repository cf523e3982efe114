//! Transaction submission: relay bundles, priority lane, direct send
//!
//! - **bundle**: block-engine relay client and tip account helpers
//! - **sender**: send + confirm through the RPC pool
//! - **router**: mode selection, tip clamping, relay-to-direct fallback

pub mod bundle;
pub mod router;
pub mod sender;

pub use bundle::{BundleStatus, Bundler, JitoBundler, RelayError, JITO_TIP_ACCOUNTS};
pub use router::{MevSubmitResult, SubmissionError, SubmissionRouter, SubmitOptions};
pub use sender::{Landed, SendOptions, TransactionSender};
