//! Token safety lookups
//!
//! Mint facts come from the on-chain mint account (SPL Token or Token-2022)
//! plus a best-effort off-chain symbol/name lookup. Results are cached per
//! mint with a TTL that is checked on read.

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use spl_token::solana_program::program_pack::Pack;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::policy::RiskPolicy;
use crate::rpc_manager::{RpcManagerError, RpcPool};

pub const TOKEN_2022_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb");

/// Token-2022 mints are padded to the token account length before the account type byte
const ACCOUNT_TYPE_OFFSET: usize = spl_token::state::Account::LEN;
const EXTENSION_TRANSFER_FEE_CONFIG: u16 = 1;

/// Decoded on-chain mint account
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MintAccount {
    pub decimals: u8,
    pub mint_authority: Option<Pubkey>,
    pub freeze_authority: Option<Pubkey>,
    pub is_token_2022: bool,
    pub has_transfer_fee: bool,
}

/// Off-chain token metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMetadata {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MintDecodeError {
    #[error("account owned by {0}, not a token program")]
    NotATokenProgram(Pubkey),
    #[error("mint data too short: {0} bytes")]
    TooShort(usize),
    #[error("mint not initialized")]
    Uninitialized,
}

/// Decode a mint account owned by either token program
pub fn decode_mint(owner: &Pubkey, data: &[u8]) -> Result<MintAccount, MintDecodeError> {
    let is_token_2022 = *owner == TOKEN_2022_PROGRAM_ID;
    if !is_token_2022 && *owner != spl_token::id() {
        return Err(MintDecodeError::NotATokenProgram(*owner));
    }
    if data.len() < spl_token::state::Mint::LEN {
        return Err(MintDecodeError::TooShort(data.len()));
    }

    let base = spl_token::state::Mint::unpack_from_slice(&data[..spl_token::state::Mint::LEN])
        .map_err(|_| MintDecodeError::Uninitialized)?;
    if !base.is_initialized {
        return Err(MintDecodeError::Uninitialized);
    }

    let has_transfer_fee =
        is_token_2022 && extension_types(data).contains(&EXTENSION_TRANSFER_FEE_CONFIG);

    Ok(MintAccount {
        decimals: base.decimals,
        mint_authority: Option::from(base.mint_authority),
        freeze_authority: Option::from(base.freeze_authority),
        is_token_2022,
        has_transfer_fee,
    })
}

/// Extension type ids from a Token-2022 TLV area
fn extension_types(data: &[u8]) -> Vec<u16> {
    let mut types = Vec::new();
    let mut offset = ACCOUNT_TYPE_OFFSET + 1;
    while offset + 4 <= data.len() {
        let ty = u16::from_le_bytes([data[offset], data[offset + 1]]);
        let len = u16::from_le_bytes([data[offset + 2], data[offset + 3]]) as usize;
        if ty == 0 {
            break;
        }
        types.push(ty);
        offset += 4 + len;
    }
    types
}

/// Where mint facts come from
#[async_trait]
pub trait MintSource: Send + Sync {
    async fn get_mint(&self, mint: &Pubkey) -> Result<MintAccount>;

    /// Best effort; `None` on any failure
    async fn get_metadata(&self, _mint: &Pubkey) -> Option<TokenMetadata> {
        None
    }
}

/// Mint source backed by the RPC pool and an HTTP token list
pub struct RpcMintSource {
    pool: Arc<RpcPool>,
    http: reqwest::Client,
    token_api_url: Option<String>,
}

impl RpcMintSource {
    pub fn new(pool: Arc<RpcPool>, token_api_url: Option<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build token metadata HTTP client")?;
        Ok(Self {
            pool,
            http,
            token_api_url,
        })
    }
}

#[async_trait]
impl MintSource for RpcMintSource {
    #[instrument(skip(self))]
    async fn get_mint(&self, mint: &Pubkey) -> Result<MintAccount> {
        let address = *mint;
        let account = self
            .pool
            .with_failover(
                move |handle| async move {
                    handle
                        .client
                        .get_account(&address)
                        .await
                        .map_err(|e| RpcManagerError::from_client_error(e, &handle.url))
                },
                self.pool.config().failover_retries,
            )
            .await
            .with_context(|| format!("failed to fetch mint account {}", address))?;

        decode_mint(&account.owner, &account.data)
            .with_context(|| format!("failed to decode mint {}", address))
    }

    async fn get_metadata(&self, mint: &Pubkey) -> Option<TokenMetadata> {
        let base = self.token_api_url.as_deref()?;
        let url = format!("{}/{}", base.trim_end_matches('/'), mint);

        let response = match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(mint = %mint, status = %resp.status(), "Token metadata not available");
                return None;
            }
            Err(e) => {
                debug!(mint = %mint, error = %e, "Token metadata lookup failed");
                return None;
            }
        };

        match response.json::<TokenMetadata>().await {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!(mint = %mint, error = %e, "Token metadata did not parse");
                None
            }
        }
    }
}

/// In-memory mint source for offline scoring and tests
#[derive(Debug, Default)]
pub struct StaticMintSource {
    mints: HashMap<Pubkey, MintAccount>,
    metadata: HashMap<Pubkey, TokenMetadata>,
    calls: AtomicUsize,
}

impl StaticMintSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mint(mut self, mint: Pubkey, account: MintAccount) -> Self {
        self.mints.insert(mint, account);
        self
    }

    pub fn with_symbol(mut self, mint: Pubkey, symbol: &str) -> Self {
        self.metadata.insert(
            mint,
            TokenMetadata {
                symbol: Some(symbol.to_string()),
                name: None,
            },
        );
        self
    }

    /// Number of `get_mint` calls served
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MintSource for StaticMintSource {
    async fn get_mint(&self, mint: &Pubkey) -> Result<MintAccount> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.mints
            .get(mint)
            .cloned()
            .with_context(|| format!("mint {} not found", mint))
    }

    async fn get_metadata(&self, mint: &Pubkey) -> Option<TokenMetadata> {
        self.metadata.get(mint).cloned()
    }
}

/// Safety facts for one side of a swap
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSafetyInfo {
    pub mint: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub has_freeze_authority: bool,
    pub has_mint_authority: bool,
    pub is_token_2022: bool,
    pub has_transfer_fee: bool,
    pub decimals: u8,
    pub is_known_token: bool,
    pub is_blacklisted: bool,
    pub is_whitelisted: bool,
    /// The mint account could not be read; authority flags are unknown
    #[serde(default)]
    pub lookup_failed: bool,
}

impl TokenSafetyInfo {
    fn from_parts(
        mint: &str,
        account: &MintAccount,
        metadata: Option<TokenMetadata>,
        policy: &RiskPolicy,
    ) -> Self {
        let metadata = metadata.unwrap_or_default();
        let whitelisted = policy.is_allowlisted(mint);
        let symbol = metadata
            .symbol
            .or_else(|| policy.known_symbol(mint).map(str::to_string));

        Self {
            mint: mint.to_string(),
            is_known_token: whitelisted || symbol.is_some(),
            symbol,
            name: metadata.name,
            has_freeze_authority: account.freeze_authority.is_some(),
            has_mint_authority: account.mint_authority.is_some(),
            is_token_2022: account.is_token_2022,
            has_transfer_fee: account.has_transfer_fee,
            decimals: account.decimals,
            is_blacklisted: false,
            is_whitelisted: whitelisted,
            lookup_failed: false,
        }
    }

    fn blacklisted(mint: &str) -> Self {
        Self {
            mint: mint.to_string(),
            is_blacklisted: true,
            ..Default::default()
        }
    }

    fn unavailable(mint: &str, policy: &RiskPolicy) -> Self {
        Self {
            mint: mint.to_string(),
            symbol: policy.known_symbol(mint).map(str::to_string),
            is_whitelisted: policy.is_allowlisted(mint),
            lookup_failed: true,
            ..Default::default()
        }
    }

    /// Not vetted by the allowlist, or nothing could be learned about it
    pub fn is_unknown(&self) -> bool {
        !self.is_whitelisted || self.lookup_failed
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    info: TokenSafetyInfo,
    fetched_at: Instant,
}

/// Token facts with a per-mint TTL cache
pub struct TokenSafetyChecker {
    source: Arc<dyn MintSource>,
    policy: Arc<RiskPolicy>,
    cache: DashMap<Pubkey, CachedToken>,
    ttl: Duration,
}

impl TokenSafetyChecker {
    pub fn new(source: Arc<dyn MintSource>, policy: Arc<RiskPolicy>) -> Self {
        let ttl = Duration::from_secs(policy.token_cache_ttl_secs);
        Self {
            source,
            policy,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Safety facts for `mint`. Never fails: lookup errors yield an "unknown" record.
    pub async fn check(&self, mint: &Pubkey) -> TokenSafetyInfo {
        let key = mint.to_string();
        if self.policy.is_denylisted(&key) {
            return TokenSafetyInfo::blacklisted(&key);
        }

        let cached = self
            .cache
            .get(mint)
            .map(|entry| (entry.info.clone(), entry.fetched_at));
        if let Some((info, fetched_at)) = cached {
            if fetched_at.elapsed() < self.ttl {
                return info;
            }
            self.cache.remove(mint);
        }

        let (account, metadata) =
            tokio::join!(self.source.get_mint(mint), self.source.get_metadata(mint));

        match account {
            Ok(account) => {
                let info = TokenSafetyInfo::from_parts(&key, &account, metadata, &self.policy);
                self.cache.insert(
                    *mint,
                    CachedToken {
                        info: info.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                info
            }
            Err(e) => {
                warn!(mint = %key, error = %e, "Mint lookup failed, treating token as unknown");
                TokenSafetyInfo::unavailable(&key, &self.policy)
            }
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn invalidate(&self, mint: &Pubkey) {
        self.cache.remove(mint);
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}
