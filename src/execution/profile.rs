use super::retry::RetryStrategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Named retry budget chosen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionProfile {
    /// Balanced
    #[default]
    Auto,
    /// Few quick retries, gives up early
    Fast,
    /// Patient, long backoff, more requotes
    Cheap,
}

impl ExecutionProfile {
    pub fn strategy(&self) -> RetryStrategy {
        match self {
            ExecutionProfile::Auto => RetryStrategy {
                max_retries: 3,
                max_requotes: 2,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                backoff_multiplier: 2.0,
                jitter: Duration::from_millis(250),
            },
            ExecutionProfile::Fast => RetryStrategy {
                max_retries: 2,
                max_requotes: 1,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
                backoff_multiplier: 1.5,
                jitter: Duration::from_millis(100),
            },
            ExecutionProfile::Cheap => RetryStrategy {
                max_retries: 5,
                max_requotes: 3,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
                backoff_multiplier: 2.0,
                jitter: Duration::from_millis(500),
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionProfile::Auto => "AUTO",
            ExecutionProfile::Fast => "FAST",
            ExecutionProfile::Cheap => "CHEAP",
        }
    }
}

impl fmt::Display for ExecutionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUTO" => Ok(ExecutionProfile::Auto),
            "FAST" => Ok(ExecutionProfile::Fast),
            "CHEAP" => Ok(ExecutionProfile::Cheap),
            other => Err(format!("unknown execution profile '{}'", other)),
        }
    }
}
