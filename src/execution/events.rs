//! Execution timeline events and the sinks that persist them

use crate::observability::CorrelationId;
use crate::types::SubmissionMode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

/// Orchestrator state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    QuoteReady,
    RiskGate,
    Build,
    Submit,
    Classify,
    Success,
    Failed,
    Aborted,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::QuoteReady => "QUOTE_READY",
            ExecutionState::RiskGate => "RISK_GATE",
            ExecutionState::Build => "BUILD",
            ExecutionState::Submit => "SUBMIT",
            ExecutionState::Classify => "CLASSIFY",
            ExecutionState::Success => "SUCCESS",
            ExecutionState::Failed => "FAILED",
            ExecutionState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Success | ExecutionState::Failed | ExecutionState::Aborted
        )
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ExecutionStarted,
    RiskAssessed,
    RiskBlocked,
    TransactionBuilt,
    SubmissionStarted,
    SubmissionConfirmed,
    SubmissionFailed,
    ErrorClassified,
    RetryScheduled,
    RequoteScheduled,
    QuoteRefreshed,
    ExecutionSucceeded,
    ExecutionFailed,
    ExecutionAborted,
}

/// One timestamped transition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub execution_id: CorrelationId,
    pub swap_key: String,
    pub event_type: EventType,
    /// State entered by this transition
    pub state: ExecutionState,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SubmissionMode>,
    /// Priority fee (micro-lamports per CU) or relay tip (lamports), per `mode`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Structured payload (assessment, receipt)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ExecutionEvent {
    pub fn new(
        execution_id: CorrelationId,
        swap_key: impl Into<String>,
        event_type: EventType,
        state: ExecutionState,
        attempt: u32,
    ) -> Self {
        Self {
            execution_id,
            swap_key: swap_key.into(),
            event_type,
            state,
            timestamp: Utc::now(),
            attempt,
            endpoint: None,
            mode: None,
            fee: None,
            error_code: None,
            message: None,
            data: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_mode(mut self, mode: SubmissionMode, fee: Option<u64>) -> Self {
        self.mode = Some(mode);
        self.fee = fee;
        self
    }

    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => self.data = Some(value),
            Err(e) => warn!(error = %e, "Failed to serialize event payload"),
        }
        self
    }
}

/// Append-only audit sink.
///
/// The orchestrator treats it as fire-and-forget: errors are logged, never
/// propagated into the execution.
#[async_trait]
pub trait ExecutionEventSink: Send + Sync {
    async fn record(&self, event: &ExecutionEvent) -> anyhow::Result<()>;
}

/// Writes every event as a structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl ExecutionEventSink for TracingEventSink {
    async fn record(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        info!(
            execution_id = %event.execution_id,
            swap_key = %event.swap_key,
            event = ?event.event_type,
            state = %event.state,
            attempt = event.attempt,
            endpoint = event.endpoint.as_deref().unwrap_or("-"),
            error_code = event.error_code.as_deref().unwrap_or("-"),
            "Execution event"
        );
        Ok(())
    }
}

/// Keeps events in memory
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().clone()
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.events.lock().iter().map(|e| e.event_type).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

#[async_trait]
impl ExecutionEventSink for MemoryEventSink {
    async fn record(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// One JSON object per line, appended to a file
#[derive(Debug)]
pub struct JsonlEventSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlEventSink {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening event log {}", path.display()))?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ExecutionEventSink for JsonlEventSink {
    async fn record(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
