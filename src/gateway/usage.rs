//! Usage tracking via the UsageSink trait.
//!
//! The gateway logs every provider attempt through a UsageSink, which keeps it
//! independent of where the records end up:
//! - CLI runs use TracingUsageSink or JsonlUsageSink
//! - Tests use NoopUsageSink or their own counting sink

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::patterns::StageKind;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of one provider attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderCallRecord {
    /// Pipeline run this attempt belongs to.
    pub run_id: Option<Uuid>,
    pub family: String,
    pub model: String,
    pub stage: StageKind,
    /// One-based attempt number within the call.
    pub attempt: u32,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    /// Backend request ID (for debugging).
    pub request_id: Option<String>,
    pub output_chars: usize,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(family: impl Into<String>, model: impl Into<String>, stage: StageKind) -> Self {
        Self {
            run_id: None,
            family: family.into(),
            model: model.into(),
            stage,
            attempt: 1,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            request_id: None,
            output_chars: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn output_chars(mut self, chars: usize) -> Self {
        self.output_chars = chars;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider attempt. Fire-and-forget: failures are logged, not propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// Discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Emits each record as a `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::info!(
            target: "ensemble::usage",
            family = %record.family,
            model = %record.model,
            stage = %record.stage,
            attempt = record.attempt,
            latency_ms = record.latency_ms,
            status = record.status.as_str(),
            error_code = record.error_code.as_deref().unwrap_or(""),
            "provider call"
        );
    }
}

// =============================================================================
// JSONL file sink
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("usage worker failed: {0}")]
    Join(String),
}

/// Writes one JSON object per line from a background thread.
#[derive(Clone)]
pub struct JsonlUsageSink {
    sender: mpsc::Sender<ProviderCallRecord>,
}

/// Handle to the writer thread; join it after dropping every sink clone to flush.
pub struct UsageWorker {
    handle: Option<std::thread::JoinHandle<Result<(), UsageError>>>,
}

impl UsageWorker {
    pub fn join(mut self) -> Result<(), UsageError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(UsageError::Join("usage worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlUsageSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, UsageWorker), UsageError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<ProviderCallRecord>();
        let handle = std::thread::spawn(move || write_usage_loop(file, receiver));
        Ok((
            Self { sender },
            UsageWorker {
                handle: Some(handle),
            },
        ))
    }
}

#[async_trait]
impl UsageSink for JsonlUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        if self.sender.send(record).is_err() {
            tracing::warn!("usage log writer has stopped; dropping record");
        }
    }
}

fn write_usage_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<ProviderCallRecord>,
) -> Result<(), UsageError> {
    let mut writer = BufWriter::new(file);
    for record in receiver {
        let line = serde_json::to_string(&record).map_err(|e| UsageError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}
