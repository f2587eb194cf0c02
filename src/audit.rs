use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;

use crate::context::TokenUsage;

static TRACE_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn generate_trace_id() -> String {
    let seq = TRACE_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = now_millis();
    format!("mr-{ts_ms}-{seq}")
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Outcome of one forwarding try against one candidate.
#[derive(Clone, Debug, Serialize)]
pub struct AttemptRecord {
    pub provider_id: String,
    pub provider_name: String,
    /// 1-based attempt index within this candidate.
    pub attempt: u32,
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub first_byte_ms: Option<u64>,
    pub total_ms: Option<u64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Success,
    Exhausted,
    Rejected,
    Cancelled,
}

/// The terminal, write-once record of one request lifecycle. Headers are
/// redacted before the entry is constructed; raw credentials never reach
/// a sink.
#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub trace_id: String,
    pub request_time_ms: u64,
    pub caller_id: String,
    pub caller_name: String,
    pub requested_model: String,
    pub target_model: Option<String>,
    pub provider_id: Option<String>,
    pub provider_name: Option<String>,
    pub outcome: LogOutcome,
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub attempts: Vec<AttemptRecord>,
    pub usage: TokenUsage,
    pub first_byte_ms: Option<u64>,
    pub total_ms: Option<u64>,
    pub request_headers: BTreeMap<String, String>,
}

/// Append-only log sink. Failure is non-fatal: implementations report
/// errors through their own channels and the request path never sees them.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, entry: LogEntry);
}

/// Default sink: one structured event per entry on a dedicated target.
#[derive(Debug, Default)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn append(&self, entry: LogEntry) {
        match serde_json::to_string(&entry) {
            Ok(json) => tracing::info!(target: "modelrelay::audit", entry = %json),
            Err(err) => {
                tracing::warn!(target: "modelrelay::audit", error = %err, "failed to serialize audit entry")
            }
        }
    }
}

/// In-memory sink for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn append(&self, entry: LogEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry);
    }
}

/// Emits completed entries without blocking the caller's response path.
#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn LogSink>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    /// Fire-and-forget emission. The spawned task isolates sink failures
    /// (including panics) from the request that produced the entry.
    pub fn emit(&self, entry: LogEntry) {
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            sink.append(entry).await;
        });
    }
}
