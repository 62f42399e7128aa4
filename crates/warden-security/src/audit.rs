//! Audit sink implementations.
//!
//! Append-only, ordered audit trails:
//! - [`InMemoryAuditSink`] keeps one log per request, each behind its own lock,
//!   so concurrent requests never contend on a global ordering lock
//! - [`JsonlAuditSink`] appends one JSON object per line to a file and can be
//!   reopened and queried after a restart
//!
//! Both assign each event a per-request sequence number on append. No updates
//! or deletes are exposed. The in-memory sink retains every event for the life
//! of the process and is meant for tests and short-lived deployments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use warden_types::actions::{AuditEvent, AuditEventKind, AuditFilter, RequestId};
use warden_types::errors::WardenError;
use warden_types::traits::AuditSink;

type RequestLog = Arc<Mutex<Vec<AuditEvent>>>;

/// In-memory audit sink.
#[derive(Default)]
pub struct InMemoryAuditSink {
    logs: RwLock<HashMap<RequestId, RequestLog>>,
}

impl InMemoryAuditSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct requests with at least one event.
    pub async fn request_count(&self) -> usize {
        self.logs.read().await.len()
    }

    async fn log_for(&self, request_id: RequestId) -> RequestLog {
        if let Some(log) = self.logs.read().await.get(&request_id) {
            return log.clone();
        }
        self.logs
            .write()
            .await
            .entry(request_id)
            .or_default()
            .clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, mut event: AuditEvent) -> Result<u64, WardenError> {
        let log = self.log_for(event.request_id).await;
        let mut events = log.lock().await;
        let sequence = events.len() as u64;
        event.sequence = sequence;
        debug!(request_id = %event.request_id, sequence, kind = ?event.kind, "audit event");
        events.push(event);
        Ok(sequence)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, WardenError> {
        let logs: Vec<RequestLog> = {
            let map = self.logs.read().await;
            match filter.request_id {
                Some(id) => map.get(&id).cloned().into_iter().collect(),
                None => map.values().cloned().collect(),
            }
        };

        let mut results = Vec::new();
        for log in logs {
            let events = log.lock().await;
            results.extend(events.iter().filter(|e| filter.matches(e)).cloned());
        }
        Ok(finish_query(results, filter))
    }
}

struct JsonlState {
    file: tokio::fs::File,
    /// Next sequence number of each request that has not reached its terminal event.
    sequences: HashMap<RequestId, u64>,
}

/// Durable JSON-lines audit sink.
///
/// Writes are serialized through one file handle; each line is flushed and
/// synced to disk with `sync_data` before `append` returns. Sequence state is
/// only kept for open requests and is dropped once a request's terminal event
/// is written.
pub struct JsonlAuditSink {
    path: PathBuf,
    state: Mutex<JsonlState>,
}

impl JsonlAuditSink {
    /// Open (or create) an audit file, resuming sequence numbers from any
    /// events already in it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, WardenError> {
        let path = path.as_ref().to_path_buf();

        let mut sequences = HashMap::new();
        let mut finished = Vec::new();
        for event in read_events(&path).await? {
            if event.kind == AuditEventKind::Terminal {
                finished.push(event.request_id);
            }
            let next = sequences.entry(event.request_id).or_insert(0);
            *next = (*next).max(event.sequence + 1);
        }
        for id in finished {
            sequences.remove(&id);
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| WardenError::Audit(format!("failed to open {}: {e}", path.display())))?;

        Ok(Self {
            path,
            state: Mutex::new(JsonlState { file, sequences }),
        })
    }

    /// Path of the audit file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of requests with events but no terminal event yet.
    pub async fn open_requests(&self) -> usize {
        self.state.lock().await.sequences.len()
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, mut event: AuditEvent) -> Result<u64, WardenError> {
        let mut state = self.state.lock().await;
        let sequence = state.sequences.get(&event.request_id).copied().unwrap_or(0);
        event.sequence = sequence;

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        state
            .file
            .write_all(line.as_bytes())
            .await
            .map_err(|e| WardenError::Audit(format!("failed to write audit event: {e}")))?;
        state
            .file
            .flush()
            .await
            .map_err(|e| WardenError::Audit(format!("failed to flush audit file: {e}")))?;
        state
            .file
            .sync_data()
            .await
            .map_err(|e| WardenError::Audit(format!("failed to sync audit file: {e}")))?;

        if event.kind == AuditEventKind::Terminal {
            state.sequences.remove(&event.request_id);
        } else {
            state.sequences.insert(event.request_id, sequence + 1);
        }
        Ok(sequence)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>, WardenError> {
        // Hold the write lock so a half-written line is never read.
        let _guard = self.state.lock().await;
        let events = read_events(&self.path).await?;
        let results = events.into_iter().filter(|e| filter.matches(e)).collect();
        Ok(finish_query(results, filter))
    }
}

async fn read_events(path: &Path) -> Result<Vec<AuditEvent>, WardenError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(WardenError::Audit(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };

    let mut events = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(line = lineno + 1, error = %e, "skipping unreadable audit line"),
        }
    }
    Ok(events)
}

/// Order query results and apply the limit.
fn finish_query(mut results: Vec<AuditEvent>, filter: &AuditFilter) -> Vec<AuditEvent> {
    results.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.request_id.cmp(&b.request_id))
            .then_with(|| a.sequence.cmp(&b.sequence))
    });
    if filter.request_id.is_some() {
        // Within one request, sequence order is authoritative.
        results.sort_by_key(|e| e.sequence);
    }
    if let Some(limit) = filter.limit {
        results.truncate(limit);
    }
    results
}
