//! Audit Log
//!
//! Append-only diagnostic trail. Entries are mirrored to `tracing` and kept
//! in an [`AuditSink`]. Nothing in the controller or scheduler reads them
//! back; the trail exists for observability only.

use ::async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use uuid::Uuid;
use vigil_core::{AuditEntry, AuditLevel, ExecutionId, StorageError, VigilResult};

/// Storage for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> VigilResult<()>;

    /// Entries of one execution, oldest first.
    async fn list_for_execution(&self, execution_id: ExecutionId) -> VigilResult<Vec<AuditEntry>>;
}

/// In-memory sink. Clones share entries.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAuditSink {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, entry: &AuditEntry) -> VigilResult<()> {
        let mut entries = self.entries.write().map_err(|_| StorageError::LockPoisoned)?;
        entries.push(entry.clone());
        Ok(())
    }

    async fn list_for_execution(&self, execution_id: ExecutionId) -> VigilResult<Vec<AuditEntry>> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries
            .iter()
            .filter(|e| e.execution_id == Some(execution_id))
            .cloned()
            .collect())
    }
}

/// Front end to an [`AuditSink`] with a minimum level.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    min_level: AuditLevel,
    session_id: Option<Uuid>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>, min_level: AuditLevel) -> Self {
        Self {
            sink,
            min_level,
            session_id: None,
        }
    }

    /// Tag every entry with a session id.
    pub fn with_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Append an entry. Entries below the minimum level are dropped; a sink
    /// failure is logged and otherwise ignored.
    pub async fn record(
        &self,
        execution_id: Option<ExecutionId>,
        level: AuditLevel,
        event: &str,
        payload: Value,
    ) {
        if level < self.min_level {
            return;
        }
        let exec = execution_id.map(|id| id.to_string()).unwrap_or_default();
        match level {
            AuditLevel::Debug => tracing::debug!(execution_id = %exec, %payload, "{}", event),
            AuditLevel::Info => tracing::info!(execution_id = %exec, %payload, "{}", event),
            AuditLevel::Warn => tracing::warn!(execution_id = %exec, %payload, "{}", event),
            AuditLevel::Error => tracing::error!(execution_id = %exec, %payload, "{}", event),
        }

        let entry = AuditEntry {
            entry_id: Uuid::now_v7(),
            execution_id,
            session_id: self.session_id,
            level,
            event: event.to_string(),
            payload,
            created_at: Utc::now(),
        };
        if let Err(err) = self.sink.append(&entry).await {
            tracing::warn!(event, error = %err, "audit sink append failed");
        }
    }

    pub async fn info(&self, execution_id: ExecutionId, event: &str, payload: Value) {
        self.record(Some(execution_id), AuditLevel::Info, event, payload).await
    }

    pub async fn warn(&self, execution_id: ExecutionId, event: &str, payload: Value) {
        self.record(Some(execution_id), AuditLevel::Warn, event, payload).await
    }

    pub async fn error(&self, execution_id: Option<ExecutionId>, event: &str, payload: Value) {
        self.record(execution_id, AuditLevel::Error, event, payload).await
    }

    pub async fn trail(&self, execution_id: ExecutionId) -> VigilResult<Vec<AuditEntry>> {
        self.sink.list_for_execution(execution_id).await
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("min_level", &self.min_level)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_entries_filtered_by_level_and_execution() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let log = AuditLog::new(sink.clone(), AuditLevel::Info);
        let exec = Uuid::now_v7();

        log.record(Some(exec), AuditLevel::Debug, "noise", json!({})).await;
        log.info(exec, "execution.started", json!({"goal": "g"})).await;
        log.warn(Uuid::now_v7(), "other", json!({})).await;
        log.error(Some(exec), "step.failed", json!({"error": "boom"})).await;

        assert_eq!(sink.len(), 3);
        let trail = log.trail(exec).await.unwrap();
        let events: Vec<_> = trail.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(events, vec!["execution.started", "step.failed"]);
        assert_eq!(trail[1].level, AuditLevel::Error);
    }

    #[tokio::test]
    async fn test_session_is_stamped() {
        let sink = Arc::new(InMemoryAuditSink::new());
        let session = Uuid::now_v7();
        let log = AuditLog::new(sink, AuditLevel::Debug).with_session(session);
        let exec = Uuid::now_v7();
        log.info(exec, "e", Value::Null).await;
        assert_eq!(log.trail(exec).await.unwrap()[0].session_id, Some(session));
    }
}
