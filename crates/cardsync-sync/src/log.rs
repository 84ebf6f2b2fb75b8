use std::sync::Arc;
use std::time::Instant;

use cardsync_core::{LogStatus, OperationId, SyncLogEntry};
use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

use crate::store::CardStore;

/// Writes the durable, append-only events of one operation.
///
/// A failed log write is reported through `tracing` and never fails the
/// operation that produced it.
#[derive(Clone)]
pub struct SyncLogger {
    store: Arc<dyn CardStore>,
    operation_id: OperationId,
    operation_type: String,
    started: Instant,
}

impl SyncLogger {
    pub fn new(store: Arc<dyn CardStore>, operation_id: OperationId, operation_type: impl Into<String>) -> Self {
        Self {
            store,
            operation_id,
            operation_type: operation_type.into(),
            started: Instant::now(),
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub async fn started(&self, details: JsonValue) {
        self.write(LogStatus::Started, details, None).await;
    }

    pub async fn warning(&self, details: JsonValue) {
        self.write(LogStatus::Warning, details, None).await;
    }

    pub async fn success(&self, details: JsonValue) {
        self.write(LogStatus::Success, details, Some(self.elapsed_ms())).await;
    }

    pub async fn error(&self, details: JsonValue) {
        self.write(LogStatus::Error, details, Some(self.elapsed_ms())).await;
    }

    fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }

    async fn write(&self, status: LogStatus, details: JsonValue, duration_ms: Option<i64>) {
        let entry = SyncLogEntry {
            id: Uuid::new_v4(),
            operation_id: self.operation_id,
            operation_type: self.operation_type.clone(),
            status,
            details,
            duration_ms,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.append_log(&entry).await {
            warn!(
                operation_id = %self.operation_id,
                operation_type = %self.operation_type,
                status = status.as_str(),
                error = %err,
                "failed to persist sync log entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn terminal_entries_carry_a_duration() {
        let store = Arc::new(MemoryStore::new());
        let op = OperationId::new();
        let logger = SyncLogger::new(store.clone(), op, "harvest");
        logger.started(json!({"set": "base-set"})).await;
        logger.success(json!({"cards": 102})).await;

        let logs = store.list_logs(Some(op), 10).await.unwrap();
        assert_eq!(logs.len(), 2);
        let started = logs.iter().find(|e| e.status == LogStatus::Started).unwrap();
        let success = logs.iter().find(|e| e.status == LogStatus::Success).unwrap();
        assert!(started.duration_ms.is_none());
        assert!(success.duration_ms.is_some());
        assert_eq!(success.details["cards"], 102);
        assert_eq!(success.operation_type, "harvest");
    }
}
