//! Best-effort append-only audit log (spec §6, "Audit log").
//!
//! Loss is tolerated and ordering per subject is not required, so the
//! reference implementation never blocks a caller on a full buffer — it
//! mirrors the "drop on full buffer" discipline spec §5 describes for the
//! in-memory status subscriber fanout.

use crate::timestamp::UnixMillis;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: UnixMillis,
    pub subject: String,
    pub kind: String,
    pub data: Value,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, event: AuditEvent);
}

/// Bounded in-memory audit log; oldest entries are dropped once `capacity`
/// is exceeded, consistent with the "loss is tolerated" contract.
#[derive(Debug)]
pub struct InMemoryAuditLog {
    capacity: usize,
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit log mutex poisoned").clone()
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, event: AuditEvent) {
        let mut events = self.events.lock().expect("audit log mutex poisoned");
        events.push(event);
        let overflow = events.len().saturating_sub(self.capacity);
        if overflow > 0 {
            events.drain(0..overflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn drops_oldest_beyond_capacity() {
        let log = InMemoryAuditLog::new(2);
        for i in 0..5 {
            log.append(AuditEvent {
                ts: UnixMillis(i),
                subject: "job:1".into(),
                kind: "test".into(),
                data: json!({ "i": i }),
            })
            .await;
        }
        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].ts.0, 3);
        assert_eq!(snapshot[1].ts.0, 4);
    }
}
