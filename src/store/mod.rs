//! Run archive
//!
//! Persistence seam for finished runs. The engine only depends on this
//! narrow interface; the in-memory implementation is the default and a
//! database-backed one can replace it without touching the engine.

use crate::error::Result;
use crate::models::{LogEntry, Plan, RunOutcome, StepResult, TaskInput, ValidationVerdict};
use crate::trace::compute_task_hash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Everything needed to audit one finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub entity_id: String,

    pub task: Arc<TaskInput>,
    pub task_hash: String,
    pub final_plan: Arc<Plan>,
    pub step_results: Arc<Vec<StepResult>>,
    pub verdicts: Arc<Vec<ValidationVerdict>>,
    /// Full execution log at the moment the run went terminal.
    pub log: Arc<Vec<LogEntry>>,

    pub outcome: RunOutcome,
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Trait for run persistence.
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    async fn persist_record(&self, record: RunRecord) -> Result<()>;
    async fn load_record(&self, run_id: Uuid) -> Result<Option<RunRecord>>;
    async fn list_for_entity(&self, entity_id: &str) -> Result<Vec<Uuid>>;
}

/// In-memory run archive.
pub struct InMemoryRunStore {
    records: Arc<RwLock<HashMap<Uuid, RunRecord>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Recompute the task hash and compare with the stored one.
    pub async fn verify_integrity(&self, run_id: Uuid) -> Result<bool> {
        let records = self.records.read().await;

        if let Some(record) = records.get(&run_id) {
            let current_hash = compute_task_hash(&record.task);
            Ok(current_hash == record.task_hash)
        } else {
            Ok(false)
        }
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn persist_record(&self, record: RunRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(record.run_id, record);
        Ok(())
    }

    async fn load_record(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&run_id).cloned())
    }

    /// All run ids for an entity, sorted by finish time ascending.
    async fn list_for_entity(&self, entity_id: &str) -> Result<Vec<Uuid>> {
        let records = self.records.read().await;

        let mut items: Vec<_> = records
            .iter()
            .filter(|(_, record)| record.entity_id == entity_id)
            .map(|(id, record)| (*id, record.finished_at))
            .collect();

        items.sort_by_key(|(_, finished_at)| *finished_at);

        Ok(items.into_iter().map(|(id, _)| id).collect())
    }
}

//
// ================= Tests =================
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureReason;

    fn record(entity_id: &str) -> RunRecord {
        let task = Arc::new(TaskInput {
            entity_id: entity_id.to_string(),
            category: "document".into(),
            document_name: "invoice.txt".into(),
            payload: serde_json::json!({"content": "Invoice"}),
        });
        let task_hash = compute_task_hash(&task);

        RunRecord {
            run_id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            task,
            task_hash,
            final_plan: Arc::new(Plan {
                category: "document".into(),
                steps: vec![],
            }),
            step_results: Arc::new(vec![]),
            verdicts: Arc::new(vec![]),
            log: Arc::new(vec![]),
            outcome: RunOutcome::Failed {
                reason: FailureReason::MaxRetriesExceeded,
                last_verdict: None,
            },
            retry_count: 3,
            created_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let store = InMemoryRunStore::new();
        let record = record("entity_1");
        let run_id = record.run_id;

        store.persist_record(record).await.unwrap();

        let loaded = store.load_record(run_id).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, run_id);
        assert_eq!(loaded.retry_count, 3);

        assert!(store.load_record(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_for_entity_filters_and_sorts() {
        let store = InMemoryRunStore::new();

        let first = record("entity_1");
        let second = record("entity_1");
        let other = record("entity_2");
        let first_id = first.run_id;
        let second_id = second.run_id;

        store.persist_record(first).await.unwrap();
        store.persist_record(second).await.unwrap();
        store.persist_record(other).await.unwrap();

        let listed = store.list_for_entity("entity_1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&first_id));
        assert!(listed.contains(&second_id));
    }

    #[tokio::test]
    async fn test_integrity_check() {
        let store = InMemoryRunStore::new();
        let mut tampered = record("entity_1");
        let good = record("entity_1");
        let good_id = good.run_id;
        let tampered_id = tampered.run_id;

        tampered.task_hash = "not-the-real-hash".into();

        store.persist_record(good).await.unwrap();
        store.persist_record(tampered).await.unwrap();

        assert!(store.verify_integrity(good_id).await.unwrap());
        assert!(!store.verify_integrity(tampered_id).await.unwrap());
        assert!(!store.verify_integrity(Uuid::new_v4()).await.unwrap());
    }
}
