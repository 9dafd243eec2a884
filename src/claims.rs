//! Claim Manager — table-level refresh claim lifecycle (spec §4.8).
//! Grounded on the reference implementation's `src/catalog.rs` claim-row
//! CRUD idiom (advisory-lock-backed row claiming there; a plain
//! conditional-insert/update over `refresh_claims` here, since this engine
//! has no single backend process to hold a Postgres advisory lock across).
//!
//! A claim is acquired with [`try_acquire`], refreshed on a cadence by a
//! background task started with [`spawn_heartbeat`], and released by
//! dropping (or explicitly calling [`ClaimGuard::release`]) when the
//! refresh finishes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::EngineError;
use crate::metadata::MetadataStore;
use crate::model::QualifiedName;

/// An acquired table-level claim. Call [`release`](ClaimGuard::release)
/// when the refresh is done; if dropped without releasing, the claim is
/// left for [`MetadataStore::expire_stale_claims`] to reap once its
/// heartbeat goes stale — `Drop` cannot await the metadata store.
pub struct ClaimGuard {
    store: Arc<dyn MetadataStore>,
    table: QualifiedName,
    worker_id: String,
    released: bool,
}

impl ClaimGuard {
    pub async fn release(mut self) -> Result<(), EngineError> {
        self.store.release_claim(&self.table, &self.worker_id).await?;
        self.released = true;
        Ok(())
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                table = %self.table,
                worker_id = %self.worker_id,
                "claim guard dropped without release; relying on heartbeat expiry"
            );
        }
    }
}

/// Try to claim `table` for `worker_id`. Returns `None` if another worker
/// already holds it (spec §4.7 step 4's `INSERT ... ON CONFLICT DO
/// NOTHING` semantics, surfaced as a non-error outcome).
pub async fn try_acquire(
    store: Arc<dyn MetadataStore>,
    table: &QualifiedName,
    worker_id: &str,
    timeout: Duration,
) -> Result<Option<ClaimGuard>, EngineError> {
    let acquired = store.try_claim_table(table, worker_id, timeout, Utc::now()).await?;
    if !acquired {
        return Ok(None);
    }
    Ok(Some(ClaimGuard {
        store,
        table: table.clone(),
        worker_id: worker_id.to_string(),
        released: false,
    }))
}

/// Start a background heartbeat loop for an active claim. Stops when
/// `cancel` fires, when a heartbeat write finds the claim gone (lost to
/// expiry), or when a heartbeat write itself errors — all three are
/// treated as "claim lost" (spec §5's "claim lost mid-refresh"
/// coordination error), since a failed write leaves us unable to tell
/// whether the claim is still ours. Each case cancels the token so the
/// refresh in progress notices via `tokio::select!` and aborts.
pub fn spawn_heartbeat(
    store: Arc<dyn MetadataStore>,
    table: QualifiedName,
    worker_id: String,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            match store.heartbeat_claim(&table, &worker_id, timeout, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(table = %table, worker_id = %worker_id, "heartbeat found claim missing; cancelling refresh");
                    cancel.cancel();
                    return;
                }
                Err(e) => {
                    warn!(table = %table, worker_id = %worker_id, error = %e, "heartbeat write failed; treating claim as lost");
                    cancel.cancel();
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{NewSubtask, RefreshHistoryEntry, RefreshSubtask, SourceSnapshotRow};
    use crate::model::{DynamicTable, TableProperties, TableStatus};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeStore {
        claimed: Mutex<Option<String>>,
        heartbeats: Mutex<u32>,
        notify: Notify,
        fail_heartbeat: Mutex<bool>,
    }

    #[async_trait]
    impl MetadataStore for FakeStore {
        async fn get_table(&self, _name: &QualifiedName) -> Result<Option<DynamicTable>, EngineError> {
            unimplemented!()
        }
        async fn list_active_tables(&self) -> Result<Vec<DynamicTable>, EngineError> {
            unimplemented!()
        }
        async fn create_table(&self, _table: &DynamicTable) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn update_properties(&self, _name: &QualifiedName, _props: &TableProperties) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn set_status(&self, _name: &QualifiedName, _status: TableStatus) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn drop_table(&self, _name: &QualifiedName) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn add_dependency(&self, _d: &QualifiedName, _u: &QualifiedName) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn load_dependency_graph(&self) -> Result<crate::dag::DependencyGraph, EngineError> {
            unimplemented!()
        }
        async fn get_source_snapshots(&self, _table: &QualifiedName) -> Result<Vec<SourceSnapshotRow>, EngineError> {
            unimplemented!()
        }
        async fn advance_source_snapshots(
            &self,
            _table: &QualifiedName,
            _pins: &HashMap<QualifiedName, String>,
            _now: DateTime<Utc>,
        ) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn append_history(&self, _entry: &RefreshHistoryEntry) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn recent_history(&self, _table: &QualifiedName, _limit: i64) -> Result<Vec<RefreshHistoryEntry>, EngineError> {
            unimplemented!()
        }
        async fn enqueue_pending(&self, _table: &QualifiedName, _due_at: DateTime<Utc>, _priority: i32) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn next_due_unclaimed(&self, _now: DateTime<Utc>) -> Result<Option<QualifiedName>, EngineError> {
            unimplemented!()
        }
        async fn try_claim_table(
            &self,
            _table: &QualifiedName,
            worker_id: &str,
            _timeout: Duration,
            _now: DateTime<Utc>,
        ) -> Result<bool, EngineError> {
            let mut claimed = self.claimed.lock().unwrap();
            if claimed.is_some() {
                return Ok(false);
            }
            *claimed = Some(worker_id.to_string());
            Ok(true)
        }
        async fn heartbeat_claim(
            &self,
            _table: &QualifiedName,
            _worker_id: &str,
            _timeout: Duration,
            _now: DateTime<Utc>,
        ) -> Result<bool, EngineError> {
            *self.heartbeats.lock().unwrap() += 1;
            self.notify.notify_one();
            if *self.fail_heartbeat.lock().unwrap() {
                return Err(EngineError::LakeConnection("heartbeat write failed".into()));
            }
            Ok(self.claimed.lock().unwrap().is_some())
        }
        async fn release_claim(&self, _table: &QualifiedName, _worker_id: &str) -> Result<(), EngineError> {
            *self.claimed.lock().unwrap() = None;
            Ok(())
        }
        async fn convert_claim_to_coordinator(
            &self,
            _table: &QualifiedName,
            _worker_id: &str,
            _subtasks_total: i32,
        ) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn expire_stale_claims(&self, _now: DateTime<Utc>) -> Result<Vec<QualifiedName>, EngineError> {
            unimplemented!()
        }
        async fn insert_subtasks(&self, _table: &QualifiedName, _subtasks: &[NewSubtask]) -> Result<Vec<i64>, EngineError> {
            unimplemented!()
        }
        async fn claim_next_subtask(&self, _worker_id: &str, _now: DateTime<Utc>) -> Result<Option<RefreshSubtask>, EngineError> {
            unimplemented!()
        }
        async fn heartbeat_subtask(&self, _id: i64, _worker_id: &str, _now: DateTime<Utc>) -> Result<bool, EngineError> {
            unimplemented!()
        }
        async fn complete_subtask(&self, _id: i64, _location: &str, _now: DateTime<Utc>) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn fail_subtask(&self, _id: i64, _error_message: &str) -> Result<(), EngineError> {
            unimplemented!()
        }
        async fn subtasks_for_refresh(&self, _table: &QualifiedName) -> Result<Vec<RefreshSubtask>, EngineError> {
            unimplemented!()
        }
        async fn sweep_orphaned_subtasks(&self, _stale_before: DateTime<Utc>, _retry_max: u32) -> Result<(), EngineError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn second_claim_attempt_fails_while_held() {
        let store: Arc<dyn MetadataStore> = Arc::new(FakeStore::default());
        let table = QualifiedName::parse("analytics.daily_orders");
        let guard = try_acquire(store.clone(), &table, "worker-a", Duration::from_secs(300))
            .await
            .unwrap()
            .expect("first claim should succeed");

        let second = try_acquire(store.clone(), &table, "worker-b", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(second.is_none());

        guard.release().await.unwrap();
        let third = try_acquire(store.clone(), &table, "worker-b", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn heartbeat_cancels_refresh_when_claim_lost() {
        let store = Arc::new(FakeStore::default());
        let table = QualifiedName::parse("analytics.daily_orders");
        *store.claimed.lock().unwrap() = Some("worker-a".into());
        let cancel = CancellationToken::new();
        let handle = spawn_heartbeat(
            store.clone(),
            table,
            "worker-a".into(),
            Duration::from_millis(5),
            Duration::from_secs(300),
            cancel.clone(),
        );

        // Wait for at least one successful heartbeat before pulling the claim.
        store.notify.notified().await;
        *store.claimed.lock().unwrap() = None;

        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .expect("heartbeat loop should cancel once the claim disappears");
        handle.abort();
    }

    #[tokio::test]
    async fn heartbeat_cancels_refresh_on_write_error() {
        let store = Arc::new(FakeStore::default());
        let table = QualifiedName::parse("analytics.daily_orders");
        *store.claimed.lock().unwrap() = Some("worker-a".into());
        let cancel = CancellationToken::new();
        let handle = spawn_heartbeat(
            store.clone(),
            table,
            "worker-a".into(),
            Duration::from_millis(5),
            Duration::from_secs(300),
            cancel.clone(),
        );

        store.notify.notified().await;
        *store.fail_heartbeat.lock().unwrap() = true;

        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .expect("heartbeat loop should cancel once a write errors, not just retry");
        handle.abort();
    }
}
