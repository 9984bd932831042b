//! Periodic processing of pending inbox entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::ingest::IngestionEngine;
use crate::store::{InboxEntry, InboxState, InboxStore, StoreError, TableStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub picked: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Entries another worker moved out of `pending` first.
    pub skipped: usize,
}

pub struct InboxProcessor {
    inbox: Arc<dyn InboxStore>,
    engine: IngestionEngine,
}

impl InboxProcessor {
    pub fn new(inbox: Arc<dyn InboxStore>, tables: Arc<dyn TableStore>) -> Self {
        Self {
            inbox,
            engine: IngestionEngine::new(tables),
        }
    }

    /// Process every entry that is pending right now, one after another.
    /// A failing entry never stops the scan.
    pub fn scan_once(&self) -> Result<ScanSummary, StoreError> {
        let entries = self.inbox.pending_entries()?;
        let mut summary = ScanSummary {
            picked: entries.len(),
            ..ScanSummary::default()
        };
        if entries.is_empty() {
            tracing::debug!(target = "fleet_control::inbox", "no pending entries");
        }

        for entry in &entries {
            match self.process_entry(entry) {
                Ok(Some(InboxState::Success)) => summary.succeeded += 1,
                Ok(Some(_)) => summary.failed += 1,
                Ok(None) => summary.skipped += 1,
                Err(error) => {
                    tracing::error!(
                        target = "fleet_control::inbox",
                        inbox_id = entry.id,
                        error = %error,
                        "failed to update inbox entry"
                    );
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Drive one entry through `running` to a terminal state. Returns `None`
    /// when the entry was no longer pending.
    pub fn process_entry(&self, entry: &InboxEntry) -> Result<Option<InboxState>, StoreError> {
        if !self.inbox.mark_running(entry.id, Utc::now())? {
            return Ok(None);
        }
        tracing::info!(
            target = "fleet_control::inbox",
            inbox_id = entry.id,
            name = %entry.name,
            "processing inbox entry"
        );

        let (state, log) = match self.engine.ingest(&entry.content) {
            Ok(report) => {
                tracing::info!(
                    target = "fleet_control::inbox",
                    inbox_id = entry.id,
                    table = %report.table,
                    rows = report.rows,
                    truncated = report.truncated,
                    "inbox entry processed"
                );
                (InboxState::Success, report.summary())
            }
            Err(error) => {
                tracing::warn!(
                    target = "fleet_control::inbox",
                    inbox_id = entry.id,
                    error = %error,
                    "inbox entry failed"
                );
                (InboxState::Error, error.to_string())
            }
        };

        self.finish(entry.id, state, &log)?;
        Ok(Some(state))
    }

    /// Record the terminal state, retrying once. A second failure leaves the
    /// entry `running`, so the outcome is logged with the id.
    fn finish(&self, id: i64, state: InboxState, log: &str) -> Result<(), StoreError> {
        let Err(first) = self.inbox.finish_entry(id, state, log, Utc::now()) else {
            return Ok(());
        };
        tracing::warn!(
            target = "fleet_control::inbox",
            inbox_id = id,
            error = %first,
            "failed to finish inbox entry, retrying"
        );
        self.inbox
            .finish_entry(id, state, log, Utc::now())
            .inspect_err(|error| {
                tracing::error!(
                    target = "fleet_control::inbox",
                    inbox_id = id,
                    state = state.as_str(),
                    outcome = %log,
                    error = %error,
                    "inbox entry left running"
                );
            })
    }

    /// Scan every `interval` until `cancel` fires. A scan finishes before the
    /// next one starts.
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            target = "fleet_control::inbox",
            interval_secs = interval.as_secs(),
            "inbox scanner started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let processor = self.clone();
            let scan = tokio::task::spawn_blocking(move || processor.scan_once());
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = scan => match result {
                    Ok(Ok(summary)) if summary.picked > 0 => {
                        tracing::info!(
                            target = "fleet_control::inbox",
                            picked = summary.picked,
                            succeeded = summary.succeeded,
                            failed = summary.failed,
                            skipped = summary.skipped,
                            "inbox scan finished"
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => {
                        tracing::error!(target = "fleet_control::inbox", error = %error, "inbox scan failed");
                    }
                    Err(error) => {
                        tracing::error!(target = "fleet_control::inbox", error = %error, "inbox scan task panicked");
                    }
                }
            }
        }
        tracing::info!(target = "fleet_control::inbox", "inbox scanner stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::InboxProcessor;
    use crate::store::{
        InboxEntry, InboxState, InboxStore, NewInboxEntry, SqliteStore, StoreError,
    };

    /// Delegates to a real store but fails the first `failures` finishes.
    struct FlakyFinish {
        store: Arc<SqliteStore>,
        failures: AtomicUsize,
    }

    impl InboxStore for FlakyFinish {
        fn create_entry(&self, entry: &NewInboxEntry) -> Result<i64, StoreError> {
            self.store.create_entry(entry)
        }

        fn pending_entries(&self) -> Result<Vec<InboxEntry>, StoreError> {
            self.store.pending_entries()
        }

        fn mark_running(&self, id: i64, started_at: DateTime<Utc>) -> Result<bool, StoreError> {
            self.store.mark_running(id, started_at)
        }

        fn finish_entry(
            &self,
            id: i64,
            state: InboxState,
            log: &str,
            ended_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::EntryNotFound(id));
            }
            self.store.finish_entry(id, state, log, ended_at)
        }

        fn entry(&self, id: i64) -> Result<Option<InboxEntry>, StoreError> {
            self.store.entry(id)
        }
    }

    fn flaky(store: &Arc<SqliteStore>, failures: usize) -> InboxProcessor {
        let inbox = Arc::new(FlakyFinish {
            store: store.clone(),
            failures: AtomicUsize::new(failures),
        });
        InboxProcessor::new(inbox, store.clone())
    }

    fn store() -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        Arc::new(store)
    }

    fn submit(store: &SqliteStore, content: serde_json::Value) -> i64 {
        store
            .create_entry(&NewInboxEntry {
                name: "test".into(),
                content_type: "unknown".into(),
                content: content.to_string(),
                ..NewInboxEntry::default()
            })
            .unwrap()
    }

    fn processor(store: &Arc<SqliteStore>) -> InboxProcessor {
        InboxProcessor::new(store.clone(), store.clone())
    }

    #[test]
    fn success_and_error_paths_are_isolated() {
        let store = store();
        let bad = submit(
            &store,
            json!({"Content": {"TableName": "", "FieldMappings": [{"TargetField": "a", "Expression": "b"}], "Data": [{}]}}),
        );
        store
            .apply_schema("CREATE TABLE device (id VARCHAR(36), hostname VARCHAR(64))")
            .unwrap();
        let good = submit(
            &store,
            json!({"Content": {
                "TableName": "device",
                "FieldMappings": [
                    {"TargetField": "id", "Expression": "NewGUID()"},
                    {"TargetField": "hostname", "Expression": "{name}"},
                ],
                "Data": [{"name": "ws-01"}, {"name": "ws-02"}],
            }}),
        );

        let summary = processor(&store).scan_once().unwrap();
        assert_eq!(summary.picked, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);

        let bad = store.entry(bad).unwrap().unwrap();
        assert_eq!(bad.state, InboxState::Error);
        assert!(!bad.processing_log.unwrap_or_default().is_empty());
        let good = store.entry(good).unwrap().unwrap();
        assert_eq!(good.state, InboxState::Success);
        assert!(good.ended_at.is_some());
        assert_eq!(
            good.processing_log.as_deref(),
            Some("inserted 2 rows into `device`")
        );

        // Error entries are not retried on the next scan.
        assert_eq!(processor(&store).scan_once().unwrap().picked, 0);
    }

    #[test]
    fn already_claimed_entries_are_skipped() {
        let store = store();
        let id = submit(&store, json!({}));
        let entry = store.pending_entries().unwrap().remove(0);
        assert!(store.mark_running(id, chrono::Utc::now()).unwrap());
        assert_eq!(processor(&store).process_entry(&entry).unwrap(), None);
    }

    #[test]
    fn finish_is_retried_once() {
        let store = store();
        let id = submit(&store, json!({}));
        let summary = flaky(&store, 1).scan_once().unwrap();
        assert_eq!(summary.failed, 1);
        let entry = store.entry(id).unwrap().unwrap();
        assert_eq!(entry.state, InboxState::Error);
        assert!(entry.processing_log.is_some());
    }

    #[test]
    fn second_finish_failure_is_reported() {
        let store = store();
        let id = submit(&store, json!({}));
        let entry = store.pending_entries().unwrap().remove(0);
        assert!(matches!(
            flaky(&store, 2).process_entry(&entry),
            Err(StoreError::EntryNotFound(_))
        ));
        assert_eq!(store.entry(id).unwrap().unwrap().state, InboxState::Running);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let store = store();
        let id = submit(&store, json!({}));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            Arc::new(processor(&store)).run(Duration::from_millis(10), cancel.clone()),
        );

        for _ in 0..100 {
            if store.entry(id).unwrap().unwrap().state.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.entry(id).unwrap().unwrap().state, InboxState::Error);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("scanner exits promptly")
            .unwrap();
    }
}
