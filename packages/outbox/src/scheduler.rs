//! The processing scheduler: turns ready record keys into handler dispatches.
//!
//! Each tick fetches the owned-partition set from
//! [`crate::coordinator::PartitionCoordinator`] and asks the record store for
//! ready keys within it. Keys are processed concurrently (bounded by a
//! `JoinSet`), but within a single key every record is applied strictly in
//! `created_at` order -- ordering is a per-key guarantee, not a global one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use outbox_core::{OutboxError, OutboxRecord, RecordMetadata, RecordStatus, RecordStore};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, warn};

use crate::coordinator::PartitionCoordinator;
use crate::handler::HandlerRegistry;

/// Upper bound on concurrently processing keys per tick, independent of
/// `batch_size` (which bounds how many keys a single store query returns).
const MAX_CONCURRENT_KEYS: usize = 16;

pub struct ProcessingScheduler {
    record_store: Arc<dyn RecordStore>,
    handlers: Arc<HandlerRegistry>,
    coordinator: Arc<PartitionCoordinator>,
    default_retry_policy: Arc<dyn outbox_core::RetryPolicy>,
    batch_size: u32,
    stop_on_first_failure: bool,
    /// Shared with the coordinator so a processing tick never reads the
    /// owned-partition set mid-rebalance.
    tick_guard: Arc<Mutex<()>>,
}

impl ProcessingScheduler {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        record_store: Arc<dyn RecordStore>,
        handlers: Arc<HandlerRegistry>,
        coordinator: Arc<PartitionCoordinator>,
        default_retry_policy: Arc<dyn outbox_core::RetryPolicy>,
        batch_size: u32,
        stop_on_first_failure: bool,
        tick_guard: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            record_store,
            handlers,
            coordinator,
            default_retry_policy,
            batch_size,
            stop_on_first_failure,
            tick_guard,
        }
    }

    pub async fn run(&self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    debug!("processing loop observed shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    tokio::select! {
                        biased;
                        _ = shutdown_rx.changed() => {
                            debug!("processing loop canceled mid-tick by shutdown signal");
                            break;
                        }
                        () = self.tick() => {}
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn tick(&self) {
        let _guard = self.tick_guard.lock().await;
        let owned = self.coordinator.owned_partitions();
        if owned.is_empty() {
            return;
        }
        let partitions: Vec<u32> = owned.iter().copied().collect();

        let keys = match self
            .record_store
            .find_ready_record_keys(&partitions, RecordStatus::New, self.batch_size, self.stop_on_first_failure, Utc::now())
            .await
        {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "failed to fetch ready record keys");
                return;
            }
        };
        if keys.is_empty() {
            return;
        }

        let mut joinset = JoinSet::new();
        let mut pending = keys.into_iter();
        let mut in_flight = 0usize;

        loop {
            while in_flight < MAX_CONCURRENT_KEYS {
                let Some(key) = pending.next() else { break };
                let scheduler = self.clone_for_task();
                joinset.spawn(async move { scheduler.process_key(&key).await });
                in_flight += 1;
            }
            if in_flight == 0 {
                break;
            }
            match joinset.join_next().await {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => warn!(error = %e, "key processing task failed"),
                Some(Err(join_err)) => error!(error = %join_err, "key processing task panicked"),
                None => break,
            }
            in_flight -= 1;
        }
    }

    /// Cheap `Arc`-clone bundle so each spawned task owns its dependencies
    /// independently of `self`'s lifetime.
    fn clone_for_task(&self) -> TaskContext {
        TaskContext {
            record_store: Arc::clone(&self.record_store),
            handlers: Arc::clone(&self.handlers),
            default_retry_policy: Arc::clone(&self.default_retry_policy),
        }
    }
}

struct TaskContext {
    record_store: Arc<dyn RecordStore>,
    handlers: Arc<HandlerRegistry>,
    default_retry_policy: Arc<dyn outbox_core::RetryPolicy>,
}

impl TaskContext {
    /// Processes every incomplete record for `key` strictly in creation
    /// order, stopping at the first failure -- the rest wait for the next
    /// tick, preserving per-key ordering.
    #[instrument(skip(self), fields(key = %key))]
    async fn process_key(&self, key: &str) -> Result<(), OutboxError> {
        let records = self.record_store.find_incomplete_records_by_key(key).await?;
        let now = Utc::now();
        for mut record in records {
            if !record.is_ready(now) {
                break;
            }
            if !self.process_record(&mut record, now).await {
                break;
            }
        }
        Ok(())
    }

    async fn process_record(&self, record: &mut OutboxRecord, now: chrono::DateTime<Utc>) -> bool {
        let handler = match self.handlers.get(&record.handler_id) {
            Ok(handler) => handler,
            Err(e) => {
                error!(record_id = %record.id, handler_id = %record.handler_id, error = %e, "no handler registered, failing record");
                record.mark_failed(e.to_string(), false, 0, chrono::Duration::zero(), now);
                if let Err(e) = self.record_store.save(record).await {
                    error!(record_id = %record.id, error = %e, "failed to persist record failed for missing handler");
                }
                return false;
            }
        };
        let retry_policy = self.handlers.retry_policy_override(&record.handler_id).unwrap_or_else(|| Arc::clone(&self.default_retry_policy));

        let metadata = RecordMetadata::from(&*record);

        match handler.handle(&record.payload, &metadata).await {
            Ok(()) => {
                record.mark_completed(now);
                if let Err(e) = self.record_store.save(record).await {
                    error!(record_id = %record.id, error = %e, "failed to persist completed record");
                    return false;
                }
                true
            }
            Err(err) => {
                let reason = err.to_string();
                let retryable = retry_policy.should_retry(&reason);
                let next_delay = chrono::Duration::from_std(retry_policy.next_delay(record.failure_count + 1))
                    .unwrap_or(chrono::Duration::zero());
                record.mark_failed(reason, retryable, retry_policy.max_retries(), next_delay, now);
                if let Err(e) = self.record_store.save(record).await {
                    error!(record_id = %record.id, error = %e, "failed to persist failed record");
                }
                false
            }
        }
    }
}
