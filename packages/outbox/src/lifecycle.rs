//! Instance lifecycle: registration, heartbeats, and graceful shutdown.
//!
//! Mirrors the health-state-plus-watch-channel shape this codebase already
//! uses for graceful shutdown, but tracks instance status in the shared
//! [`outbox_core::InstanceRegistry`] instead of a local atomic, since other
//! instances in the fleet must observe this instance's liveness.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use outbox_core::{InstanceRegistry, InstanceStatus, OutboxInstance, OutboxError};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Health state of this instance, mirrored into [`outbox_core::InstanceStatus`]
/// on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Active,
    ShuttingDown,
    Stopped,
}

/// Owns this instance's registration row and coordinates its shutdown with
/// the coordinator and scheduler tasks via a shared `watch` channel.
pub struct LifecycleManager {
    instance_id: String,
    registry: Arc<dyn InstanceRegistry>,
    state: Arc<ArcSwap<LifecycleState>>,
    shutdown_tx: watch::Sender<bool>,
    heartbeat_failures: AtomicBool,
}

impl LifecycleManager {
    /// Registers a new `ACTIVE` instance row and returns a manager bound to it.
    pub async fn start(
        instance_id: impl Into<String>,
        hostname: impl Into<String>,
        port: u16,
        registry: Arc<dyn InstanceRegistry>,
    ) -> Result<Self, OutboxError> {
        let instance_id = instance_id.into();
        let now = Utc::now();
        let instance = OutboxInstance::new(instance_id.clone(), hostname, port, now);
        registry.save(&instance).await?;
        info!(instance_id = %instance_id, "outbox instance registered");

        let (shutdown_tx, _rx) = watch::channel(false);
        Ok(Self {
            instance_id,
            registry,
            state: Arc::new(ArcSwap::from_pointee(LifecycleState::Active)),
            shutdown_tx,
            heartbeat_failures: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Runs the heartbeat loop until shutdown is triggered. Intended to be
    /// spawned as its own task; a failed heartbeat update is logged and
    /// retried on the next tick rather than aborting the loop, since a single
    /// transient storage error shouldn't pull an otherwise-healthy instance
    /// out of the fleet.
    pub async fn run_heartbeat(&self, interval: Duration) {
        let mut shutdown_rx = self.shutdown_receiver();
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    debug!(instance_id = %self.instance_id, "heartbeat loop observed shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    self.send_heartbeat().await;
                }
            }
        }
    }

    async fn send_heartbeat(&self) {
        let now = Utc::now();
        match self.registry.update_heartbeat(&self.instance_id, now).await {
            Ok(true) => {
                self.heartbeat_failures.store(false, Ordering::Relaxed);
            }
            Ok(false) => {
                // Row is gone -- another actor (stale-cleanup on a peer) decided
                // this instance was dead. Re-register rather than keep silently
                // heartbeating a row nobody will see.
                warn!(instance_id = %self.instance_id, "heartbeat target missing, re-registering");
                let instance = OutboxInstance::new(self.instance_id.clone(), "unknown", 0, now);
                if let Err(e) = self.registry.save(&instance).await {
                    error!(instance_id = %self.instance_id, error = %e, "failed to re-register after missing heartbeat row");
                }
            }
            Err(e) => {
                error!(instance_id = %self.instance_id, error = %e, "heartbeat update failed");
                self.heartbeat_failures.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Triggers graceful shutdown: flips local state to `ShuttingDown`,
    /// persists the same status, and signals every task watching
    /// [`Self::shutdown_receiver`]. Callers should await
    /// [`Self::finish_shutdown`] afterward once in-flight record processing
    /// has actually stopped.
    pub async fn begin_shutdown(&self) -> Result<(), OutboxError> {
        self.state.store(Arc::new(LifecycleState::ShuttingDown));
        self.registry.update_status(&self.instance_id, InstanceStatus::ShuttingDown, Utc::now()).await?;
        let _ = self.shutdown_tx.send(true);
        info!(instance_id = %self.instance_id, "outbox instance shutting down");
        Ok(())
    }

    /// Marks this instance `DEAD` in the registry. Called once partition
    /// release (owned by [`crate::coordinator::PartitionCoordinator`]) and any
    /// in-flight record handlers have drained.
    pub async fn finish_shutdown(&self) -> Result<(), OutboxError> {
        self.registry.update_status(&self.instance_id, InstanceStatus::Dead, Utc::now()).await?;
        self.state.store(Arc::new(LifecycleState::Stopped));
        info!(instance_id = %self.instance_id, "outbox instance stopped");
        Ok(())
    }
}
