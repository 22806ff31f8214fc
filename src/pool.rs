//! Executor pool: fixed slots, free/busy bookkeeping and admission control.
//!
//! Acquisition never waits. When every executor is busy the caller gets
//! [`ServiceError::CapacityExhausted`] right away and decides for itself
//! whether to retry.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::executor::{Executor, ExecutorSettings, SlotSnapshot, check_prerequisite};

// ── Partition ────────────────────────────────────────────────────────

/// Free/busy split of the slot indices `0..size`.
///
/// Every index is either on the free stack or marked busy, never both and
/// never neither.
#[derive(Debug)]
pub struct Partition {
    free: Vec<usize>,
    busy: Vec<bool>,
}

impl Partition {
    /// All slots free. Slot 0 is handed out first.
    pub fn new(size: usize) -> Self {
        Self {
            free: (0..size).rev().collect(),
            busy: vec![false; size],
        }
    }

    /// Move one slot from free to busy.
    pub fn take(&mut self) -> Option<usize> {
        let index = self.free.pop()?;
        self.busy[index] = true;
        Some(index)
    }

    /// Move a busy slot back to free. Returns `false` if it was not busy.
    pub fn give_back(&mut self, index: usize) -> bool {
        match self.busy.get_mut(index) {
            Some(busy) if *busy => {
                *busy = false;
                self.free.push(index);
                true
            }
            _ => false,
        }
    }

    /// Mark every slot free again.
    pub fn reclaim_all(&mut self) {
        for index in 0..self.busy.len() {
            self.give_back(index);
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.busy.len()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.busy.iter().filter(|b| **b).count()
    }

    /// Check that free and busy cover every slot exactly once.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let mut seen = vec![false; self.busy.len()];
        for &index in &self.free {
            if index >= seen.len() || seen[index] || self.busy[index] {
                return false;
            }
            seen[index] = true;
        }
        seen.iter().zip(&self.busy).all(|(free, busy)| free ^ busy)
    }
}

// ── Pool ─────────────────────────────────────────────────────────────

/// Aggregate numbers about the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_instances: usize,
    pub free: usize,
    pub busy: usize,
    pub total_exchanges: u64,
    /// Total records processed by all workers.
    pub total_processed: u64,
    /// Total number of worker restarts.
    pub total_restarts: u64,
    pub total_failures: u64,
    /// Snapshots of slots that were idle at the time of the call.
    pub slots: Vec<SlotSnapshot>,
}

struct PoolInner {
    slots: Vec<Arc<tokio::sync::Mutex<Executor>>>,
    partition: Mutex<Partition>,
    max_instances: usize,
    shutdown: CancellationToken,
}

impl PoolInner {
    fn partition(&self) -> MutexGuard<'_, Partition> {
        self.partition.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns every executor of the service.
///
/// Cheap to clone; clones share the same slots.
#[derive(Clone)]
pub struct ExecutorPool {
    inner: Arc<PoolInner>,
}

impl ExecutorPool {
    /// Validate the configuration, check the worker runtime and start every
    /// slot.
    ///
    /// The runtime check runs before any worker is spawned. If a slot fails
    /// to start, the slots already running are terminated again.
    pub async fn start(config: &Config) -> Result<Self> {
        let start = Instant::now();
        config.validate()?;

        if config.prerequisite.enabled {
            check_prerequisite(&config.prerequisite).await?;
        } else {
            debug!("Prerequisite check disabled");
        }

        let settings = Arc::new(ExecutorSettings::from_config(config));
        let max_instances = config.pool.max_instances;
        let mut executors = Vec::with_capacity(max_instances);

        for index in 0..max_instances {
            let port = config.slot_port(index).ok_or_else(|| {
                ServiceError::Configuration(format!("No port available for slot {index}"))
            });
            match port.and_then(|port| Executor::start(index, port, Arc::clone(&settings))) {
                Ok(executor) => executors.push(executor),
                Err(e) => {
                    warn!(slot = index, "Failed to start executor, stopping the others");
                    for mut executor in executors {
                        executor.terminate().await;
                    }
                    return Err(e);
                }
            }
        }

        info!(
            max_instances,
            base_port = config.pool.base_port,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Executor pool started"
        );

        Ok(Self::from_executors(executors))
    }

    /// Build a pool around executors that are already running.
    pub fn from_executors(executors: Vec<Executor>) -> Self {
        let max_instances = executors.len();
        let slots = executors
            .into_iter()
            .map(|executor| Arc::new(tokio::sync::Mutex::new(executor)))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                slots,
                partition: Mutex::new(Partition::new(max_instances)),
                max_instances,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn max_instances(&self) -> usize {
        self.inner.max_instances
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Take a free executor, or fail at once if none is free.
    pub fn acquire(&self) -> Result<ExecutorLease> {
        if self.is_shut_down() {
            return Err(ServiceError::delegate("Executor pool is shut down", false));
        }

        let index = {
            let mut partition = self.inner.partition();
            partition.take().ok_or(ServiceError::CapacityExhausted {
                max_instances: self.inner.max_instances,
            })?
        };

        // Only shutdown can hold the lock of a slot that sits on the free stack
        let Ok(guard) = Arc::clone(&self.inner.slots[index]).try_lock_owned() else {
            self.inner.partition().give_back(index);
            return Err(ServiceError::delegate("Executor pool is shut down", false));
        };

        trace!(slot = index, "Executor acquired");
        Ok(ExecutorLease {
            executor: guard,
            cancel: self.inner.shutdown.child_token(),
            release: SlotRelease {
                inner: Arc::clone(&self.inner),
                index,
            },
        })
    }

    /// Aggregate counters. Busy slots are counted but not inspected.
    pub fn stats(&self) -> PoolStats {
        let (free, busy) = {
            let partition = self.inner.partition();
            (partition.free_count(), partition.busy_count())
        };

        let slots: Vec<SlotSnapshot> = self
            .inner
            .slots
            .iter()
            .filter_map(|slot| slot.try_lock().ok().map(|executor| executor.snapshot()))
            .collect();

        PoolStats {
            max_instances: self.inner.max_instances,
            free,
            busy,
            total_exchanges: slots.iter().map(|s| s.exchanges).sum(),
            total_processed: slots.iter().map(|s| s.total_processed).sum(),
            total_restarts: slots.iter().map(|s| s.restarts).sum(),
            total_failures: slots.iter().map(|s| s.failures).sum(),
            slots,
        }
    }

    /// Stop accepting requests and terminate every executor.
    ///
    /// In-flight exchanges are cancelled; each slot is terminated as soon as
    /// its current exchange has returned.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down executor pool");
        self.inner.shutdown.cancel();

        for slot in &self.inner.slots {
            slot.lock().await.terminate().await;
        }
        self.inner.partition().reclaim_all();
        info!("Executor pool stopped");
    }

    #[cfg(test)]
    fn partition_is_consistent(&self) -> bool {
        self.inner.partition().is_consistent()
    }
}

// ── Lease ────────────────────────────────────────────────────────────

/// Exclusive use of one executor.
///
/// Dropping the lease puts the executor back on the free stack, whatever
/// happened while it was held.
pub struct ExecutorLease {
    // Field order matters: the slot lock is released before the index goes
    // back on the free stack.
    executor: OwnedMutexGuard<Executor>,
    cancel: CancellationToken,
    release: SlotRelease,
}

impl ExecutorLease {
    #[must_use]
    pub fn slot(&self) -> usize {
        self.release.index
    }

    /// Token cancelled on pool shutdown. Cancelling it only affects this
    /// lease.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl std::fmt::Debug for ExecutorLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorLease")
            .field("slot", &self.release.index)
            .field("executor", &*self.executor)
            .finish()
    }
}

impl std::ops::Deref for ExecutorLease {
    type Target = Executor;

    fn deref(&self) -> &Executor {
        &self.executor
    }
}

impl std::ops::DerefMut for ExecutorLease {
    fn deref_mut(&mut self) -> &mut Executor {
        &mut self.executor
    }
}

struct SlotRelease {
    inner: Arc<PoolInner>,
    index: usize,
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        if self.inner.partition().give_back(self.index) {
            trace!(slot = self.index, "Executor released");
        }
    }
}
