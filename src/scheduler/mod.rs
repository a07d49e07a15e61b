//! Scheduler module - Box admission control
//!
//! This module hands out sandboxes to concurrent callers.
//! It handles:
//! - A fixed number of concurrency slots, each backed by a reusable box ID
//! - A memory budget shared by every box that is checked out
//! - Sub-schedulers that reserve a slice of the slots for one batch of work
//! - Draining on close, so shutdown never races an in-flight run
//!
//! The scheduler module does NOT:
//! - Run anything inside the boxes (that's the pipeline's job)
//! - Know how a box is built (see [`BoxFactory`])

mod lease;

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EvalError, Result};
use crate::sandbox::{IsolateBox, Sandbox};

pub use lease::BoxLease;

/// Builds a sandbox for a given box ID and memory quota
#[async_trait]
pub trait BoxFactory: Send + Sync {
    async fn create(&self, box_id: u32, memory_quota: u32) -> Result<Box<dyn Sandbox>>;
}

/// Creates real isolate boxes
pub struct IsolateFactory {
    isolate_path: PathBuf,
}

impl IsolateFactory {
    pub fn new(isolate_path: impl Into<PathBuf>) -> Self {
        Self {
            isolate_path: isolate_path.into(),
        }
    }
}

#[async_trait]
impl BoxFactory for IsolateFactory {
    async fn create(&self, box_id: u32, memory_quota: u32) -> Result<Box<dyn Sandbox>> {
        let sandbox = IsolateBox::new(&self.isolate_path, box_id, memory_quota).await?;
        Ok(Box::new(sandbox))
    }
}

struct Parent {
    scheduler: BoxScheduler,
    /// Slots held in the parent on behalf of this scheduler
    reservation: Mutex<Option<OwnedSemaphorePermit>>,
}

struct Inner {
    slots: Arc<Semaphore>,
    capacity: u32,
    /// Shared with the parent for sub-schedulers
    memory: Arc<Semaphore>,
    memory_budget: u32,
    /// Sum of the quotas of live leases, shared like `memory`
    reserved: Arc<AtomicU32>,
    free_ids: Mutex<VecDeque<u32>>,
    factory: Arc<dyn BoxFactory>,
    parent: Option<Parent>,
}

impl Inner {
    fn ids(&self) -> MutexGuard<'_, VecDeque<u32>> {
        self.free_ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give every ID and the slot reservation back to the parent
    fn return_to_parent(&self) {
        let Some(parent) = &self.parent else {
            return;
        };
        let ids: Vec<u32> = self.ids().drain(..).collect();
        parent.scheduler.inner.ids().extend(ids);
        parent
            .reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.return_to_parent();
    }
}

/// Box scheduler
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct BoxScheduler {
    inner: Arc<Inner>,
}

impl BoxScheduler {
    /// A scheduler running up to `count` boxes at once.
    ///
    /// It owns `2 * count` box IDs starting at `box_id_start + 1`, so a box
    /// that was just released is not reused right away.
    pub fn new(box_id_start: u32, count: u32, memory_budget_kb: u32, factory: Arc<dyn BoxFactory>) -> Self {
        let free_ids = (1..=2 * count).map(|i| i + box_id_start).collect();

        Self {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(count as usize)),
                capacity: count,
                memory: Arc::new(Semaphore::new(memory_budget_kb as usize)),
                memory_budget: memory_budget_kb,
                reserved: Arc::new(AtomicU32::new(0)),
                free_ids: Mutex::new(free_ids),
                factory,
                parent: None,
            }),
        }
    }

    /// Scheduler over real isolate boxes, as configured
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.box_id_start,
            config.box_count,
            config.memory_budget_kb,
            Arc::new(IsolateFactory::new(&config.isolate_path)),
        )
    }

    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    pub fn memory_budget_kb(&self) -> u32 {
        self.inner.memory_budget
    }

    pub fn available_slots(&self) -> u32 {
        self.inner.slots.available_permits() as u32
    }

    /// Memory permits not assigned to anyone.
    ///
    /// A queued acquire holds on to part of the free memory while it waits, so
    /// this can be lower than `budget - reserved_memory_kb()`.
    pub fn available_memory_kb(&self) -> u32 {
        self.inner.memory.available_permits() as u32
    }

    /// Sum of the quotas held by live leases, across sub-schedulers too
    pub fn reserved_memory_kb(&self) -> u32 {
        self.inner.reserved.load(Ordering::SeqCst)
    }

    /// Number of box IDs not currently checked out
    pub fn free_ids(&self) -> usize {
        self.inner.ids().len()
    }

    /// Check out a fresh sandbox with `memory_quota` KB reserved (0 = no reservation).
    ///
    /// Waits until both a slot and the memory are free.
    pub async fn acquire(&self, token: &CancellationToken, memory_quota: u32) -> Result<BoxLease> {
        let inner = &self.inner;
        if memory_quota > inner.memory_budget {
            return Err(EvalError::QuotaExceedsBudget {
                quota_kb: memory_quota,
                budget_kb: inner.memory_budget,
            });
        }

        let slot = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(EvalError::Cancelled),
            permit = inner.slots.clone().acquire_owned() => permit.map_err(|_| EvalError::Closed)?,
        };

        let memory = if memory_quota > 0 {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(EvalError::Cancelled),
                permit = inner.memory.clone().acquire_many_owned(memory_quota) => {
                    permit.map_err(|_| EvalError::Closed)?
                }
            };
            Some(permit)
        } else {
            None
        };

        // A held slot always leaves at least one ID in the pool
        let box_id = inner.ids().pop_front().ok_or(EvalError::Closed)?;

        match inner.factory.create(box_id, memory_quota).await {
            Ok(sandbox) => {
                debug!("Acquired box {} with {} KB quota", box_id, memory_quota);
                inner.reserved.fetch_add(memory_quota, Ordering::SeqCst);
                Ok(BoxLease::new(sandbox, self.clone(), memory_quota, slot, memory))
            }
            Err(e) => {
                self.return_id(box_id);
                Err(e)
            }
        }
    }

    /// Release a lease back to this scheduler
    pub async fn release(&self, lease: BoxLease) {
        lease.release().await;
    }

    /// Reserve `slots` concurrency slots for exclusive use by a child scheduler.
    ///
    /// The child shares this scheduler's memory budget and hands out IDs only
    /// from the set it takes here.
    pub async fn sub_scheduler(&self, token: &CancellationToken, slots: u32) -> Result<BoxScheduler> {
        let inner = &self.inner;
        if slots > inner.capacity {
            return Err(EvalError::TooManySlots {
                requested: slots,
                available: inner.capacity,
            });
        }

        let reservation = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(EvalError::Cancelled),
            permit = inner.slots.clone().acquire_many_owned(slots) => permit.map_err(|_| EvalError::Closed)?,
        };

        let ids: VecDeque<u32> = {
            let mut pool = inner.ids();
            let take = (2 * slots as usize).min(pool.len());
            pool.drain(..take).collect()
        };
        info!("Reserved {} slots ({} box IDs) for a sub-scheduler", slots, ids.len());

        Ok(BoxScheduler {
            inner: Arc::new(Inner {
                slots: Arc::new(Semaphore::new(slots as usize)),
                capacity: slots,
                memory: inner.memory.clone(),
                memory_budget: inner.memory_budget,
                reserved: inner.reserved.clone(),
                free_ids: Mutex::new(ids),
                factory: inner.factory.clone(),
                parent: Some(Parent {
                    scheduler: self.clone(),
                    reservation: Mutex::new(Some(reservation)),
                }),
            }),
        })
    }

    /// Wait for every outstanding lease to be released, then stop handing out boxes.
    ///
    /// A sub-scheduler gives its IDs and slots back to the parent. Closing twice is a no-op.
    pub async fn close(&self, token: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        if inner.slots.is_closed() {
            return Ok(());
        }

        let drained = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(EvalError::Cancelled),
            permit = inner.slots.acquire_many(inner.capacity) => match permit {
                Ok(permit) => permit,
                // Someone else finished closing while we waited
                Err(_) => return Ok(()),
            },
        };
        drained.forget();
        inner.slots.close();

        if inner.parent.is_some() {
            inner.return_to_parent();
            info!("Sub-scheduler closed, returned {} slots", inner.capacity);
        }
        Ok(())
    }

    fn return_id(&self, box_id: u32) {
        self.inner.ids().push_back(box_id);
    }

    fn unreserve(&self, memory_quota: u32) {
        self.inner.reserved.fetch_sub(memory_quota, Ordering::SeqCst);
    }
}

impl fmt::Debug for BoxScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxScheduler")
            .field("capacity", &self.inner.capacity)
            .field("available_slots", &self.available_slots())
            .field("memory_budget_kb", &self.inner.memory_budget)
            .field("reserved_memory_kb", &self.reserved_memory_kb())
            .field("free_ids", &self.free_ids())
            .field("sub_scheduler", &self.inner.parent.is_some())
            .finish()
    }
}
