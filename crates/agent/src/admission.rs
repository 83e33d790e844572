//! Per-user admission control.
//!
//! Every user id maps to a counting semaphore of fixed capacity. A turn
//! holds an [`AdmissionPermit`] for its whole lifetime; dropping the permit
//! on any exit path gives the slot back. Tokio semaphores queue waiters in
//! FIFO order, so a waiter is admitted as soon as the slots ahead of it free up.

use chrono::Utc;
use clinscribe_core::event::{DomainEvent, EventBus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Admission slots for user {0} were closed")]
    Closed(String),
}

/// A held admission slot. Released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    user_id: String,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

pub struct AdmissionController {
    capacity: usize,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    event_bus: Option<Arc<EventBus>>,
}

impl AdmissionController {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Mutex::new(HashMap::new()),
            event_bus: None,
        }
    }

    /// Publish `SlotsSwept` events on this bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<Semaphore>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The user's semaphore, created on first use.
    ///
    /// The clone is taken under the map lock, so `sweep` can never remove
    /// a semaphore somebody is about to wait on.
    fn semaphore(&self, user_id: &str) -> Arc<Semaphore> {
        self.slots()
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.capacity)))
            .clone()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self, user_id: &str) -> Result<AdmissionPermit, AdmissionError> {
        let semaphore = self.semaphore(user_id);
        if semaphore.available_permits() == 0 {
            debug!(user_id, capacity = self.capacity, "All admission slots busy, waiting");
        }
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| AdmissionError::Closed(user_id.to_string()))?;
        Ok(AdmissionPermit {
            user_id: user_id.to_string(),
            _permit: permit,
        })
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self, user_id: &str) -> Option<AdmissionPermit> {
        match self.semaphore(user_id).try_acquire_owned() {
            Ok(permit) => Some(AdmissionPermit {
                user_id: user_id.to_string(),
                _permit: permit,
            }),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => None,
        }
    }

    /// Give a slot back. Equivalent to dropping the permit.
    pub fn release(&self, permit: AdmissionPermit) {
        debug!(user_id = permit.user_id(), "Admission slot released");
        drop(permit);
    }

    /// Turns currently holding a slot for `user_id`.
    pub fn in_flight(&self, user_id: &str) -> usize {
        self.slots()
            .get(user_id)
            .map(|s| self.capacity - s.available_permits())
            .unwrap_or(0)
    }

    /// Users with a semaphore in the map.
    pub fn tracked_users(&self) -> usize {
        self.slots().len()
    }

    /// Remove semaphores of users with nothing in flight and nobody waiting.
    ///
    /// Permits and waiters each hold a clone of the semaphore, so a strong
    /// count of one means the map is the only owner.
    pub fn sweep(&self) -> usize {
        let removed = {
            let mut slots = self.slots();
            let before = slots.len();
            slots.retain(|_, s| Arc::strong_count(s) > 1 || s.available_permits() < self.capacity);
            before - slots.len()
        };

        if removed > 0 {
            debug!(removed, "Swept idle admission slots");
            if let Some(bus) = &self.event_bus {
                bus.publish(DomainEvent::SlotsSwept {
                    removed,
                    timestamp: Utc::now(),
                });
            }
        }
        removed
    }

    /// Sweep every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        controller.sweep();
                    }
                }
            }
            info!("Admission sweeper stopped");
        })
    }
}
