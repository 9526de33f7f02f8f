//! Per-instance mutual exclusion.
//!
//! Each `instanceId` gets its own fair tokio mutex, so waiters are granted
//! in arrival order. The returned [`InstanceLock`] releases on drop on every
//! exit path; the slot is garbage-collected once nobody holds or waits on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::LockError;

#[derive(Default)]
struct Slot {
    mutex: Arc<Mutex<()>>,
    /// Holder plus queued waiters.
    users: usize,
    /// Reason given by the current holder.
    holder: Option<String>,
}

#[derive(Default)]
struct LockTable {
    slots: StdMutex<HashMap<String, Slot>>,
}

impl LockTable {
    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration in a slot; dropping it (including a cancelled `acquire`)
/// gives the slot back.
struct Ticket {
    table: Arc<LockTable>,
    key: String,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut slots = self.table.slots();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                slots.remove(&self.key);
            }
        }
    }
}

/// Held lock on one task instance.
pub struct InstanceLock {
    // Field order matters: the guard is released before the ticket.
    guard: Option<OwnedMutexGuard<()>>,
    ticket: Ticket,
    reason: String,
}

impl InstanceLock {
    pub fn instance_id(&self) -> &str {
        &self.ticket.key
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Release explicitly, logging why.
    pub fn release(self, reason: &str) {
        debug!(
            instance_id = %self.ticket.key,
            acquired_for = %self.reason,
            released_for = %reason,
            "Released instance lock"
        );
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Some(slot) = self.ticket.table.slots().get_mut(&self.ticket.key) {
            slot.holder = None;
        }
        self.guard.take();
    }
}

impl std::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLock")
            .field("instance_id", &self.ticket.key)
            .field("reason", &self.reason)
            .finish()
    }
}

/// FIFO lock manager keyed by `instanceId`.
#[derive(Clone, Default)]
pub struct LockManager {
    table: Arc<LockTable>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, instance_id: &str) -> (Ticket, Arc<Mutex<()>>) {
        let mut slots = self.table.slots();
        let slot = slots.entry(instance_id.to_string()).or_default();
        slot.users += 1;
        let mutex = Arc::clone(&slot.mutex);
        drop(slots);
        (
            Ticket {
                table: Arc::clone(&self.table),
                key: instance_id.to_string(),
            },
            mutex,
        )
    }

    fn granted(&self, ticket: Ticket, guard: OwnedMutexGuard<()>, reason: &str) -> InstanceLock {
        if let Some(slot) = self.table.slots().get_mut(&ticket.key) {
            slot.holder = Some(reason.to_string());
        }
        InstanceLock {
            guard: Some(guard),
            ticket,
            reason: reason.to_string(),
        }
    }

    /// Wait for the lock on `instance_id`.
    pub async fn acquire(&self, instance_id: &str, reason: &str) -> InstanceLock {
        let (ticket, mutex) = self.register(instance_id);
        if let Some(holder) = self.holder(instance_id) {
            debug!(
                instance_id = %instance_id,
                holder = %holder,
                reason = %reason,
                "Waiting for instance lock"
            );
        }
        let guard = mutex.lock_owned().await;
        debug!(instance_id = %instance_id, reason = %reason, "Acquired instance lock");
        self.granted(ticket, guard, reason)
    }

    /// Take the lock only if it is free right now.
    pub fn try_acquire(&self, instance_id: &str, reason: &str) -> Result<InstanceLock, LockError> {
        let (ticket, mutex) = self.register(instance_id);
        match mutex.try_lock_owned() {
            Ok(guard) => Ok(self.granted(ticket, guard, reason)),
            Err(_) => Err(LockError::Busy {
                instance_id: instance_id.to_string(),
                holder: self.holder(instance_id).unwrap_or_default(),
            }),
        }
    }

    pub fn is_locked(&self, instance_id: &str) -> bool {
        self.table
            .slots()
            .get(instance_id)
            .is_some_and(|slot| slot.holder.is_some())
    }

    /// Reason given by the current holder.
    pub fn holder(&self, instance_id: &str) -> Option<String> {
        self.table
            .slots()
            .get(instance_id)
            .and_then(|slot| slot.holder.clone())
    }

    /// Number of tasks queued behind the holder.
    pub fn waiters(&self, instance_id: &str) -> usize {
        self.table.slots().get(instance_id).map_or(0, |slot| {
            slot.users
                .saturating_sub(usize::from(slot.holder.is_some()))
        })
    }

    /// Instances with a holder or waiters.
    pub fn tracked(&self) -> usize {
        self.table.slots().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lock_is_exclusive_per_instance() {
        let locks = LockManager::new();
        let held = locks.acquire("abc123", "update").await;
        assert!(locks.is_locked("abc123"));
        assert!(matches!(
            locks.try_acquire("abc123", "other"),
            Err(LockError::Busy { .. })
        ));
        // A different instance is independent.
        let other = locks.try_acquire("def456", "update").unwrap();
        drop(other);
        held.release("done");
        assert!(!locks.is_locked("abc123"));
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let locks = LockManager::new();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let first = locks.acquire("i", "first").await;

        let mut handles = Vec::new();
        for n in 0..5 {
            let locks = locks.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _lock = locks.acquire("i", "waiter").await;
                order.lock().await.push(n);
            }));
            // Let each waiter enqueue before spawning the next.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(locks.waiters("i"), 5);
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn critical_sections_never_interleave() {
        let locks = LockManager::new();
        let log = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for n in 0..8 {
            let locks = locks.clone();
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                let _lock = locks.acquire("abc123", "update").await;
                log.lock().await.push(("enter", n));
                tokio::task::yield_now().await;
                log.lock().await.push(("exit", n));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let log = log.lock().await;
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, "enter");
            assert_eq!(pair[1].0, "exit");
            assert_eq!(pair[0].1, pair[1].1);
        }
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_its_slot() {
        let locks = LockManager::new();
        let held = locks.acquire("i", "holder").await;
        let waiting = tokio::time::timeout(Duration::from_millis(10), locks.acquire("i", "late")).await;
        assert!(waiting.is_err());
        assert_eq!(locks.waiters("i"), 0);
        drop(held);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn busy_error_names_the_holder() {
        let locks = LockManager::new();
        let _held = locks.acquire("i", "coprocessing").await;
        match locks.try_acquire("i", "x") {
            Err(LockError::Busy { holder, .. }) => assert_eq!(holder, "coprocessing"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
