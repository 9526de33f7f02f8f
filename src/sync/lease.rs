//! Hub-side soft lease (`meta.locked`) and error-rate budget.
//!
//! The soft lease is advisory and lives in the task document: a node may ask
//! the hub to keep other nodes out of an instance across several updates.
//! It is independent of [`LockManager`](super::lock::LockManager), which only
//! covers one pipeline pass.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::ProtocolError;
use crate::task::{CommandArgs, Task};

/// Apply the lease rules to `task` (the merged update) given the committed
/// `stored` copy and the node that initiated the command.
pub fn apply_soft_lease(
    task: &mut Task,
    stored: Option<&Task>,
    initiator: Option<&str>,
    args: &CommandArgs,
    expiry: Duration,
    now: DateTime<Utc>,
) -> Result<(), ProtocolError> {
    let holder = stored
        .and_then(|t| t.meta.as_ref())
        .and_then(|m| m.locked.clone());
    let initiator = initiator.unwrap_or_default();
    let instance_id = task.instance_id.clone().unwrap_or_default();

    if args.unlock {
        task.meta_mut().locked = None;
    }

    match holder.as_deref() {
        None if args.lock && stored.is_some() => {
            task.meta_mut().locked = Some(initiator.to_string());
            info!(instance_id = %instance_id, holder = %initiator, "Task lease taken");
        }
        Some(h) if h == initiator => {
            // An update from the holder ends the lease.
            task.meta_mut().locked = None;
        }
        Some(h) if !args.lock_bypass && !args.unlock => {
            let updated_at = stored
                .and_then(|t| t.meta.as_ref())
                .and_then(|m| m.updated_at);
            let expired = match updated_at {
                None => true,
                Some(at) => now
                    .signed_duration_since(at)
                    .to_std()
                    .is_ok_and(|age| age > expiry),
            };
            if expired {
                warn!(
                    instance_id = %instance_id,
                    holder = %h,
                    requester = %initiator,
                    "Task lease expired, overriding"
                );
                task.meta_mut().locked = None;
            } else {
                return Err(ProtocolError::TaskLocked {
                    instance_id,
                    holder: h.to_string(),
                });
            }
        }
        _ => {}
    }
    Ok(())
}

/// Sliding one-minute budget for error traffic through the hub.
#[derive(Debug)]
pub struct ErrorRateLimiter {
    max_per_minute: u32,
    window: Mutex<VecDeque<DateTime<Utc>>>,
}

impl ErrorRateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one error at `now`; fails once the budget is spent.
    pub fn record(&self, now: DateTime<Utc>) -> Result<(), ProtocolError> {
        let mut window = self
            .window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let cutoff = now - chrono::Duration::minutes(1);
        while window.front().is_some_and(|t| *t <= cutoff) {
            window.pop_front();
        }
        if window.len() as u32 >= self.max_per_minute {
            return Err(ProtocolError::ErrorRateExceeded {
                max: self.max_per_minute,
            });
        }
        window.push_back(now);
        Ok(())
    }

    pub fn recent(&self) -> usize {
        self.window
            .lock()
            .map(|w| w.len())
            .unwrap_or_default()
    }
}
