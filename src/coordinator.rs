//! Process-wide mutual exclusion over destination phone numbers.
//!
//! Two workers must never dial the same phone at once, even when
//! separate jobs for the same destination are in flight. The
//! coordinator is a single mutex-protected map plus a notification;
//! waiters re-check on every release and on a 100 ms tick so that
//! cancellation can never be masked by a long-held lock.

use crate::domain_types::{ModemName, PhoneNumber};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Upper bound on how long a waiter can go without re-checking
/// cancellation.
const WAIT_TICK: Duration = Duration::from_millis(100);

/// Phone-number lock table shared by all workers.
#[derive(Debug, Default)]
pub struct PhoneCoordinator {
    held: Mutex<HashMap<PhoneNumber, ModemName>>,
    released: Notify,
}

impl PhoneCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `phone` on behalf of `worker`, waiting
    /// while another worker holds it. Returns `false` if `token` is
    /// cancelled before the lock is obtained.
    pub async fn acquire(
        &self,
        token: &CancellationToken,
        phone: &PhoneNumber,
        worker: &ModemName,
    ) -> bool {
        loop {
            if token.is_cancelled() {
                return false;
            }
            {
                let mut held = self.held.lock().await;
                match held.entry(phone.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(worker.clone());
                        trace!(%phone, %worker, "phone lock acquired");
                        return true;
                    }
                    Entry::Occupied(holder) => {
                        trace!(%phone, %worker, holder = %holder.get(), "phone busy, waiting");
                    }
                }
            }
            // A release between dropping the map lock and parking here
            // is caught by the fallback tick; fairness is not
            // guaranteed.
            tokio::select! {
                () = self.released.notified() => {}
                () = tokio::time::sleep(WAIT_TICK) => {}
                () = token.cancelled() => return false,
            }
        }
    }

    /// Releases the lock for `phone` and wakes all waiters. Releasing
    /// an unheld phone is a no-op.
    pub async fn release(&self, phone: &PhoneNumber) {
        let removed = self.held.lock().await.remove(phone);
        if let Some(worker) = removed {
            trace!(%phone, %worker, "phone lock released");
        }
        self.released.notify_waiters();
    }

    /// Whether any worker currently holds `phone`.
    pub async fn is_in_use(&self, phone: &PhoneNumber) -> bool {
        self.held.lock().await.contains_key(phone)
    }

    /// The worker currently holding `phone`, if any.
    pub async fn holder(&self, phone: &PhoneNumber) -> Option<ModemName> {
        self.held.lock().await.get(phone).cloned()
    }

    /// Number of phones currently locked.
    pub async fn count(&self) -> usize {
        self.held.lock().await.len()
    }
}
