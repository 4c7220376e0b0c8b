//! Transaction coordinator.
//!
//! The coordinator owns the shared [`Store`] and hands out [`UnitOfWork`]s over
//! it. Row lock requests that cannot be granted suspend on a wake-up broadcast
//! that fires whenever a unit of work commits or rolls back, and every wait is
//! bounded by [`Config::lock_wait_timeout`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::{CouponId, Isolation, LockMode, TxnId, WaitPolicy};
use crate::store::Store;

mod error;
pub use error::{CouponError, TxnError};

mod state;
pub use state::TxnState;

mod unit;
pub use unit::{CouponQuery, UnitOfWork};

/// Result of a lock request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquired {
    Granted,
    /// Row was locked by someone else and the wait policy says skip it.
    Skipped,
}

struct Shared {
    store: Mutex<Store>,
    /// Broadcast to lock waiters after locks are released.
    released: Notify,
    next_txn: AtomicU64,
    config: Config,
}

/// Cheap-to-clone handle on the shared store.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

/// Public API
impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: Mutex::new(Store::new()),
                released: Notify::new(),
                next_txn: AtomicU64::new(1),
                config,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// A unit of work in the `Idle` state; call [`UnitOfWork::start`] before using it.
    pub fn create_unit_of_work(&self) -> UnitOfWork {
        let id = TxnId(self.shared.next_txn.fetch_add(1, Ordering::Relaxed));
        UnitOfWork::new(self.clone(), id)
    }

    /// A started unit of work; `None` uses the configured default isolation.
    pub fn begin(&self, isolation: Option<Isolation>) -> UnitOfWork {
        let mut unit = self.create_unit_of_work();
        unit.enter(isolation);
        unit
    }
}

/// Private API
impl Coordinator {
    pub(crate) fn store(&self) -> MutexGuard<'_, Store> {
        self.shared.store.lock()
    }

    pub(crate) fn wake_waiters(&self) {
        self.shared.released.notify_waiters();
    }

    /// Take `mode` on `row` for `txn`, honouring `wait`.
    ///
    /// Blocking requests join the waits-for graph; if that closes a cycle the
    /// requester is the victim and gets [`TxnError::Deadlock`]. Dropping the
    /// returned future withdraws the request.
    pub(crate) async fn acquire(
        &self,
        txn: TxnId,
        row: CouponId,
        mode: LockMode,
        wait: WaitPolicy,
    ) -> Result<Acquired, TxnError> {
        let timeout = self.config().lock_wait_timeout;
        let deadline = Instant::now() + timeout;
        let mut registration = WaitRegistration {
            coordinator: self,
            txn,
            armed: false,
        };

        loop {
            let notified = self.shared.released.notified();
            tokio::pin!(notified);
            // registered before checking so a release in between is not missed
            notified.as_mut().enable();

            {
                let mut store = self.store();
                match store.locks.try_acquire(txn, row, mode) {
                    Ok(()) => {
                        store.locks.cancel_wait(txn);
                        registration.armed = false;
                        debug!(%txn, coupon = row, ?mode, "row lock granted");
                        return Ok(Acquired::Granted);
                    }
                    Err(blockers) => match wait {
                        WaitPolicy::NoWait => {
                            debug!(%txn, coupon = row, ?mode, ?blockers, "row lock busy, not waiting");
                            return Err(TxnError::LockNotAvailable { row });
                        }
                        WaitPolicy::SkipLocked => {
                            debug!(%txn, coupon = row, ?mode, ?blockers, "row lock busy, skipping row");
                            return Ok(Acquired::Skipped);
                        }
                        WaitPolicy::Block => {
                            store.locks.register_wait(txn, row, mode);
                            registration.armed = true;
                            if store.locks.would_deadlock(txn) {
                                store.locks.cancel_wait(txn);
                                registration.armed = false;
                                warn!(%txn, coupon = row, ?mode, ?blockers, "deadlock detected, victim rolls back");
                                return Err(TxnError::Deadlock { txn, row });
                            }
                            debug!(%txn, coupon = row, ?mode, ?blockers, "waiting for row lock");
                        }
                    },
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                warn!(%txn, coupon = row, ?mode, waited = ?timeout, "lock wait timeout");
                return Err(TxnError::LockWaitTimeout {
                    txn,
                    row,
                    waited: timeout,
                });
            }
        }
    }
}

/// Withdraws a pending lock request when the waiting future goes away.
struct WaitRegistration<'a> {
    coordinator: &'a Coordinator,
    txn: TxnId,
    armed: bool,
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.store().locks.cancel_wait(self.txn);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn coordinator() -> Coordinator {
        Coordinator::new(Config::default().with_lock_wait_timeout(Duration::from_millis(50)))
    }

    #[test]
    fn transaction_ids_are_unique() {
        let coordinator = coordinator();
        let a = coordinator.create_unit_of_work();
        let b = coordinator.begin(None);
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn no_wait_fails_immediately_on_busy_row() {
        let coordinator = coordinator();
        coordinator
            .acquire(TxnId(1), 1, LockMode::Exclusive, WaitPolicy::Block)
            .await
            .unwrap();

        let result = coordinator
            .acquire(TxnId(2), 1, LockMode::Shared, WaitPolicy::NoWait)
            .await;
        assert_eq!(result, Err(TxnError::LockNotAvailable { row: 1 }));
    }

    #[tokio::test]
    async fn skip_locked_reports_skipped() {
        let coordinator = coordinator();
        coordinator
            .acquire(TxnId(1), 1, LockMode::Exclusive, WaitPolicy::Block)
            .await
            .unwrap();

        let result = coordinator
            .acquire(TxnId(2), 1, LockMode::Exclusive, WaitPolicy::SkipLocked)
            .await;
        assert_eq!(result, Ok(Acquired::Skipped));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_request_times_out_and_withdraws_its_wait() {
        let coordinator = coordinator();
        coordinator
            .acquire(TxnId(1), 1, LockMode::Exclusive, WaitPolicy::Block)
            .await
            .unwrap();

        let start = Instant::now();
        let result = coordinator
            .acquire(TxnId(2), 1, LockMode::Exclusive, WaitPolicy::Block)
            .await;
        assert!(matches!(result, Err(TxnError::LockWaitTimeout { row: 1, .. })));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!coordinator.store().locks.is_waiting(TxnId(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_woken_when_holder_releases() {
        let coordinator = coordinator();
        coordinator
            .acquire(TxnId(1), 1, LockMode::Exclusive, WaitPolicy::Block)
            .await
            .unwrap();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .acquire(TxnId(2), 1, LockMode::Exclusive, WaitPolicy::Block)
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(coordinator.store().locks.is_waiting(TxnId(2)));

        coordinator.store().locks.release_all(TxnId(1));
        coordinator.wake_waiters();

        assert_eq!(waiter.await.unwrap(), Ok(Acquired::Granted));
        assert!(coordinator.store().locks.holds(TxnId(2), 1, LockMode::Exclusive));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_an_upgrade_cycle_makes_the_requester_the_victim() {
        let coordinator = coordinator();
        for txn in [TxnId(1), TxnId(2)] {
            coordinator
                .acquire(txn, 1, LockMode::Shared, WaitPolicy::Block)
                .await
                .unwrap();
        }

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .acquire(TxnId(1), 1, LockMode::Exclusive, WaitPolicy::Block)
                    .await
            })
        };
        tokio::task::yield_now().await;

        let second = coordinator
            .acquire(TxnId(2), 1, LockMode::Exclusive, WaitPolicy::Block)
            .await;
        assert_eq!(second, Err(TxnError::Deadlock { txn: TxnId(2), row: 1 }));

        // victim rolls back, survivor upgrades
        coordinator.store().locks.release_all(TxnId(2));
        coordinator.wake_waiters();
        assert_eq!(first.await.unwrap(), Ok(Acquired::Granted));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_waiting_request_withdraws_it() {
        let coordinator = coordinator();
        coordinator
            .acquire(TxnId(1), 1, LockMode::Exclusive, WaitPolicy::Block)
            .await
            .unwrap();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .acquire(TxnId(2), 1, LockMode::Exclusive, WaitPolicy::Block)
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(coordinator.store().locks.is_waiting(TxnId(2)));

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert!(!coordinator.store().locks.is_waiting(TxnId(2)));
    }
}
