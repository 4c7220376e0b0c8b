//! Row lock table with a waits-for graph for deadlock detection.

use std::collections::{HashMap, HashSet};

use crate::model::{CouponId, LockMode, TxnId};

/// Shared/exclusive locks on coupon rows.
///
/// The table only answers "can this be granted now"; suspension and wake-ups
/// live in the coordinator.
#[derive(Debug, Default)]
pub struct LockTable {
    /// Granted locks per row; a transaction appears at most once per row.
    granted: HashMap<CouponId, Vec<(TxnId, LockMode)>>,
    /// Pending requests, one per transaction.
    waiting: HashMap<TxnId, (CouponId, LockMode)>,
}

impl LockTable {
    /// Grant `mode` on `row` to `txn` if every other holder is compatible.
    ///
    /// Holding `Shared` and asking for `Exclusive` upgrades in place. On conflict
    /// the blocking transactions are returned and nothing changes.
    pub fn try_acquire(
        &mut self,
        txn: TxnId,
        row: CouponId,
        mode: LockMode,
    ) -> Result<(), Vec<TxnId>> {
        let holders = self.granted.entry(row).or_default();
        let blockers: Vec<TxnId> = holders
            .iter()
            .filter(|&&(holder, held)| holder != txn && !held.compatible(mode))
            .map(|&(holder, _)| holder)
            .collect();
        if !blockers.is_empty() {
            return Err(blockers);
        }

        match holders.iter_mut().find(|(holder, _)| *holder == txn) {
            Some(entry) => entry.1 = entry.1.max(mode),
            None => holders.push((txn, mode)),
        }
        Ok(())
    }

    /// Whether `txn` holds at least `mode` on `row`.
    pub fn holds(&self, txn: TxnId, row: CouponId, mode: LockMode) -> bool {
        self.granted.get(&row).is_some_and(|holders| {
            holders
                .iter()
                .any(|&(holder, held)| holder == txn && held >= mode)
        })
    }

    /// Transactions currently holding a lock on `row`.
    pub fn holders(&self, row: CouponId) -> Vec<(TxnId, LockMode)> {
        self.granted.get(&row).cloned().unwrap_or_default()
    }

    pub fn register_wait(&mut self, txn: TxnId, row: CouponId, mode: LockMode) {
        self.waiting.insert(txn, (row, mode));
    }

    pub fn cancel_wait(&mut self, txn: TxnId) {
        self.waiting.remove(&txn);
    }

    pub fn is_waiting(&self, txn: TxnId) -> bool {
        self.waiting.contains_key(&txn)
    }

    /// Whether the wait registered for `txn` closes a cycle in the waits-for graph.
    pub fn would_deadlock(&self, txn: TxnId) -> bool {
        let mut stack = self.blockers_of(txn);
        let mut visited = HashSet::new();
        while let Some(next) = stack.pop() {
            if next == txn {
                return true;
            }
            if visited.insert(next) {
                stack.extend(self.blockers_of(next));
            }
        }
        false
    }

    /// Drop every lock and pending request of `txn`.
    ///
    /// Returns whether anything was released, i.e. whether waiters should be woken.
    pub fn release_all(&mut self, txn: TxnId) -> bool {
        let mut released = false;
        self.granted.retain(|_, holders| {
            let before = holders.len();
            holders.retain(|&(holder, _)| holder != txn);
            released |= holders.len() != before;
            !holders.is_empty()
        });
        self.waiting.remove(&txn);
        released
    }

    /// Outgoing waits-for edges of `txn`: holders incompatible with its pending request.
    fn blockers_of(&self, txn: TxnId) -> Vec<TxnId> {
        let Some(&(row, mode)) = self.waiting.get(&txn) else {
            return Vec::new();
        };
        self.granted
            .get(&row)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|&&(holder, held)| holder != txn && !held.compatible(mode))
                    .map(|&(holder, _)| holder)
                    .collect()
            })
            .unwrap_or_default()
    }
}
