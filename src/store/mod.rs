//! Versioned coupon and user tables.
//!
//! Each row keeps its committed versions in commit order plus at most one
//! uncommitted image staged by the transaction holding the row's exclusive
//! lock. What a reader sees is decided by its [`View`].

use std::collections::BTreeMap;

use crate::model::{CommitSeq, Coupon, CouponId, Isolation, LockMode, TxnId, User, UserId};

mod lock;
pub use lock::LockTable;

/// How a statement looks at the tables.
#[derive(Debug, Clone, Copy)]
pub struct View {
    pub txn: TxnId,
    pub isolation: Isolation,
    /// Last commit visible to snapshot reads.
    pub snapshot: CommitSeq,
    /// Locking read: always the latest committed version.
    pub current: bool,
    /// Snapshot scans also see rows first committed after the snapshot.
    pub include_new_rows: bool,
}

#[derive(Debug, Clone)]
struct RowVersion<T> {
    seq: CommitSeq,
    /// `None` is a committed delete.
    image: Option<T>,
}

#[derive(Debug, Clone)]
struct Pending<T> {
    txn: TxnId,
    image: Option<T>,
}

#[derive(Debug, Clone)]
struct Row<T> {
    /// First commit of the row; survives pruning of the versions it made.
    created: Option<CommitSeq>,
    versions: Vec<RowVersion<T>>,
    pending: Option<Pending<T>>,
}

impl<T> Row<T> {
    fn inserted(txn: TxnId, image: T) -> Self {
        Self {
            created: None,
            versions: Vec::new(),
            pending: Some(Pending {
                txn,
                image: Some(image),
            }),
        }
    }

    fn created_seq(&self) -> Option<CommitSeq> {
        self.created
    }

    fn latest_seq(&self) -> CommitSeq {
        self.versions.last().map_or(CommitSeq(0), |v| v.seq)
    }

    fn visible(&self, view: &View) -> Option<&T> {
        if let Some(pending) = &self.pending {
            let dirty = view.isolation == Isolation::ReadUncommitted && !view.current;
            if pending.txn == view.txn || dirty {
                return pending.image.as_ref();
            }
        }

        let new_row = self.created_seq().is_some_and(|seq| seq > view.snapshot);
        let latest = view.current
            || !view.isolation.reads_snapshot()
            || (view.include_new_rows && new_row);
        let version = if latest {
            self.versions.last()
        } else {
            self.versions.iter().rev().find(|v| v.seq <= view.snapshot)
        };
        version.and_then(|v| v.image.as_ref())
    }

    fn stage(&mut self, txn: TxnId, image: Option<T>) {
        self.pending = Some(Pending { txn, image });
    }

    /// Move `txn`'s staged image into the version chain. Returns whether it had one.
    fn commit(&mut self, txn: TxnId, seq: CommitSeq) -> bool {
        match self.pending.take() {
            Some(pending) if pending.txn == txn => {
                self.created.get_or_insert(seq);
                self.versions.push(RowVersion {
                    seq,
                    image: pending.image,
                });
                true
            }
            other => {
                self.pending = other;
                false
            }
        }
    }

    fn discard(&mut self, txn: TxnId) {
        if self.pending.as_ref().is_some_and(|p| p.txn == txn) {
            self.pending = None;
        }
    }

    /// Drop versions no snapshot at or after `horizon` can reach.
    ///
    /// A committed delete that is the only version left goes too, emptying the row.
    fn prune(&mut self, horizon: CommitSeq) {
        if let Some(oldest_needed) = self.versions.iter().rposition(|v| v.seq <= horizon) {
            self.versions.drain(..oldest_needed);
        }
        let tombstone = matches!(
            self.versions.as_slice(),
            [only] if only.image.is_none() && only.seq <= horizon
        );
        if tombstone && self.pending.is_none() {
            self.versions.clear();
        }
    }

    fn is_dead(&self) -> bool {
        self.versions.is_empty() && self.pending.is_none()
    }
}

/// The single source of truth for coupons, users and row locks.
#[derive(Debug, Default)]
pub struct Store {
    coupons: BTreeMap<CouponId, Row<Coupon>>,
    users: BTreeMap<UserId, Row<User>>,
    next_coupon: CouponId,
    next_user: UserId,
    last_commit: CommitSeq,
    /// Snapshots of started, unfinished transactions.
    open: BTreeMap<TxnId, CommitSeq>,
    pub locks: LockTable,
}

/// Public API
impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last assigned commit sequence; snapshots are taken from it.
    pub fn snapshot(&self) -> CommitSeq {
        self.last_commit
    }

    /// Take a snapshot for `txn` and keep the versions it can see until it ends.
    pub fn begin(&mut self, txn: TxnId) -> CommitSeq {
        let snapshot = self.last_commit;
        self.open.insert(txn, snapshot);
        snapshot
    }

    pub fn coupon(&self, id: CouponId, view: &View) -> Option<&Coupon> {
        self.coupons.get(&id).and_then(|row| row.visible(view))
    }

    /// Visible coupons matching `predicate`, ascending by id.
    pub fn coupons<'a>(
        &'a self,
        view: View,
        predicate: impl Fn(&Coupon) -> bool + 'a,
    ) -> impl Iterator<Item = &'a Coupon> + 'a {
        self.coupons
            .values()
            .filter_map(move |row| row.visible(&view))
            .filter(move |coupon| predicate(coupon))
    }

    /// Lowest-id unredeemed coupon.
    pub fn find_one_unredeemed(&self, view: &View) -> Option<&Coupon> {
        self.coupons(*view, |c| !c.redeemed).next()
    }

    pub fn find_all_unredeemed(&self, view: &View) -> Vec<Coupon> {
        self.coupons(*view, |c| !c.redeemed).cloned().collect()
    }

    pub fn user(&self, id: UserId, view: &View) -> Option<&User> {
        self.users.get(&id).and_then(|row| row.visible(view))
    }

    pub fn users(&self, view: View) -> impl Iterator<Item = &User> + '_ {
        self.users.values().filter_map(move |row| row.visible(&view))
    }

    /// Commit sequence of the newest committed version of a coupon row.
    pub fn latest_coupon_seq(&self, id: CouponId) -> CommitSeq {
        self.coupons
            .get(&id)
            .map_or(CommitSeq(0), |row| row.latest_seq())
    }

    /// Lowest-id coupon row first committed after `snapshot`, if any.
    pub fn first_coupon_inserted_after(&self, snapshot: CommitSeq) -> Option<CouponId> {
        self.coupons
            .iter()
            .find(|(_, row)| row.created_seq().is_some_and(|seq| seq > snapshot))
            .map(|(&id, _)| id)
    }

    /// Allocate an id and stage a new coupon for `txn`, exclusively locked.
    pub fn insert_coupon(&mut self, txn: TxnId, code: &str) -> Coupon {
        self.next_coupon += 1;
        let coupon = Coupon::new(self.next_coupon, code);
        self.coupons
            .insert(coupon.id, Row::inserted(txn, coupon.clone()));
        let granted = self.locks.try_acquire(txn, coupon.id, LockMode::Exclusive);
        debug_assert!(granted.is_ok(), "fresh coupon id {} already locked", coupon.id);
        coupon
    }

    pub fn insert_user(&mut self, txn: TxnId, name: &str) -> User {
        self.next_user += 1;
        let user = User {
            id: self.next_user,
            name: name.to_string(),
        };
        self.users.insert(user.id, Row::inserted(txn, user.clone()));
        user
    }

    /// Stage a new image (or a delete) of a coupon row.
    ///
    /// The caller must hold the row's exclusive lock.
    pub fn stage_coupon(&mut self, txn: TxnId, id: CouponId, image: Option<Coupon>) {
        debug_assert!(self.locks.holds(txn, id, LockMode::Exclusive));
        if let Some(row) = self.coupons.get_mut(&id) {
            row.stage(txn, image);
        }
    }

    /// Stage deletes of every user visible to `view`; rows staged by others are left alone.
    pub fn delete_users(&mut self, view: &View) -> usize {
        let mut deleted = 0;
        for row in self.users.values_mut() {
            let foreign = row.pending.as_ref().is_some_and(|p| p.txn != view.txn);
            if !foreign && row.visible(view).is_some() {
                row.stage(view.txn, None);
                deleted += 1;
            }
        }
        deleted
    }

    /// Publish every image staged by `txn` under a new commit sequence.
    ///
    /// Read-only transactions do not consume a sequence number.
    pub fn commit(&mut self, txn: TxnId) -> Option<CommitSeq> {
        let seq = CommitSeq(self.last_commit.0 + 1);
        let mut wrote = false;
        for row in self.coupons.values_mut() {
            wrote |= row.commit(txn, seq);
        }
        for row in self.users.values_mut() {
            wrote |= row.commit(txn, seq);
        }
        if wrote {
            self.last_commit = seq;
        }
        self.open.remove(&txn);
        self.prune();
        wrote.then_some(seq)
    }

    /// Throw away every image staged by `txn`, including rows it inserted.
    pub fn rollback(&mut self, txn: TxnId) {
        for row in self.coupons.values_mut() {
            row.discard(txn);
        }
        for row in self.users.values_mut() {
            row.discard(txn);
        }
        self.open.remove(&txn);
        self.prune();
    }
}

/// Private API
impl Store {
    /// Trim version chains down to what the oldest open snapshot needs.
    fn prune(&mut self) {
        let horizon = self
            .open
            .values()
            .min()
            .copied()
            .unwrap_or(self.last_commit);
        for row in self.coupons.values_mut() {
            row.prune(horizon);
        }
        for row in self.users.values_mut() {
            row.prune(horizon);
        }
        self.coupons.retain(|_, row| !row.is_dead());
        self.users.retain(|_, row| !row.is_dead());
    }
}
