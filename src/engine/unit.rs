use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use super::{Acquired, Coordinator, TxnError, TxnState};
use crate::model::{
    CommitSeq, Coupon, CouponId, CouponPatch, Isolation, LockMode, RowLock, TxnId, User, UserId,
    Version, WaitPolicy,
};
use crate::store::{Store, View};

/// One caller's transaction against the store.
///
/// Every read and write goes through a started unit of work. Dropping one that
/// is still open rolls it back and releases its locks, which is also how an
/// abandoned (cancelled) caller leaves the store untouched.
pub struct UnitOfWork {
    coordinator: Coordinator,
    id: TxnId,
    state: TxnState,
    /// Coupons read under serializable isolation, certified at commit.
    read_set: BTreeSet<CouponId>,
    /// A serializable predicate scan ran; inserts after the snapshot conflict.
    scanned: bool,
    wrote: bool,
}

/// Lifecycle
impl UnitOfWork {
    pub(super) fn new(coordinator: Coordinator, id: TxnId) -> Self {
        Self {
            coordinator,
            id,
            state: TxnState::Idle,
            read_set: BTreeSet::new(),
            scanned: false,
            wrote: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn isolation(&self) -> Option<Isolation> {
        match self.state {
            TxnState::Started { isolation, .. } => Some(isolation),
            _ => None,
        }
    }

    /// Move from `Idle` to `Started`; `None` uses the configured default isolation.
    pub fn start(&mut self, isolation: Option<Isolation>) -> Result<(), TxnError> {
        match self.state {
            TxnState::Idle => {
                self.enter(isolation);
                Ok(())
            }
            TxnState::Started { .. } => Err(TxnError::AlreadyStarted(self.id)),
            TxnState::Committed | TxnState::RolledBack => Err(TxnError::Finished(self.id)),
        }
    }

    pub(super) fn enter(&mut self, isolation: Option<Isolation>) {
        let isolation = isolation.unwrap_or(self.coordinator.config().default_isolation);
        let snapshot = self.coordinator.store().begin(self.id);
        self.state = TxnState::Started {
            isolation,
            snapshot,
        };
        debug!(txn = %self.id, %isolation, ?snapshot, "transaction started");
    }

    /// Publish staged writes and release every lock.
    ///
    /// A serializable unit of work that wrote is certified first: if a coupon it
    /// read was committed by someone else after its snapshot, or a row appeared
    /// under one of its scans, it is rolled back and
    /// [`TxnError::SerializationFailure`] is returned.
    pub fn commit(&mut self) -> Result<(), TxnError> {
        let (isolation, snapshot) = self.started()?;
        let (conflict, seq, released) = {
            let mut store = self.coordinator.store();
            let conflict = match isolation {
                Isolation::Serializable if self.wrote => self.certify(&store, snapshot),
                _ => None,
            };
            let seq = match conflict {
                Some(_) => {
                    store.rollback(self.id);
                    None
                }
                None => store.commit(self.id),
            };
            let released = store.locks.release_all(self.id);
            (conflict, seq, released)
        };
        if released {
            self.coordinator.wake_waiters();
        }

        if let Some(row) = conflict {
            self.state = TxnState::RolledBack;
            warn!(txn = %self.id, coupon = row, "serialization failure at commit, rolled back");
            return Err(TxnError::SerializationFailure { txn: self.id, row });
        }

        self.state = TxnState::Committed;
        info!(txn = %self.id, commit = ?seq, "transaction committed");
        Ok(())
    }

    /// Discard staged writes and release every lock.
    pub fn rollback(&mut self) -> Result<(), TxnError> {
        self.started()?;
        self.abort();
        info!(txn = %self.id, "transaction rolled back");
        Ok(())
    }

    /// Commit if `result` is `Ok`, roll back otherwise, then hand `result` back.
    pub fn settle<T>(&mut self, result: Result<T, TxnError>) -> Result<T, TxnError> {
        match result {
            Ok(value) => self.commit().map(|()| value),
            Err(err) => {
                if self.is_active() {
                    self.rollback()?;
                }
                Err(err)
            }
        }
    }

    /// Give the unit of work back. An open transaction is rolled back.
    pub fn release(self) {
        drop(self);
    }
}

/// Reads
impl UnitOfWork {
    pub fn find_coupon(&mut self, id: CouponId) -> Result<Option<Coupon>, TxnError> {
        let view = self.view(false)?;
        let coupon = self.coordinator.store().coupon(id, &view).cloned();
        self.note_read(id);
        Ok(coupon)
    }

    pub fn find_coupon_by_code(&mut self, code: &str) -> Result<Option<Coupon>, TxnError> {
        Ok(self
            .find_coupons(|coupon| coupon.code == code)?
            .into_iter()
            .next())
    }

    /// Plain (non-locking) read of the lowest-id unredeemed coupon.
    pub fn find_one_unredeemed(&mut self) -> Result<Option<Coupon>, TxnError> {
        Ok(self.find_coupons(|coupon| !coupon.redeemed)?.into_iter().next())
    }

    pub fn find_all_unredeemed(&mut self) -> Result<Vec<Coupon>, TxnError> {
        self.find_coupons(|coupon| !coupon.redeemed)
    }

    /// Plain predicate scan, ascending by id.
    pub fn find_coupons(
        &mut self,
        predicate: impl Fn(&Coupon) -> bool,
    ) -> Result<Vec<Coupon>, TxnError> {
        let view = self.scan_view()?;
        let coupons: Vec<Coupon> = self
            .coordinator
            .store()
            .coupons(view, predicate)
            .cloned()
            .collect();
        self.scanned = true;
        for coupon in &coupons {
            self.note_read(coupon.id);
        }
        Ok(coupons)
    }

    /// Query builder for lock-aware reads.
    pub fn query(&mut self) -> CouponQuery<'_> {
        CouponQuery {
            unit: self,
            lock: None,
        }
    }

    pub fn find_user(&mut self, id: UserId) -> Result<Option<User>, TxnError> {
        let view = self.view(false)?;
        Ok(self.coordinator.store().user(id, &view).cloned())
    }

    /// Locking scan over unredeemed coupons in id order.
    ///
    /// Each candidate is locked, then re-read at its latest committed version;
    /// rows that stopped matching while we waited are passed over.
    async fn lock_unredeemed(
        &mut self,
        lock: RowLock,
        limit: Option<usize>,
    ) -> Result<Vec<Coupon>, TxnError> {
        let view = self.view(true)?;
        let candidates: Vec<CouponId> = self
            .coordinator
            .store()
            .coupons(view, |coupon| !coupon.redeemed)
            .map(|coupon| coupon.id)
            .collect();

        let mut found = Vec::new();
        for id in candidates {
            if limit.is_some_and(|limit| found.len() >= limit) {
                break;
            }
            let acquired = self
                .coordinator
                .acquire(self.id, id, lock.mode, lock.wait)
                .await?;
            if acquired == Acquired::Skipped {
                continue;
            }

            let current = self.coordinator.store().coupon(id, &view).cloned();
            match current {
                Some(coupon) if !coupon.redeemed => {
                    self.note_read(id);
                    found.push(coupon);
                }
                _ => debug!(txn = %self.id, coupon = id, "candidate no longer matches"),
            }
        }
        Ok(found)
    }
}

/// Writes
impl UnitOfWork {
    /// Stage a new unredeemed coupon.
    pub fn insert_coupon(&mut self, code: &str) -> Result<Coupon, TxnError> {
        self.started()?;
        let coupon = self.coordinator.store().insert_coupon(self.id, code);
        self.wrote = true;
        Ok(coupon)
    }

    /// Overwrite the stored row with `coupon`, stamping `coupon.version + 1`.
    ///
    /// No version comparison happens: the last writer wins.
    pub async fn save(&mut self, coupon: &Coupon) -> Result<Coupon, TxnError> {
        self.validate(coupon.redeemed, coupon.owner)?;
        self.lock_for_write(coupon.id).await?;
        let view = self.view(true)?;

        let mut image = coupon.clone();
        image.version = coupon.version + 1;
        {
            let mut store = self.coordinator.store();
            if store.coupon(coupon.id, &view).is_none() {
                return Err(TxnError::CouponNotFound(coupon.id));
            }
            store.stage_coupon(self.id, coupon.id, Some(image.clone()));
        }
        self.wrote = true;
        debug!(txn = %self.id, coupon = image.id, version = image.version, "coupon saved");
        Ok(image)
    }

    /// Apply `coupon`'s redeemed flag and owner to the stored row, bumping its version.
    ///
    /// With `expected` set the write only happens while the stored version still
    /// equals it; a mismatch (or a missing row) returns `false`.
    pub async fn update(
        &mut self,
        coupon: &Coupon,
        expected: Option<Version>,
    ) -> Result<bool, TxnError> {
        self.apply_patch(coupon.id, CouponPatch::from(coupon), expected)
            .await
    }

    pub async fn apply_patch(
        &mut self,
        id: CouponId,
        patch: CouponPatch,
        expected: Option<Version>,
    ) -> Result<bool, TxnError> {
        self.validate(patch.redeemed, patch.owner)?;
        self.lock_for_write(id).await?;
        let view = self.view(true)?;

        let staged = {
            let mut store = self.coordinator.store();
            match store.coupon(id, &view).cloned() {
                Some(current) if expected.is_none_or(|version| version == current.version) => {
                    let mut image = current;
                    patch.apply(&mut image);
                    image.version += 1;
                    store.stage_coupon(self.id, id, Some(image));
                    true
                }
                _ => false,
            }
        };
        if staged {
            self.wrote = true;
        } else {
            debug!(txn = %self.id, coupon = id, ?expected, "update matched no row");
        }
        Ok(staged)
    }

    /// Stage deletes of every coupon this unit of work can see.
    pub async fn delete_all_coupons(&mut self) -> Result<usize, TxnError> {
        let view = self.view(true)?;
        let ids: Vec<CouponId> = self
            .coordinator
            .store()
            .coupons(view, |_| true)
            .map(|coupon| coupon.id)
            .collect();

        let mut deleted = 0;
        for id in ids {
            self.coordinator
                .acquire(self.id, id, LockMode::Exclusive, WaitPolicy::Block)
                .await?;
            let mut store = self.coordinator.store();
            if store.coupon(id, &view).is_some() {
                store.stage_coupon(self.id, id, None);
                deleted += 1;
            }
        }
        self.wrote |= deleted > 0;
        Ok(deleted)
    }

    pub fn insert_user(&mut self, name: &str) -> Result<User, TxnError> {
        self.started()?;
        let user = self.coordinator.store().insert_user(self.id, name);
        self.wrote = true;
        Ok(user)
    }

    pub fn delete_all_users(&mut self) -> Result<usize, TxnError> {
        let view = self.view(false)?;
        let deleted = self.coordinator.store().delete_users(&view);
        self.wrote |= deleted > 0;
        Ok(deleted)
    }
}

/// Private API
impl UnitOfWork {
    fn started(&self) -> Result<(Isolation, CommitSeq), TxnError> {
        match self.state {
            TxnState::Started {
                isolation,
                snapshot,
            } => Ok((isolation, snapshot)),
            TxnState::Idle => Err(TxnError::NotStarted(self.id)),
            TxnState::Committed | TxnState::RolledBack => Err(TxnError::Finished(self.id)),
        }
    }

    fn view(&self, current: bool) -> Result<View, TxnError> {
        let (isolation, snapshot) = self.started()?;
        Ok(View {
            txn: self.id,
            isolation,
            snapshot,
            current,
            include_new_rows: false,
        })
    }

    fn scan_view(&self) -> Result<View, TxnError> {
        let mut view = self.view(false)?;
        view.include_new_rows = view.isolation == Isolation::RepeatableRead
            && !self.coordinator.config().repeatable_read_phantom_protection;
        Ok(view)
    }

    fn note_read(&mut self, id: CouponId) {
        if self.isolation() == Some(Isolation::Serializable) {
            self.read_set.insert(id);
        }
    }

    /// First coupon whose committed state moved past `snapshot` under our reads.
    fn certify(&self, store: &Store, snapshot: CommitSeq) -> Option<CouponId> {
        self.read_set
            .iter()
            .copied()
            .find(|&id| store.latest_coupon_seq(id) > snapshot)
            .or_else(|| {
                self.scanned
                    .then(|| store.first_coupon_inserted_after(snapshot))
                    .flatten()
            })
    }

    /// Owner references must point at a visible user and agree with the redeemed flag.
    fn validate(&self, redeemed: bool, owner: Option<UserId>) -> Result<(), TxnError> {
        if redeemed != owner.is_some() {
            return Err(TxnError::Validation(format!(
                "redeemed={redeemed} disagrees with owner {owner:?}"
            )));
        }
        if let Some(user) = owner {
            let view = self.view(false)?;
            if self.coordinator.store().user(user, &view).is_none() {
                return Err(TxnError::Validation(format!("unknown user {user}")));
            }
        }
        Ok(())
    }

    /// Exclusive row lock for a write; serializable writers also lose to any
    /// commit on the row after their snapshot (first updater wins).
    async fn lock_for_write(&mut self, id: CouponId) -> Result<(), TxnError> {
        let (isolation, snapshot) = self.started()?;
        self.coordinator
            .acquire(self.id, id, LockMode::Exclusive, WaitPolicy::Block)
            .await?;
        if isolation == Isolation::Serializable
            && self.coordinator.store().latest_coupon_seq(id) > snapshot
        {
            warn!(txn = %self.id, coupon = id, "concurrent update, serialization failure");
            return Err(TxnError::SerializationFailure { txn: self.id, row: id });
        }
        Ok(())
    }

    fn abort(&mut self) {
        let released = {
            let mut store = self.coordinator.store();
            store.rollback(self.id);
            store.locks.release_all(self.id)
        };
        if released {
            self.coordinator.wake_waiters();
        }
        self.state = TxnState::RolledBack;
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.state.is_active() {
            debug!(txn = %self.id, "released while open, rolling back");
            self.abort();
        }
    }
}

/// Lock-aware query over coupons, built from [`UnitOfWork::query`].
pub struct CouponQuery<'a> {
    unit: &'a mut UnitOfWork,
    lock: Option<RowLock>,
}

impl CouponQuery<'_> {
    /// `FOR SHARE` / `FOR UPDATE` with the given wait policy.
    pub fn with_lock(mut self, mode: LockMode, wait: WaitPolicy) -> Self {
        self.lock = Some(RowLock { mode, wait });
        self
    }

    /// Lowest-id unredeemed coupon, locked if a lock was requested.
    pub async fn one_unredeemed(self) -> Result<Option<Coupon>, TxnError> {
        match self.lock {
            None => self.unit.find_one_unredeemed(),
            Some(lock) => Ok(self
                .unit
                .lock_unredeemed(lock, Some(1))
                .await?
                .into_iter()
                .next()),
        }
    }

    pub async fn all_unredeemed(self) -> Result<Vec<Coupon>, TxnError> {
        match self.lock {
            None => self.unit.find_all_unredeemed(),
            Some(lock) => self.unit.lock_unredeemed(lock, None).await,
        }
    }
}
