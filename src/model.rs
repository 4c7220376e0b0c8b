//! Core domain types for the coupon store.

use std::fmt;

/// Coupon identifier, allocated by the store.
pub type CouponId = u64;

/// User identifier, allocated by the store.
pub type UserId = u64;

/// Optimistic version counter of a coupon row.
pub type Version = u64;

/// Unit of work identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

/// Position of a commit in the store's global commit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CommitSeq(pub u64);

/// A coupon row.
///
/// `redeemed` and `owner` move together: a coupon is redeemed iff it has an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coupon {
    pub id: CouponId,
    pub code: String,
    pub redeemed: bool,
    pub owner: Option<UserId>,
    pub version: Version,
}

impl Coupon {
    /// A fresh, unredeemed coupon with no owner at version 0.
    pub fn new(id: CouponId, code: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
            redeemed: false,
            owner: None,
            version: 0,
        }
    }

    /// Mark the coupon as redeemed by `user`.
    pub fn redeem(&mut self, user: UserId) {
        self.redeemed = true;
        self.owner = Some(user);
    }

    /// Whether the redeemed flag agrees with the owner reference.
    pub fn is_consistent(&self) -> bool {
        self.redeemed == self.owner.is_some()
    }
}

/// The mutable columns of a coupon, applied by a conditional update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CouponPatch {
    pub redeemed: bool,
    pub owner: Option<UserId>,
}

impl CouponPatch {
    pub fn redeem(user: UserId) -> Self {
        Self {
            redeemed: true,
            owner: Some(user),
        }
    }

    pub fn apply(&self, coupon: &mut Coupon) {
        coupon.redeemed = self.redeemed;
        coupon.owner = self.owner;
    }
}

impl From<&Coupon> for CouponPatch {
    fn from(coupon: &Coupon) -> Self {
        Self {
            redeemed: coupon.redeemed,
            owner: coupon.owner,
        }
    }
}

/// A user that may own coupons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

/// Transaction isolation levels, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum Isolation {
    /// Sees other units of work's uncommitted writes.
    ReadUncommitted,
    /// Sees the latest committed data at every statement.
    ReadCommitted,
    /// Reads from the snapshot taken when the unit of work started.
    RepeatableRead,
    /// Snapshot reads, certified against concurrent writers.
    Serializable,
}

impl Isolation {
    /// Whether plain reads are served from the start-of-transaction snapshot.
    pub fn reads_snapshot(self) -> bool {
        matches!(self, Isolation::RepeatableRead | Isolation::Serializable)
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Isolation::ReadUncommitted => "READ UNCOMMITTED",
            Isolation::ReadCommitted => "READ COMMITTED",
            Isolation::RepeatableRead => "REPEATABLE READ",
            Isolation::Serializable => "SERIALIZABLE",
        };
        f.write_str(name)
    }
}

/// Row lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Many holders may read.
    Shared,
    /// A single holder may read and write.
    Exclusive,
}

impl LockMode {
    pub fn compatible(self, other: Self) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// What a locking read does when the row lock is held by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Wait for the holder, bounded by the configured lock wait timeout.
    #[default]
    Block,
    /// Fail immediately.
    NoWait,
    /// Pass over the locked row and keep scanning.
    SkipLocked,
}

/// Locking clause of a read: `FOR SHARE` / `FOR UPDATE` plus its wait policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLock {
    pub mode: LockMode,
    pub wait: WaitPolicy,
}

impl RowLock {
    pub fn shared() -> Self {
        Self {
            mode: LockMode::Shared,
            wait: WaitPolicy::Block,
        }
    }

    pub fn exclusive() -> Self {
        Self {
            mode: LockMode::Exclusive,
            wait: WaitPolicy::Block,
        }
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }
}
