//! Error types for units of work and the coupon service.

use std::time::Duration;

use thiserror::Error;

use crate::model::{CouponId, TxnId, Version};

/// Failure raised inside a unit of work.
///
/// Contention failures are translated into an [`ErrorKind`](crate::outcome::ErrorKind)
/// by the outcome reporter; the remaining variants are internal faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxnError {
    #[error("no available coupon")]
    NoAvailableCoupon,

    #[error("row lock on coupon {row} could not be acquired immediately and NOWAIT is set")]
    LockNotAvailable { row: CouponId },

    #[error("deadlock detected while {txn} waited for coupon {row}; rolled back as victim")]
    Deadlock { txn: TxnId, row: CouponId },

    #[error("{txn} waited more than {waited:?} for the lock on coupon {row}")]
    LockWaitTimeout {
        txn: TxnId,
        row: CouponId,
        waited: Duration,
    },

    #[error("coupon {row} changed since version {expected} was read")]
    VersionConflict { row: CouponId, expected: Version },

    #[error("could not serialize {txn}: coupon {row} was committed concurrently")]
    SerializationFailure { txn: TxnId, row: CouponId },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("coupon {0} does not exist")]
    CouponNotFound(CouponId),

    #[error("{0} has not been started")]
    NotStarted(TxnId),

    #[error("{0} is already started")]
    AlreadyStarted(TxnId),

    #[error("{0} has already finished")]
    Finished(TxnId),
}

/// Error returned by [`CouponService`](crate::policy::CouponService) operations.
///
/// Only faults outside the contention taxonomy end up here.
#[derive(Debug, Error)]
pub enum CouponError {
    #[error(transparent)]
    Txn(#[from] TxnError),

    #[error("assignment task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
