//! Caller-facing result of an assignment attempt.

use std::fmt;

use crate::engine::TxnError;
use crate::model::Coupon;

/// Contention outcomes a caller is expected to assert against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NoAvailableResource,
    LockNotAvailable,
    Deadlock,
    LockWaitTimeout,
    VersionConflict,
    SerializationFailure,
    Validation,
}

impl ErrorKind {
    /// Map a unit-of-work failure onto the taxonomy.
    ///
    /// Returns `None` for internal faults (misused units of work, missing rows),
    /// which are not contention outcomes and must be re-raised.
    pub fn classify(err: &TxnError) -> Option<Self> {
        match err {
            TxnError::NoAvailableCoupon => Some(ErrorKind::NoAvailableResource),
            TxnError::LockNotAvailable { .. } => Some(ErrorKind::LockNotAvailable),
            TxnError::Deadlock { .. } => Some(ErrorKind::Deadlock),
            TxnError::LockWaitTimeout { .. } => Some(ErrorKind::LockWaitTimeout),
            TxnError::VersionConflict { .. } => Some(ErrorKind::VersionConflict),
            TxnError::SerializationFailure { .. } => Some(ErrorKind::SerializationFailure),
            TxnError::Validation(_) => Some(ErrorKind::Validation),
            TxnError::CouponNotFound(_)
            | TxnError::NotStarted(_)
            | TxnError::AlreadyStarted(_)
            | TxnError::Finished(_) => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            ErrorKind::NoAvailableResource => "No available coupon",
            ErrorKind::LockNotAvailable => {
                "Statement aborted because lock(s) could not be acquired immediately and NOWAIT is set."
            }
            ErrorKind::Deadlock => {
                "Deadlock found when trying to get lock; try restarting transaction"
            }
            ErrorKind::LockWaitTimeout => "Lock wait timeout exceeded; try restarting transaction",
            ErrorKind::VersionConflict => "Optimistic lock version mismatch",
            ErrorKind::SerializationFailure => {
                "Could not serialize access due to concurrent update"
            }
            ErrorKind::Validation => "Invalid input",
        };
        f.write_str(message)
    }
}

/// What one assignment attempt saw, wrote and failed with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    /// Coupon observed by the attempt's read, before any write.
    pub read: Option<Coupon>,
    /// Coupon as written by this attempt, if it won.
    pub written: Option<Coupon>,
    pub error: Option<ErrorKind>,
}

impl Outcome {
    pub fn won(&self) -> bool {
        self.written.is_some()
    }
}

/// Assemble an [`Outcome`] from a finished attempt.
///
/// Contention failures become `Outcome::error`; anything else is handed back as
/// an error for the caller to propagate.
pub fn report(read: Option<Coupon>, result: Result<Coupon, TxnError>) -> Result<Outcome, TxnError> {
    match result {
        Ok(written) => Ok(Outcome {
            read,
            written: Some(written),
            error: None,
        }),
        Err(err) => match ErrorKind::classify(&err) {
            Some(kind) => Ok(Outcome {
                read,
                written: None,
                error: Some(kind),
            }),
            None => Err(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TxnId;

    #[test]
    fn successful_write_is_a_win() {
        let mut coupon = Coupon::new(1, "C1");
        let read = coupon.clone();
        coupon.redeem(2);
        coupon.version = 1;

        let outcome = report(Some(read.clone()), Ok(coupon.clone())).unwrap();
        assert!(outcome.won());
        assert_eq!(outcome.read, Some(read));
        assert_eq!(outcome.written, Some(coupon));
        assert_eq!(outcome.error, None);
    }

    #[test]
    fn contention_failures_are_reported_not_raised() {
        let read = Some(Coupon::new(1, "C1"));
        let outcome = report(
            read.clone(),
            Err(TxnError::VersionConflict {
                row: 1,
                expected: 0,
            }),
        )
        .unwrap();
        assert!(!outcome.won());
        assert_eq!(outcome.read, read);
        assert_eq!(outcome.error, Some(ErrorKind::VersionConflict));
    }

    #[test]
    fn internal_faults_are_raised() {
        let err = TxnError::Finished(TxnId(3));
        assert_eq!(report(None, Err(err.clone())), Err(err));
        assert_eq!(ErrorKind::classify(&TxnError::CouponNotFound(1)), None);
    }

    #[test]
    fn messages_match_the_reference_engine() {
        assert_eq!(ErrorKind::NoAvailableResource.to_string(), "No available coupon");
        assert_eq!(
            ErrorKind::Deadlock.to_string(),
            "Deadlock found when trying to get lock; try restarting transaction"
        );
        assert_eq!(
            ErrorKind::VersionConflict.to_string(),
            "Optimistic lock version mismatch"
        );
    }
}
