use crate::model::{CommitSeq, Isolation};

/// Lifecycle of a unit of work.
///
/// `Idle -> Started -> {Committed | RolledBack}`; the last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Idle,
    Started {
        isolation: Isolation,
        snapshot: CommitSeq,
    },
    Committed,
    RolledBack,
}

impl TxnState {
    pub fn is_active(&self) -> bool {
        matches!(self, TxnState::Started { .. })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TxnState::Committed | TxnState::RolledBack)
    }
}
