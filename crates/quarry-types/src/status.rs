//! Transaction status state machine.

use std::fmt;

/// The lifecycle states of a transaction.
///
/// Forward processing moves `Running` into one of the three terminal-bound
/// states and from there to `Complete`; restart recovery additionally uses
/// `RecoveryAborting` for transactions it must roll back itself. There are
/// no backwards edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TxnStatus {
    /// Actively doing work.
    Running,
    /// A commit record has been written; waiting for the flush and END.
    Committing,
    /// The user asked for an abort; rollback happens at END.
    Aborting,
    /// Restart recovery decided this transaction must be rolled back.
    RecoveryAborting,
    /// Finished; an END record terminates the chain.
    Complete,
}

impl TxnStatus {
    /// Distance from `Running` in the state machine. Transitions may only
    /// increase this.
    const fn rank(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Committing | Self::Aborting | Self::RecoveryAborting => 1,
            Self::Complete => 2,
        }
    }

    /// The partial transition function.
    ///
    /// Returns the state to move to if going from `self` to `target` is a
    /// legal forward move, or `None` if it would be a backwards or sideways
    /// move (e.g. `Committing -> Running`, `Aborting -> Committing`).
    /// Self-transitions are legal no-ops.
    #[must_use]
    pub fn transition(self, target: Self) -> Option<Self> {
        if self == target {
            return Some(target);
        }
        (target.rank() > self.rank()).then_some(target)
    }

    /// Whether this status can still produce log records.
    #[must_use]
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Complete)
    }

    /// Wire tag used by checkpoint records.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Committing => 1,
            Self::Aborting => 2,
            Self::RecoveryAborting => 3,
            Self::Complete => 4,
        }
    }

    /// Decode a wire tag. Returns `None` for unknown bytes.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Running),
            1 => Some(Self::Committing),
            2 => Some(Self::Aborting),
            3 => Some(Self::RecoveryAborting),
            4 => Some(Self::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "RUNNING",
            Self::Committing => "COMMITTING",
            Self::Aborting => "ABORTING",
            Self::RecoveryAborting => "RECOVERY_ABORTING",
            Self::Complete => "COMPLETE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::TxnStatus;
    use super::TxnStatus::{Aborting, Committing, Complete, RecoveryAborting, Running};

    #[test]
    fn forward_transitions_are_legal() {
        assert_eq!(Running.transition(Committing), Some(Committing));
        assert_eq!(Running.transition(Aborting), Some(Aborting));
        assert_eq!(Running.transition(RecoveryAborting), Some(RecoveryAborting));
        assert_eq!(Committing.transition(Complete), Some(Complete));
        assert_eq!(Aborting.transition(Complete), Some(Complete));
        assert_eq!(RecoveryAborting.transition(Complete), Some(Complete));
    }

    #[test]
    fn backwards_and_sideways_moves_are_rejected() {
        assert_eq!(Committing.transition(Running), None);
        assert_eq!(Aborting.transition(Running), None);
        assert_eq!(Complete.transition(Running), None);
        assert_eq!(Complete.transition(Committing), None);
        assert_eq!(Committing.transition(Aborting), None);
        assert_eq!(RecoveryAborting.transition(Committing), None);
    }

    #[test]
    fn self_transition_is_a_no_op() {
        for status in [Running, Committing, Aborting, RecoveryAborting, Complete] {
            assert_eq!(status.transition(status), Some(status));
        }
    }

    #[test]
    fn wire_tags_round_trip() {
        for status in [Running, Committing, Aborting, RecoveryAborting, Complete] {
            assert_eq!(TxnStatus::from_byte(status.as_byte()), Some(status));
        }
        assert_eq!(TxnStatus::from_byte(200), None);
    }
}
