//! The lock mode lattice.

use std::fmt;

/// A lock mode.
///
/// `NL` is the absence of a lock; it is a valid table input but never a
/// valid request. The intent modes (`IS`, `IX`, `SIX`) exist only to make
/// coarse-granularity locks coexist with fine-granularity ones below them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKind {
    /// No lock.
    NL,
    /// Intention shared.
    IS,
    /// Intention exclusive.
    IX,
    /// Shared.
    S,
    /// Shared + intention exclusive.
    SIX,
    /// Exclusive.
    X,
}

/// Row/column order of the three tables below.
const ORDER: [LockKind; 6] = [
    LockKind::NL,
    LockKind::IS,
    LockKind::IX,
    LockKind::S,
    LockKind::SIX,
    LockKind::X,
];

/// `COMPATIBLE[a][b]`: may `a` and `b` coexist on one resource, held by
/// different transactions?
const COMPATIBLE: [[bool; 6]; 6] = [
    [true, true, true, true, true, true],
    [true, true, true, true, true, false],
    [true, true, true, false, false, false],
    [true, true, false, true, false, false],
    [true, true, false, false, false, false],
    [true, false, false, false, false, false],
];

/// `CAN_BE_PARENT[p][c]`: may a transaction holding `p` on a node hold `c`
/// on a descendant?
const CAN_BE_PARENT: [[bool; 6]; 6] = [
    [true, false, false, false, false, false],
    [true, true, false, true, false, false],
    [true, true, true, true, true, true],
    [true, false, false, false, false, false],
    [true, false, true, false, false, true],
    [true, false, false, false, false, false],
];

/// `SUBSTITUTABLE[sub][req]`: is holding `sub` sufficient wherever `req` is
/// required?
const SUBSTITUTABLE: [[bool; 6]; 6] = [
    [true, false, false, false, false, false],
    [true, true, false, false, false, false],
    [true, true, true, false, false, false],
    [true, true, false, true, false, false],
    [true, true, true, true, true, false],
    [true, true, true, true, true, true],
];

impl LockKind {
    const fn index(self) -> usize {
        match self {
            Self::NL => 0,
            Self::IS => 1,
            Self::IX => 2,
            Self::S => 3,
            Self::SIX => 4,
            Self::X => 5,
        }
    }

    /// All six modes, in table order.
    #[must_use]
    pub const fn all() -> [Self; 6] {
        ORDER
    }

    /// Whether `self` and `other` may coexist on the same resource when
    /// held by different transactions.
    #[must_use]
    pub const fn compatible(self, other: Self) -> bool {
        COMPATIBLE[self.index()][other.index()]
    }

    /// Whether a transaction holding `self` at a node may hold `child` at a
    /// descendant.
    #[must_use]
    pub const fn can_be_parent(self, child: Self) -> bool {
        CAN_BE_PARENT[self.index()][child.index()]
    }

    /// Whether holding `self` is sufficient wherever `required` is needed.
    #[must_use]
    pub const fn substitutable(self, required: Self) -> bool {
        SUBSTITUTABLE[self.index()][required.index()]
    }

    /// The minimum mode an ancestor must hold for `self` to be granted
    /// below it.
    #[must_use]
    pub const fn parent_intent(self) -> Self {
        match self {
            Self::NL => Self::NL,
            Self::IS | Self::S => Self::IS,
            Self::IX | Self::SIX | Self::X => Self::IX,
        }
    }

    /// Whether this is one of the intent modes.
    #[must_use]
    pub const fn is_intent(self) -> bool {
        matches!(self, Self::IS | Self::IX | Self::SIX)
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NL => "NL",
            Self::IS => "IS",
            Self::IX => "IX",
            Self::S => "S",
            Self::SIX => "SIX",
            Self::X => "X",
        };
        f.write_str(name)
    }
}
