//! Foundation types shared across the Quarry storage engine core.
//!
//! Identifier newtypes live here so that every crate agrees on what an LSN,
//! a transaction number, or a page number is without depending on the crates
//! that give them behavior.

pub mod limits;
pub mod status;

pub use status::TxnStatus;

use std::fmt;

/// A log sequence number.
///
/// LSNs are assigned by the log store on append and are strictly monotonic,
/// though not contiguous (an LSN is the byte offset of the record in the log
/// stream). LSN 0 is reserved for the master record; a `prev_lsn` of
/// [`Lsn::ZERO`] marks the first record of a transaction's chain.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// The master record's home. Also the "no previous record" sentinel in
    /// `prev_lsn` chains.
    pub const ZERO: Self = Self(0);

    /// Create an LSN from a raw offset.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Whether this is the reserved master-record LSN.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A transaction number.
///
/// Assigned by the session layer; unique for the lifetime of the database.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// Create a transaction number from a raw u64.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A partition number.
///
/// Partition 0 is reserved for the log; data lives in partitions 1 and up.
pub type PartId = u32;

/// The partition holding log pages. Operations against it are never logged.
pub const LOG_PARTITION: PartId = 0;

/// A page number.
///
/// Encodes the owning partition in the high 32 bits and the page index
/// within the partition in the low 32 bits, so partition arithmetic is a
/// shift rather than a table lookup.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct PageId(u64);

impl PageId {
    /// Build a page number from a partition and an index within it.
    #[inline]
    #[must_use]
    pub const fn new(part: PartId, index: u32) -> Self {
        Self(((part as u64) << 32) | index as u64)
    }

    /// Reconstruct a page number from its raw u64 form.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The partition this page belongs to.
    #[inline]
    #[must_use]
    pub const fn partition(self) -> PartId {
        (self.0 >> 32) as PartId
    }

    /// The page's index within its partition.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Whether this page lives in the log partition.
    #[inline]
    #[must_use]
    pub const fn is_log_page(self) -> bool {
        self.partition() == LOG_PARTITION
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.partition(), self.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_ordering_tracks_raw_value() {
        assert!(Lsn::new(10) < Lsn::new(11));
        assert!(Lsn::ZERO.is_zero());
        assert!(!Lsn::new(1).is_zero());
    }

    #[test]
    fn page_id_round_trips_partition_and_index() {
        let page = PageId::new(3, 7);
        assert_eq!(page.partition(), 3);
        assert_eq!(page.index(), 7);
        assert_eq!(PageId::from_raw(page.raw()), page);
    }

    #[test]
    fn log_partition_pages_are_flagged() {
        assert!(PageId::new(LOG_PARTITION, 5).is_log_page());
        assert!(!PageId::new(1, 5).is_log_page());
    }

    #[test]
    fn display_forms() {
        assert_eq!(PageId::new(2, 9).to_string(), "2.9");
        assert_eq!(Lsn::new(40).to_string(), "40");
        assert_eq!(TxnId::new(4).to_string(), "4");
    }
}
