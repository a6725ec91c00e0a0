//! The append-only record store interface.

use quarry_error::Result;
use quarry_types::Lsn;

use crate::record::LogRecord;

/// A thin append-only log.
///
/// Appends are serialized internally, so assigned LSNs are strictly
/// monotonic and callers never lock around `append`. Durability is
/// explicit: nothing is stable until `flush_to` covers it.
pub trait LogStore: Send + Sync {
    /// Append a record and return its assigned LSN.
    fn append(&self, record: LogRecord) -> Lsn;

    /// Make the log durable through `lsn`, inclusive.
    fn flush_to(&self, lsn: Lsn);

    /// The LSN through which the log is durable.
    fn flushed_lsn(&self) -> Lsn;

    /// Read the record at exactly `lsn`.
    fn fetch(&self, lsn: Lsn) -> Result<LogRecord>;

    /// Iterate records at `lsn` and beyond, in LSN order.
    fn scan_from(&self, lsn: Lsn) -> Box<dyn Iterator<Item = (Lsn, LogRecord)> + Send>;

    /// Overwrite the master record at LSN 0 in place.
    ///
    /// The caller must have flushed the checkpoint the new master points at;
    /// the rewrite is the atomic "checkpoint installed" event.
    fn rewrite_master(&self, record: LogRecord) -> Result<()>;
}
