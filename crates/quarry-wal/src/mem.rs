//! In-memory log store.
//!
//! Records live in one contiguous byte stream; a record's LSN is its byte
//! offset, so LSNs are monotonic but not contiguous, exactly like the
//! page-based layout this models. Every append goes through the wire
//! encoding, so any test that touches the log also exercises round-trips.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use quarry_error::{QuarryError, Result};
use quarry_types::Lsn;
use tracing::debug;

use crate::encoding::{decode, encode};
use crate::record::LogRecord;
use crate::store::LogStore;

#[derive(Default)]
struct LogState {
    buf: Vec<u8>,
    /// Record start offset -> encoded length.
    index: BTreeMap<u64, usize>,
    /// Offset of the last record made durable.
    flushed: u64,
}

/// An in-memory [`LogStore`] with crash simulation.
#[derive(Default)]
pub struct MemLogStore {
    state: RwLock<LogState>,
}

impl MemLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard every record past the flush horizon, as a crash would.
    ///
    /// The master record always survives: it is rewritten in place and only
    /// after its checkpoint is durable.
    pub fn crash(&self) {
        let mut state = self.state.write();
        let flushed = state.flushed;
        let keep_end = state
            .index
            .get(&flushed)
            .map_or(0, |len| flushed + u64::try_from(*len).expect("record length fits u64"));
        state.index.retain(|offset, _| *offset <= flushed);
        state.buf.truncate(usize::try_from(keep_end).expect("log offset fits usize"));
        debug!(keep_end, "log truncated to flush horizon");
    }

    /// Number of records currently in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().index.len()
    }

    /// Whether the log holds no records at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().index.is_empty()
    }
}

impl LogStore for MemLogStore {
    fn append(&self, record: LogRecord) -> Lsn {
        let bytes = encode(&record);
        let mut state = self.state.write();
        let offset = u64::try_from(state.buf.len()).expect("log offset fits u64");
        state.index.insert(offset, bytes.len());
        state.buf.extend_from_slice(&bytes);
        Lsn::new(offset)
    }

    fn flush_to(&self, lsn: Lsn) {
        let mut state = self.state.write();
        // Flushing covers whole records: land on the record containing
        // `lsn` even if the caller passed an interior offset.
        if let Some((offset, _)) = state.index.range(..=lsn.get()).next_back() {
            state.flushed = state.flushed.max(*offset);
        }
    }

    fn flushed_lsn(&self) -> Lsn {
        Lsn::new(self.state.read().flushed)
    }

    fn fetch(&self, lsn: Lsn) -> Result<LogRecord> {
        let state = self.state.read();
        let len = *state
            .index
            .get(&lsn.get())
            .ok_or(QuarryError::UnknownLsn { lsn })?;
        let start = usize::try_from(lsn.get()).expect("log offset fits usize");
        let (record, consumed) = decode(&state.buf[start..start + len])?;
        debug_assert_eq!(consumed, len);
        Ok(record)
    }

    fn scan_from(&self, lsn: Lsn) -> Box<dyn Iterator<Item = (Lsn, LogRecord)> + Send> {
        let state = self.state.read();
        let records: Vec<(Lsn, LogRecord)> = state
            .index
            .range(lsn.get()..)
            .map(|(offset, len)| {
                let start = usize::try_from(*offset).expect("log offset fits usize");
                let (record, _) = decode(&state.buf[start..start + len])
                    .expect("in-memory log holds only records it encoded");
                (Lsn::new(*offset), record)
            })
            .collect();
        Box::new(records.into_iter())
    }

    fn rewrite_master(&self, record: LogRecord) -> Result<()> {
        let LogRecord::Master { .. } = &record else {
            return Err(QuarryError::corrupt("rewrite_master with a non-master record"));
        };
        let bytes = encode(&record);
        let mut state = self.state.write();
        let len = *state
            .index
            .get(&0)
            .ok_or_else(|| QuarryError::corrupt("log has no master record to rewrite"))?;
        if len != bytes.len() {
            return Err(QuarryError::corrupt("master record size changed on rewrite"));
        }
        state.buf[..len].copy_from_slice(&bytes);
        Ok(())
    }
}
