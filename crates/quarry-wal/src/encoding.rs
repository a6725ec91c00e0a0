//! Fixed little-endian wire layouts for log records.
//!
//! Each variant's layout is a tag byte followed by its fields in
//! declaration order; byte arrays are length-prefixed (u16), and the update
//! records encode one length for both images since they are equal by
//! contract.

use std::collections::BTreeMap;

use quarry_error::{QuarryError, Result};
use quarry_types::{Lsn, PageId, TxnId, TxnStatus};

use crate::record::LogRecord;

const TAG_MASTER: u8 = 1;
const TAG_UPDATE_PAGE: u8 = 2;
const TAG_UNDO_UPDATE_PAGE: u8 = 3;
const TAG_ALLOC_PART: u8 = 4;
const TAG_UNDO_ALLOC_PART: u8 = 5;
const TAG_FREE_PART: u8 = 6;
const TAG_UNDO_FREE_PART: u8 = 7;
const TAG_ALLOC_PAGE: u8 = 8;
const TAG_UNDO_ALLOC_PAGE: u8 = 9;
const TAG_FREE_PAGE: u8 = 10;
const TAG_UNDO_FREE_PAGE: u8 = 11;
const TAG_COMMIT: u8 = 12;
const TAG_ABORT: u8 = 13;
const TAG_END: u8 = 14;
const TAG_BEGIN_CHECKPOINT: u8 = 15;
const TAG_END_CHECKPOINT: u8 = 16;

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(tag: u8) -> Self {
        Self { buf: vec![tag] }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len());
        let end = end.ok_or_else(|| QuarryError::corrupt("truncated log record"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().expect("2 bytes")))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn lsn(&mut self) -> Result<Lsn> {
        Ok(Lsn::new(self.u64()?))
    }

    fn txn(&mut self) -> Result<TxnId> {
        Ok(TxnId::new(self.u64()?))
    }

    fn page(&mut self) -> Result<PageId> {
        Ok(PageId::from_raw(self.u64()?))
    }
}

/// Serialize a record to its wire form.
#[must_use]
pub fn encode(record: &LogRecord) -> Vec<u8> {
    match record {
        LogRecord::Master { last_checkpoint_lsn } => {
            let mut w = Writer::new(TAG_MASTER);
            w.u64(last_checkpoint_lsn.get());
            w.buf
        }
        LogRecord::UpdatePage {
            txn,
            page,
            prev_lsn,
            offset,
            before,
            after,
        } => {
            let mut w = Writer::new(TAG_UPDATE_PAGE);
            w.u64(txn.get());
            w.u64(page.raw());
            w.u64(prev_lsn.get());
            w.u16(*offset);
            w.u16(u16::try_from(before.len()).expect("update image fits u16"));
            w.bytes(before);
            w.bytes(after);
            w.buf
        }
        LogRecord::UndoUpdatePage {
            txn,
            page,
            prev_lsn,
            undo_next_lsn,
            offset,
            after,
        } => {
            let mut w = Writer::new(TAG_UNDO_UPDATE_PAGE);
            w.u64(txn.get());
            w.u64(page.raw());
            w.u64(prev_lsn.get());
            w.u64(undo_next_lsn.get());
            w.u16(*offset);
            w.u16(u16::try_from(after.len()).expect("update image fits u16"));
            w.bytes(after);
            w.buf
        }
        LogRecord::AllocPart { txn, part, prev_lsn } => part_record(TAG_ALLOC_PART, *txn, *part, *prev_lsn, None),
        LogRecord::UndoAllocPart {
            txn,
            part,
            prev_lsn,
            undo_next_lsn,
        } => part_record(TAG_UNDO_ALLOC_PART, *txn, *part, *prev_lsn, Some(*undo_next_lsn)),
        LogRecord::FreePart { txn, part, prev_lsn } => part_record(TAG_FREE_PART, *txn, *part, *prev_lsn, None),
        LogRecord::UndoFreePart {
            txn,
            part,
            prev_lsn,
            undo_next_lsn,
        } => part_record(TAG_UNDO_FREE_PART, *txn, *part, *prev_lsn, Some(*undo_next_lsn)),
        LogRecord::AllocPage { txn, page, prev_lsn } => page_record(TAG_ALLOC_PAGE, *txn, *page, *prev_lsn, None),
        LogRecord::UndoAllocPage {
            txn,
            page,
            prev_lsn,
            undo_next_lsn,
        } => page_record(TAG_UNDO_ALLOC_PAGE, *txn, *page, *prev_lsn, Some(*undo_next_lsn)),
        LogRecord::FreePage { txn, page, prev_lsn } => page_record(TAG_FREE_PAGE, *txn, *page, *prev_lsn, None),
        LogRecord::UndoFreePage {
            txn,
            page,
            prev_lsn,
            undo_next_lsn,
        } => page_record(TAG_UNDO_FREE_PAGE, *txn, *page, *prev_lsn, Some(*undo_next_lsn)),
        LogRecord::Commit { txn, prev_lsn } => status_record(TAG_COMMIT, *txn, *prev_lsn),
        LogRecord::Abort { txn, prev_lsn } => status_record(TAG_ABORT, *txn, *prev_lsn),
        LogRecord::End { txn, prev_lsn } => status_record(TAG_END, *txn, *prev_lsn),
        LogRecord::BeginCheckpoint => vec![TAG_BEGIN_CHECKPOINT],
        LogRecord::EndCheckpoint {
            dirty_pages,
            txn_table,
        } => {
            let mut w = Writer::new(TAG_END_CHECKPOINT);
            w.u16(u16::try_from(dirty_pages.len()).expect("checkpoint chunk fits u16"));
            w.u16(u16::try_from(txn_table.len()).expect("checkpoint chunk fits u16"));
            for (page, rec_lsn) in dirty_pages {
                w.u64(page.raw());
                w.u64(rec_lsn.get());
            }
            for (txn, (status, last_lsn)) in txn_table {
                w.u64(txn.get());
                w.u8(status.as_byte());
                w.u64(last_lsn.get());
            }
            w.buf
        }
    }
}

fn part_record(tag: u8, txn: TxnId, part: u32, prev_lsn: Lsn, undo_next: Option<Lsn>) -> Vec<u8> {
    let mut w = Writer::new(tag);
    w.u64(txn.get());
    w.u32(part);
    w.u64(prev_lsn.get());
    if let Some(lsn) = undo_next {
        w.u64(lsn.get());
    }
    w.buf
}

fn page_record(tag: u8, txn: TxnId, page: PageId, prev_lsn: Lsn, undo_next: Option<Lsn>) -> Vec<u8> {
    let mut w = Writer::new(tag);
    w.u64(txn.get());
    w.u64(page.raw());
    w.u64(prev_lsn.get());
    if let Some(lsn) = undo_next {
        w.u64(lsn.get());
    }
    w.buf
}

fn status_record(tag: u8, txn: TxnId, prev_lsn: Lsn) -> Vec<u8> {
    let mut w = Writer::new(tag);
    w.u64(txn.get());
    w.u64(prev_lsn.get());
    w.buf
}

/// Deserialize one record from the start of `buf`, returning it with the
/// number of bytes consumed. Unknown tags are a fatal parse error.
pub fn decode(buf: &[u8]) -> Result<(LogRecord, usize)> {
    let mut r = Reader::new(buf);
    let tag = r.u8()?;
    let record = match tag {
        TAG_MASTER => LogRecord::Master {
            last_checkpoint_lsn: r.lsn()?,
        },
        TAG_UPDATE_PAGE => {
            let txn = r.txn()?;
            let page = r.page()?;
            let prev_lsn = r.lsn()?;
            let offset = r.u16()?;
            let len = usize::from(r.u16()?);
            let before = r.take(len)?.to_vec();
            let after = r.take(len)?.to_vec();
            LogRecord::UpdatePage {
                txn,
                page,
                prev_lsn,
                offset,
                before,
                after,
            }
        }
        TAG_UNDO_UPDATE_PAGE => {
            let txn = r.txn()?;
            let page = r.page()?;
            let prev_lsn = r.lsn()?;
            let undo_next_lsn = r.lsn()?;
            let offset = r.u16()?;
            let len = usize::from(r.u16()?);
            let after = r.take(len)?.to_vec();
            LogRecord::UndoUpdatePage {
                txn,
                page,
                prev_lsn,
                undo_next_lsn,
                offset,
                after,
            }
        }
        TAG_ALLOC_PART => LogRecord::AllocPart {
            txn: r.txn()?,
            part: r.u32()?,
            prev_lsn: r.lsn()?,
        },
        TAG_UNDO_ALLOC_PART => LogRecord::UndoAllocPart {
            txn: r.txn()?,
            part: r.u32()?,
            prev_lsn: r.lsn()?,
            undo_next_lsn: r.lsn()?,
        },
        TAG_FREE_PART => LogRecord::FreePart {
            txn: r.txn()?,
            part: r.u32()?,
            prev_lsn: r.lsn()?,
        },
        TAG_UNDO_FREE_PART => LogRecord::UndoFreePart {
            txn: r.txn()?,
            part: r.u32()?,
            prev_lsn: r.lsn()?,
            undo_next_lsn: r.lsn()?,
        },
        TAG_ALLOC_PAGE => LogRecord::AllocPage {
            txn: r.txn()?,
            page: r.page()?,
            prev_lsn: r.lsn()?,
        },
        TAG_UNDO_ALLOC_PAGE => LogRecord::UndoAllocPage {
            txn: r.txn()?,
            page: r.page()?,
            prev_lsn: r.lsn()?,
            undo_next_lsn: r.lsn()?,
        },
        TAG_FREE_PAGE => LogRecord::FreePage {
            txn: r.txn()?,
            page: r.page()?,
            prev_lsn: r.lsn()?,
        },
        TAG_UNDO_FREE_PAGE => LogRecord::UndoFreePage {
            txn: r.txn()?,
            page: r.page()?,
            prev_lsn: r.lsn()?,
            undo_next_lsn: r.lsn()?,
        },
        TAG_COMMIT => LogRecord::Commit {
            txn: r.txn()?,
            prev_lsn: r.lsn()?,
        },
        TAG_ABORT => LogRecord::Abort {
            txn: r.txn()?,
            prev_lsn: r.lsn()?,
        },
        TAG_END => LogRecord::End {
            txn: r.txn()?,
            prev_lsn: r.lsn()?,
        },
        TAG_BEGIN_CHECKPOINT => LogRecord::BeginCheckpoint,
        TAG_END_CHECKPOINT => {
            let dpt_count = usize::from(r.u16()?);
            let txn_count = usize::from(r.u16()?);
            let mut dirty_pages = BTreeMap::new();
            for _ in 0..dpt_count {
                let page = r.page()?;
                let rec_lsn = r.lsn()?;
                dirty_pages.insert(page, rec_lsn);
            }
            let mut txn_table = BTreeMap::new();
            for _ in 0..txn_count {
                let txn = r.txn()?;
                let status_byte = r.u8()?;
                let status = TxnStatus::from_byte(status_byte).ok_or_else(|| {
                    QuarryError::corrupt(format!("unknown status byte {status_byte} in checkpoint"))
                })?;
                let last_lsn = r.lsn()?;
                txn_table.insert(txn, (status, last_lsn));
            }
            LogRecord::EndCheckpoint {
                dirty_pages,
                txn_table,
            }
        }
        other => {
            return Err(QuarryError::corrupt(format!("unknown log record tag {other}")));
        }
    };
    Ok((record, r.pos))
}
