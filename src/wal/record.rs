//! WAL record format.
//!
//! ```text
//! 0..4    crc32 of bytes 4..total_len
//! 4..8    total_len (u32)
//! 8..16   lsn
//! 16..24  txn_id
//! 24..32  page_id
//! 32..40  ref_lsn
//! 40..44  page_offset (u32)
//! 44..48  image_len (u32)
//! 48      record type
//! 49..52  reserved
//! 52..    before-image, after-image (image_len bytes each)
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;

use crate::errors::{Result, StorageError};
use crate::storage::header::{read_u32, read_u64};
use crate::storage::{PageId, NO_PAGE};

/// Log sequence number. 0 is null, the first record gets 1.
pub type Lsn = u64;

/// Transaction identifier, always positive for real transactions.
pub type TxnId = u64;

pub const NULL_LSN: Lsn = 0;

pub const OFF_CRC: usize = 0;
pub const OFF_TOTAL_LEN: usize = 4;
pub const OFF_LSN: usize = 8;
pub const OFF_TXN_ID: usize = 16;
pub const OFF_PAGE_ID: usize = 24;
pub const OFF_REF_LSN: usize = 32;
pub const OFF_PAGE_OFFSET: usize = 40;
pub const OFF_IMAGE_LEN: usize = 44;
pub const OFF_RECORD_TYPE: usize = 48;
pub const RECORD_HEADER_SIZE: usize = 52;

/// Upper bound on a single record; anything larger is treated as a torn length field.
pub const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum RecordType {
    Begin = 1,
    Write = 2,
    Allocate = 3,
    Free = 4,
    Commit = 5,
    Abort = 6,
    Checkpoint = 7,
    Compensation = 8,
}

impl TryFrom<u8> for RecordType {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Begin),
            2 => Ok(Self::Write),
            3 => Ok(Self::Allocate),
            4 => Ok(Self::Free),
            5 => Ok(Self::Commit),
            6 => Ok(Self::Abort),
            7 => Ok(Self::Checkpoint),
            8 => Ok(Self::Compensation),
            other => Err(StorageError::format(format!("unknown WAL record type {other}"))),
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One immutable log entry.
///
/// `ref_lsn` is the safe LSN on Checkpoint records and the undone Write's LSN on CLRs.
/// Checkpoint records carry the next transaction ID in `page_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub record_type: RecordType,
    pub page_id: PageId,
    pub page_offset: u32,
    pub ref_lsn: Lsn,
    pub before: Bytes,
    pub after: Bytes,
}

impl WalRecord {
    fn control(lsn: Lsn, txn_id: TxnId, record_type: RecordType) -> Self {
        Self {
            lsn,
            txn_id,
            record_type,
            page_id: NO_PAGE,
            page_offset: 0,
            ref_lsn: NULL_LSN,
            before: Bytes::new(),
            after: Bytes::new(),
        }
    }

    #[must_use]
    pub fn begin(lsn: Lsn, txn_id: TxnId) -> Self {
        Self::control(lsn, txn_id, RecordType::Begin)
    }

    #[must_use]
    pub fn commit(lsn: Lsn, txn_id: TxnId) -> Self {
        Self::control(lsn, txn_id, RecordType::Commit)
    }

    #[must_use]
    pub fn abort(lsn: Lsn, txn_id: TxnId) -> Self {
        Self::control(lsn, txn_id, RecordType::Abort)
    }

    #[must_use]
    pub fn allocate(lsn: Lsn, txn_id: TxnId, page_id: PageId) -> Self {
        Self { page_id, ..Self::control(lsn, txn_id, RecordType::Allocate) }
    }

    #[must_use]
    pub fn free(lsn: Lsn, txn_id: TxnId, page_id: PageId) -> Self {
        Self { page_id, ..Self::control(lsn, txn_id, RecordType::Free) }
    }

    #[must_use]
    pub fn checkpoint(lsn: Lsn, safe_lsn: Lsn, next_txn_id: TxnId) -> Self {
        Self { page_id: next_txn_id, ref_lsn: safe_lsn, ..Self::control(lsn, 0, RecordType::Checkpoint) }
    }

    /// Whole-page write. Both images must be the same length.
    #[must_use]
    pub fn write(lsn: Lsn, txn_id: TxnId, page_id: PageId, before: Bytes, after: Bytes) -> Self {
        Self { page_id, before, after, ..Self::control(lsn, txn_id, RecordType::Write) }
    }

    /// Compensation for the Write at `undone_lsn`; `after` is the restored image.
    #[must_use]
    pub fn compensation(
        lsn: Lsn,
        txn_id: TxnId,
        page_id: PageId,
        undone_lsn: Lsn,
        before: Bytes,
        after: Bytes,
    ) -> Self {
        Self { page_id, ref_lsn: undone_lsn, before, after, ..Self::control(lsn, txn_id, RecordType::Compensation) }
    }

    /// Write and CLR records carry page images that redo can apply.
    #[must_use]
    pub const fn is_page_image(&self) -> bool {
        matches!(self.record_type, RecordType::Write | RecordType::Compensation)
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        RECORD_HEADER_SIZE + self.before.len() + self.after.len()
    }

    /// # Errors
    /// `ProtocolViolation` when the two images differ in length or the record is too large.
    pub fn encode(&self) -> Result<Bytes> {
        if self.before.len() != self.after.len() {
            return Err(StorageError::protocol(format!(
                "record {}: before-image {} bytes, after-image {} bytes",
                self.lsn,
                self.before.len(),
                self.after.len()
            )));
        }
        let total = self.encoded_len();
        if total > MAX_RECORD_SIZE {
            return Err(StorageError::protocol(format!("record {} is {total} bytes", self.lsn)));
        }
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32_le(0);
        buf.put_u32_le(total as u32);
        buf.put_u64_le(self.lsn);
        buf.put_u64_le(self.txn_id);
        buf.put_u64_le(self.page_id);
        buf.put_u64_le(self.ref_lsn);
        buf.put_u32_le(self.page_offset);
        buf.put_u32_le(self.before.len() as u32);
        buf.put_u8(self.record_type as u8);
        buf.put_bytes(0, 3);
        buf.put_slice(&self.before);
        buf.put_slice(&self.after);
        let crc = crc32fast::hash(&buf[OFF_TOTAL_LEN..]);
        buf[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(buf.freeze())
    }

    /// Decodes the record at the start of `buf`.
    ///
    /// `Ok(None)` marks a torn tail: a short buffer, an impossible length or a CRC mismatch.
    ///
    /// # Errors
    /// `InvalidFormat` when a checksummed record names an unknown type.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        let total = read_u32(buf, OFF_TOTAL_LEN) as usize;
        if total < RECORD_HEADER_SIZE || total > MAX_RECORD_SIZE || total > buf.len() {
            return Ok(None);
        }
        let image_len = read_u32(buf, OFF_IMAGE_LEN) as usize;
        if RECORD_HEADER_SIZE + 2 * image_len != total {
            return Ok(None);
        }
        if crc32fast::hash(&buf[OFF_TOTAL_LEN..total]) != read_u32(buf, OFF_CRC) {
            return Ok(None);
        }
        let record_type = RecordType::try_from(buf[OFF_RECORD_TYPE])?;
        let before_at = RECORD_HEADER_SIZE;
        let after_at = before_at + image_len;
        Ok(Some(Self {
            lsn: read_u64(buf, OFF_LSN),
            txn_id: read_u64(buf, OFF_TXN_ID),
            record_type,
            page_id: read_u64(buf, OFF_PAGE_ID),
            page_offset: read_u32(buf, OFF_PAGE_OFFSET),
            ref_lsn: read_u64(buf, OFF_REF_LSN),
            before: Bytes::copy_from_slice(&buf[before_at..after_at]),
            after: Bytes::copy_from_slice(&buf[after_at..total]),
        }))
    }
}
