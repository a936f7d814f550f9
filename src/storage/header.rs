//! Backend header stored in physical slot 0 of persistent page stores.
//!
//! Layout (little-endian):
//! - magic: 4 bytes @ 0
//! - page_size: u32 @ 4
//! - page_count: u64 @ 8
//! - free_count: u64 @ 16
//! - free entries: u64 each @ 24, up to `(page_size - 24) / 8`

use crate::errors::{Result, StorageError};
use crate::storage::PageId;

pub const OFF_MAGIC: usize = 0;
pub const OFF_PAGE_SIZE: usize = 4;
pub const OFF_PAGE_COUNT: usize = 8;
pub const OFF_FREE_COUNT: usize = 16;
pub const OFF_FREE_LIST: usize = 24;
pub const FREE_ENTRY_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreHeader {
    pub magic: [u8; 4],
    pub page_size: u32,
    pub page_count: u64,
    /// Free list, bottom of the stack first.
    pub free_list: Vec<PageId>,
}

impl StoreHeader {
    #[must_use]
    pub const fn new(magic: [u8; 4], page_size: u32) -> Self {
        Self { magic, page_size, page_count: 0, free_list: Vec::new() }
    }

    /// Number of free-list entries that fit inline for a page size.
    #[must_use]
    pub const fn free_capacity(page_size: usize) -> usize {
        page_size.saturating_sub(OFF_FREE_LIST) / FREE_ENTRY_SIZE
    }

    /// Encodes into a full header page. When the free list exceeds the inline capacity the
    /// oldest entries (bottom of the stack) are dropped from the persisted copy.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let page_size = self.page_size as usize;
        let mut buf = vec![0u8; page_size];
        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&self.magic);
        buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&self.page_size.to_le_bytes());
        buf[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 8].copy_from_slice(&self.page_count.to_le_bytes());
        let cap = Self::free_capacity(page_size);
        let skip = self.free_list.len().saturating_sub(cap);
        let kept = &self.free_list[skip..];
        buf[OFF_FREE_COUNT..OFF_FREE_COUNT + 8].copy_from_slice(&(kept.len() as u64).to_le_bytes());
        for (i, id) in kept.iter().enumerate() {
            let off = OFF_FREE_LIST + i * FREE_ENTRY_SIZE;
            buf[off..off + FREE_ENTRY_SIZE].copy_from_slice(&id.to_le_bytes());
        }
        buf
    }

    /// Decodes and validates a header against the expected magic and page size.
    ///
    /// # Errors
    /// Returns `InvalidFormat` on a truncated buffer, bad magic or page-size mismatch.
    pub fn decode(buf: &[u8], magic: [u8; 4], page_size: usize) -> Result<Self> {
        if buf.len() < OFF_FREE_LIST {
            return Err(StorageError::format(format!("truncated header: {} bytes", buf.len())));
        }
        let found = [buf[0], buf[1], buf[2], buf[3]];
        if found != magic {
            return Err(StorageError::format(format!(
                "bad magic {:?}, expected {:?}",
                String::from_utf8_lossy(&found),
                String::from_utf8_lossy(&magic)
            )));
        }
        let stored_size = read_u32(buf, OFF_PAGE_SIZE) as usize;
        if stored_size != page_size {
            return Err(StorageError::format(format!(
                "page size mismatch: file has {stored_size}, configured {page_size}"
            )));
        }
        if buf.len() < page_size {
            return Err(StorageError::format(format!(
                "truncated header: {} of {page_size} bytes",
                buf.len()
            )));
        }
        let page_count = read_u64(buf, OFF_PAGE_COUNT);
        let free_count = read_u64(buf, OFF_FREE_COUNT) as usize;
        if free_count > Self::free_capacity(page_size) {
            return Err(StorageError::format(format!("free count {free_count} exceeds header capacity")));
        }
        let free_list = (0..free_count)
            .map(|i| read_u64(buf, OFF_FREE_LIST + i * FREE_ENTRY_SIZE))
            .collect();
        Ok(Self { magic, page_size: stored_size as u32, page_count, free_list })
    }
}

pub fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(raw)
}

pub fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = *b"TEST";

    #[test]
    fn header_roundtrip() {
        let mut h = StoreHeader::new(MAGIC, 512);
        h.page_count = 17;
        h.free_list = vec![3, 9, 4];
        let bytes = h.encode();
        assert_eq!(bytes.len(), 512);
        let back = StoreHeader::decode(&bytes, MAGIC, 512).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn free_list_truncation_keeps_newest() {
        let cap = StoreHeader::free_capacity(512);
        assert_eq!(cap, (512 - 24) / 8);
        let mut h = StoreHeader::new(MAGIC, 512);
        h.page_count = 1000;
        h.free_list = (0..(cap as u64 + 5)).collect();
        let back = StoreHeader::decode(&h.encode(), MAGIC, 512).unwrap();
        assert_eq!(back.free_list.len(), cap);
        assert_eq!(back.free_list.first().copied(), Some(5));
        assert_eq!(back.free_list.last().copied(), Some(cap as u64 + 4));
    }

    #[test]
    fn rejects_bad_magic_and_size() {
        let h = StoreHeader::new(MAGIC, 512);
        let bytes = h.encode();
        assert!(matches!(StoreHeader::decode(&bytes, *b"NOPE", 512), Err(StorageError::InvalidFormat(_))));
        assert!(matches!(StoreHeader::decode(&bytes, MAGIC, 1024), Err(StorageError::InvalidFormat(_))));
        assert!(matches!(StoreHeader::decode(&bytes[..10], MAGIC, 512), Err(StorageError::InvalidFormat(_))));
    }
}
