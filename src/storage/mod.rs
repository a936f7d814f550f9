//! Page storage: the `PageStore` contract and its backends.
//!
//! Backends know nothing about what lives inside a page. Persistent backends keep a header in
//! physical slot 0 and place data page `id` at byte offset `(id + 1) * page_size`.

pub mod alloc;
pub mod backend;
pub mod file;
pub mod header;
pub mod memory;
pub mod mmap;

use std::ops::Deref;

use async_trait::async_trait;
use parking_lot::MappedRwLockReadGuard;

use crate::errors::{Result, StorageError};

pub use alloc::PageAllocator;
pub use backend::Backend;
pub use file::FilePageStore;
pub use header::StoreHeader;
pub use memory::MemoryPageStore;
pub use mmap::MmapPageStore;

/// Stable page identifier.
pub type PageId = u64;

/// Sentinel for "no page" in on-page pointers.
pub const NO_PAGE: PageId = u64::MAX;

/// Default engine page size.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size accepted by the backends.
pub const MIN_PAGE_SIZE: usize = 512;

/// Bytes at the start of every logged page holding the last writer's LSN.
pub const PAGE_LSN_SIZE: usize = 8;

/// Reads the LSN embedded in the first 8 bytes of a page.
#[must_use]
pub fn page_lsn(page: &[u8]) -> u64 {
    if page.len() < PAGE_LSN_SIZE {
        return 0;
    }
    header::read_u64(page, 0)
}

/// Overwrites the embedded page LSN.
pub fn stamp_page_lsn(page: &mut [u8], lsn: u64) {
    if page.len() >= PAGE_LSN_SIZE {
        page[..PAGE_LSN_SIZE].copy_from_slice(&lsn.to_le_bytes());
    }
}

/// Capacity growth factor shared by every backend (x1.5).
#[must_use]
pub(crate) const fn grown_capacity(current: u64, required: u64) -> u64 {
    let mut cap = if current < 4 { 4 } else { current };
    while cap < required {
        cap += cap / 2;
    }
    cap
}

pub(crate) fn check_page_size(page_size: usize) -> Result<()> {
    if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
        return Err(StorageError::Config(format!(
            "page size {page_size} must be a power of two >= {MIN_PAGE_SIZE}"
        )));
    }
    Ok(())
}

pub(crate) fn check_len(expected: usize, data: &[u8]) -> Result<()> {
    if data.len() != expected {
        return Err(StorageError::PageSizeMismatch { expected, actual: data.len() });
    }
    Ok(())
}

/// Makes `id` live in `store`, allocating through the free list and bump pointer until the
/// store hands it out. Pages allocated on the way are freed again.
///
/// # Errors
/// Store errors from allocation or freeing.
pub async fn materialize(store: &dyn PageStore, id: PageId) -> Result<()> {
    match store.read_page(id).await {
        Ok(_) => return Ok(()),
        Err(e) if e.is_page_not_found() => {}
        Err(e) => return Err(e),
    }
    let mut detour = Vec::new();
    loop {
        let got = store.allocate_page().await?;
        if got == id {
            break;
        }
        detour.push(got);
    }
    for page in detour.into_iter().rev() {
        store.free_page(page).await?;
    }
    Ok(())
}

/// Writes `image`, materializing the page first when the store does not have it.
///
/// # Errors
/// Store errors.
pub async fn write_materialized(store: &dyn PageStore, id: PageId, image: &[u8]) -> Result<()> {
    match store.write_page(id, image).await {
        Err(e) if e.is_page_not_found() => {
            materialize(store, id).await?;
            store.write_page(id, image).await
        }
        other => other,
    }
}

/// Fixed-size page storage.
///
/// `allocate_page` does not initialize the page: a never-written page reads as zeros and a
/// reused page returns whatever it held when freed. Callers write before they read.
#[async_trait]
pub trait PageStore: Send + Sync {
    fn page_size(&self) -> usize;

    /// Number of page IDs issued so far (live + free).
    fn page_count(&self) -> u64;

    /// # Errors
    /// `PageNotFound` when `id` was never allocated or is free.
    async fn read_page(&self, id: PageId) -> Result<Vec<u8>>;

    /// # Errors
    /// `PageSizeMismatch` for a wrong-length payload, `PageNotFound` for a page that is not live.
    async fn write_page(&self, id: PageId, data: &[u8]) -> Result<()>;

    /// # Errors
    /// Returns an error if the backing medium cannot grow.
    async fn allocate_page(&self) -> Result<PageId>;

    /// # Errors
    /// `PageNotFound` when the page is not live.
    async fn free_page(&self, id: PageId) -> Result<()>;

    /// Persists header, free list and page data.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    async fn flush(&self) -> Result<()>;

    /// Optional zero-copy access.
    fn zero_copy(&self) -> Option<&dyn ZeroCopyPages> {
        None
    }
}

/// Direct read access into a backend's memory, valid for as long as the borrow of the store.
pub trait ZeroCopyPages: Send + Sync {
    /// # Errors
    /// `PageNotFound` when the page is not live.
    fn page_ref(&self, id: PageId) -> Result<PageRef<'_>>;
}

/// Borrowed page bytes. Holding one keeps the backend from remapping; the guard is not `Send`,
/// so it cannot live across an `.await` inside a spawned task.
pub struct PageRef<'a> {
    guard: MappedRwLockReadGuard<'a, [u8]>,
}

impl<'a> PageRef<'a> {
    pub(crate) const fn new(guard: MappedRwLockReadGuard<'a, [u8]>) -> Self {
        Self { guard }
    }

    #[must_use]
    pub fn lsn(&self) -> u64 {
        page_lsn(&self.guard)
    }
}

impl Deref for PageRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_is_geometric() {
        assert_eq!(grown_capacity(0, 1), 4);
        assert_eq!(grown_capacity(4, 5), 6);
        assert_eq!(grown_capacity(100, 101), 150);
        assert!(grown_capacity(100, 1000) >= 1000);
    }

    #[test]
    fn lsn_stamp_roundtrip() {
        let mut page = vec![0u8; 64];
        stamp_page_lsn(&mut page, 0xABCD);
        assert_eq!(page_lsn(&page), 0xABCD);
        assert_eq!(page_lsn(&[1, 2]), 0);
    }

    #[tokio::test]
    async fn materialize_walks_free_list_and_bump() {
        let store = MemoryPageStore::new(512).unwrap();
        for _ in 0..4 {
            store.allocate_page().await.unwrap();
        }
        store.free_page(1).await.unwrap();
        store.free_page(2).await.unwrap();
        materialize(&store, 1).await.unwrap();
        assert!(store.read_page(1).await.is_ok());
        assert!(store.read_page(2).await.is_err());

        write_materialized(&store, 6, &[3u8; 512]).await.unwrap();
        assert_eq!(store.read_page(6).await.unwrap(), vec![3u8; 512]);
        assert_eq!(store.page_count(), 7);
        assert_eq!(store.free_count(), 3);
    }

    #[test]
    fn page_size_validation() {
        assert!(check_page_size(4096).is_ok());
        assert!(check_page_size(256).is_err());
        assert!(check_page_size(5000).is_err());
    }
}
