use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{check_len, check_page_size, grown_capacity, PageAllocator, PageId, PageStore};
use crate::errors::Result;

/// Volatile page store for tests and scratch indexes.
pub struct MemoryPageStore {
    page_size: usize,
    inner: Mutex<MemoryInner>,
}

struct MemoryInner {
    pages: HashMap<PageId, Box<[u8]>>,
    alloc: PageAllocator,
}

impl MemoryPageStore {
    /// # Errors
    /// `Config` when the page size is not a power of two of at least 512 bytes.
    pub fn new(page_size: usize) -> Result<Self> {
        check_page_size(page_size)?;
        Ok(Self {
            page_size,
            inner: Mutex::new(MemoryInner { pages: HashMap::new(), alloc: PageAllocator::new() }),
        })
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.inner.lock().alloc.free_count()
    }
}

impl std::fmt::Debug for MemoryPageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPageStore")
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count())
            .finish()
    }
}

#[async_trait]
impl PageStore for MemoryPageStore {
    fn page_size(&self) -> usize { self.page_size }

    fn page_count(&self) -> u64 { self.inner.lock().alloc.page_count() }

    async fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        inner.alloc.check_live(id)?;
        Ok(inner.pages.get(&id).map_or_else(|| vec![0u8; self.page_size], |p| p.to_vec()))
    }

    async fn write_page(&self, id: PageId, data: &[u8]) -> Result<()> {
        check_len(self.page_size, data)?;
        let mut inner = self.inner.lock();
        inner.alloc.check_live(id)?;
        inner.pages.insert(id, data.into());
        Ok(())
    }

    async fn allocate_page(&self) -> Result<PageId> {
        let mut inner = self.inner.lock();
        let id = inner.alloc.alloc();
        let cap = inner.pages.capacity() as u64;
        if inner.alloc.page_count() > cap {
            let target = grown_capacity(cap, inner.alloc.page_count());
            let additional = (target - inner.pages.len() as u64) as usize;
            inner.pages.reserve(additional);
        }
        Ok(id)
    }

    async fn free_page(&self, id: PageId) -> Result<()> {
        self.inner.lock().alloc.free(id)
    }

    async fn flush(&self) -> Result<()> { Ok(()) }
}
