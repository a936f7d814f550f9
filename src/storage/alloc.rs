use std::collections::HashSet;

use super::header::StoreHeader;
use super::PageId;
use crate::errors::{Result, StorageError};

/// Page allocator: LIFO free list first, then bump.
#[derive(Debug, Default, Clone)]
pub struct PageAllocator {
    free_stack: Vec<PageId>,
    free_set: HashSet<PageId>,
    next_page: u64,
}

impl PageAllocator {
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Construct allocator from persisted header fields.
    #[must_use]
    pub fn from_header(h: &StoreHeader) -> Self {
        let free_set = h.free_list.iter().copied().filter(|&p| p < h.page_count).collect::<HashSet<_>>();
        let free_stack = h.free_list.iter().copied().filter(|p| free_set.contains(p)).collect();
        Self { free_stack, free_set, next_page: h.page_count }
    }

    /// Export allocator state into the header for durability.
    pub fn export_to_header(&self, h: &mut StoreHeader) {
        h.page_count = self.next_page;
        h.free_list = self.free_stack.clone();
    }

    #[must_use]
    pub const fn page_count(&self) -> u64 { self.next_page }

    #[must_use]
    pub fn free_count(&self) -> usize { self.free_stack.len() }

    #[must_use]
    pub fn is_live(&self, id: PageId) -> bool { id < self.next_page && !self.free_set.contains(&id) }

    /// Pops the most recently freed page, or issues a new ID.
    pub fn alloc(&mut self) -> PageId {
        if let Some(page) = self.free_stack.pop() {
            self.free_set.remove(&page);
            page
        } else {
            let page = self.next_page;
            self.next_page += 1;
            page
        }
    }

    /// # Errors
    /// `PageNotFound` if the page was never issued or is already free.
    pub fn free(&mut self, id: PageId) -> Result<()> {
        if !self.is_live(id) {
            return Err(StorageError::PageNotFound { page_id: id });
        }
        self.free_stack.push(id);
        self.free_set.insert(id);
        Ok(())
    }

    /// # Errors
    /// `PageNotFound` if `id` is not live.
    pub fn check_live(&self, id: PageId) -> Result<()> {
        if self.is_live(id) { Ok(()) } else { Err(StorageError::PageNotFound { page_id: id }) }
    }
}
