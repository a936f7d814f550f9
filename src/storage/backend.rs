use async_trait::async_trait;

use super::{FilePageStore, MemoryPageStore, MmapPageStore, PageId, PageStore, ZeroCopyPages};
use crate::errors::Result;

/// Runtime-selected backend, so configured engines stay non-generic.
#[derive(Debug)]
pub enum Backend {
    File(FilePageStore),
    Mmap(MmapPageStore),
    Memory(MemoryPageStore),
}

impl Backend {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::Mmap(_) => "mmap",
            Self::Memory(_) => "memory",
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $s:ident => $e:expr) => {
        match $self {
            Backend::File($s) => $e,
            Backend::Mmap($s) => $e,
            Backend::Memory($s) => $e,
        }
    };
}

#[async_trait]
impl PageStore for Backend {
    fn page_size(&self) -> usize { dispatch!(self, s => s.page_size()) }

    fn page_count(&self) -> u64 { dispatch!(self, s => s.page_count()) }

    async fn read_page(&self, id: PageId) -> Result<Vec<u8>> { dispatch!(self, s => s.read_page(id).await) }

    async fn write_page(&self, id: PageId, data: &[u8]) -> Result<()> {
        dispatch!(self, s => s.write_page(id, data).await)
    }

    async fn allocate_page(&self) -> Result<PageId> { dispatch!(self, s => s.allocate_page().await) }

    async fn free_page(&self, id: PageId) -> Result<()> { dispatch!(self, s => s.free_page(id).await) }

    async fn flush(&self) -> Result<()> { dispatch!(self, s => s.flush().await) }

    fn zero_copy(&self) -> Option<&dyn ZeroCopyPages> { dispatch!(self, s => s.zero_copy()) }
}
