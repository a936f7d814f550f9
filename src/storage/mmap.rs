//! Memory-mapped backend with an optional zero-copy read path.
//!
//! `open` is synchronous; async callers run it on the blocking pool. Growth (`set_len` plus a
//! remap) and `flush` (msync) block the calling worker while the map lock is held.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use super::header::StoreHeader;
use super::{
    check_len, check_page_size, grown_capacity, PageAllocator, PageId, PageRef, PageStore, ZeroCopyPages,
};
use crate::errors::{Result, StorageError};

pub const MMAP_STORE_MAGIC: [u8; 4] = *b"LSPM";

const INITIAL_CAPACITY: u64 = 4;

pub struct MmapPageStore {
    path: PathBuf,
    page_size: usize,
    alloc: Mutex<PageAllocator>,
    map: RwLock<MapState>,
}

struct MapState {
    file: File,
    mmap: MmapMut,
    /// Data pages covered by the current mapping.
    capacity: u64,
}

fn map_file(file: &File) -> Result<MmapMut> {
    // SAFETY: the file is opened read/write by this store only and its length is changed
    // solely under the exclusive `map` lock, after which the mapping is rebuilt.
    let mmap = unsafe { MmapMut::map_mut(file)? };
    Ok(mmap)
}

impl MmapPageStore {
    /// Opens or creates a mapped page file.
    ///
    /// # Errors
    /// `InvalidFormat` for a bad magic, mismatched page size or truncated header.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        check_page_size(page_size)?;
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;
        let len = file.metadata()?.len();
        let ps = page_size as u64;
        let fresh = len == 0;
        if fresh {
            file.set_len((INITIAL_CAPACITY + 1) * ps)?;
        } else if len < ps {
            return Err(StorageError::format(format!("truncated header: file is {len} bytes")));
        }
        let mut mmap = map_file(&file)?;
        let header = if fresh {
            let header = StoreHeader::new(MMAP_STORE_MAGIC, page_size as u32);
            mmap[..page_size].copy_from_slice(&header.encode());
            mmap.flush()?;
            header
        } else {
            StoreHeader::decode(&mmap[..page_size], MMAP_STORE_MAGIC, page_size)?
        };
        let capacity = (mmap.len() as u64 / ps).saturating_sub(1);
        log::info!("mapped page file {} opened: pages={}", path.display(), header.page_count);
        Ok(Self {
            path,
            page_size,
            alloc: Mutex::new(PageAllocator::from_header(&header)),
            map: RwLock::new(MapState { file, mmap, capacity }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path { &self.path }

    /// Number of data pages the current mapping covers.
    #[must_use]
    pub fn mapped_capacity(&self) -> u64 { self.map.read().capacity }

    fn range(&self, id: PageId) -> std::ops::Range<usize> {
        let start = (id as usize + 1) * self.page_size;
        start..start + self.page_size
    }

    fn grow(&self, state: &mut MapState, id: PageId) -> Result<()> {
        if id < state.capacity {
            return Ok(());
        }
        let new_cap = grown_capacity(state.capacity, id + 1);
        state.mmap.flush()?;
        state.file.set_len((new_cap + 1) * self.page_size as u64)?;
        state.mmap = map_file(&state.file)?;
        state.capacity = new_cap;
        log::debug!("mapped page file {} remapped to {} pages", self.path.display(), new_cap);
        Ok(())
    }
}

impl std::fmt::Debug for MmapPageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapPageStore").field("path", &self.path).field("page_size", &self.page_size).finish()
    }
}

#[async_trait]
impl PageStore for MmapPageStore {
    fn page_size(&self) -> usize { self.page_size }

    fn page_count(&self) -> u64 { self.alloc.lock().page_count() }

    async fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        self.alloc.lock().check_live(id)?;
        let state = self.map.read();
        if id >= state.capacity {
            return Ok(vec![0u8; self.page_size]);
        }
        Ok(state.mmap[self.range(id)].to_vec())
    }

    async fn write_page(&self, id: PageId, data: &[u8]) -> Result<()> {
        check_len(self.page_size, data)?;
        self.alloc.lock().check_live(id)?;
        let mut state = self.map.write();
        self.grow(&mut state, id)?;
        let range = self.range(id);
        state.mmap[range].copy_from_slice(data);
        Ok(())
    }

    async fn allocate_page(&self) -> Result<PageId> {
        let id = self.alloc.lock().alloc();
        let mut state = self.map.write();
        self.grow(&mut state, id)?;
        Ok(id)
    }

    async fn free_page(&self, id: PageId) -> Result<()> {
        self.alloc.lock().free(id)
    }

    async fn flush(&self) -> Result<()> {
        let mut header = StoreHeader::new(MMAP_STORE_MAGIC, self.page_size as u32);
        self.alloc.lock().export_to_header(&mut header);
        let mut state = self.map.write();
        state.mmap[..self.page_size].copy_from_slice(&header.encode());
        state.mmap.flush()?;
        Ok(())
    }

    fn zero_copy(&self) -> Option<&dyn ZeroCopyPages> {
        Some(self)
    }
}

impl ZeroCopyPages for MmapPageStore {
    fn page_ref(&self, id: PageId) -> Result<PageRef<'_>> {
        self.alloc.lock().check_live(id)?;
        let range = self.range(id);
        let guard = self.map.read();
        if id >= guard.capacity {
            return Err(StorageError::PageNotFound { page_id: id });
        }
        Ok(PageRef::new(RwLockReadGuard::map(guard, |s| &s.mmap[range])))
    }
}
