//! Buffered file backend: async sequential I/O, header in slot 0, LRU read cache.

use std::io::SeekFrom;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::header::StoreHeader;
use super::{check_len, check_page_size, grown_capacity, PageAllocator, PageId, PageStore};
use crate::errors::{Result, StorageError};

pub const FILE_STORE_MAGIC: [u8; 4] = *b"LSPF";

/// Default number of clean pages kept in the read cache.
pub const DEFAULT_CACHE_PAGES: usize = 256;

pub struct FilePageStore {
    path: PathBuf,
    page_size: usize,
    alloc: Mutex<PageAllocator>,
    cache: Mutex<LruCache<PageId, Box<[u8]>>>,
    file: tokio::sync::Mutex<FileState>,
}

struct FileState {
    file: File,
    /// Data pages the file can hold without growing.
    capacity: u64,
}

impl FilePageStore {
    /// Opens or creates a page file.
    ///
    /// # Errors
    /// `InvalidFormat` when an existing file has a bad magic, a different page size or a
    /// truncated header; `Io` on open failures.
    pub async fn open(path: impl AsRef<Path>, page_size: usize, cache_pages: usize) -> Result<Self> {
        check_page_size(page_size)?;
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path).await?;
        let len = file.metadata().await?.len();
        let ps = page_size as u64;
        let (header, capacity) = if len == 0 {
            let header = StoreHeader::new(FILE_STORE_MAGIC, page_size as u32);
            file.write_all(&header.encode()).await?;
            file.sync_data().await?;
            (header, 0)
        } else {
            if len < ps {
                return Err(StorageError::format(format!("truncated header: file is {len} bytes")));
            }
            let mut buf = vec![0u8; page_size];
            file.seek(SeekFrom::Start(0)).await?;
            file.read_exact(&mut buf).await?;
            let header = StoreHeader::decode(&buf, FILE_STORE_MAGIC, page_size)?;
            (header, len / ps - 1)
        };
        log::info!(
            "page file {} opened: page_size={}, pages={}, free={}",
            path.display(),
            page_size,
            header.page_count,
            header.free_list.len()
        );
        let cache_pages = NonZeroUsize::new(cache_pages.max(1)).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            path,
            page_size,
            alloc: Mutex::new(PageAllocator::from_header(&header)),
            cache: Mutex::new(LruCache::new(cache_pages)),
            file: tokio::sync::Mutex::new(FileState { file, capacity }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path { &self.path }

    #[must_use]
    pub fn free_count(&self) -> usize { self.alloc.lock().free_count() }

    const fn offset(&self, id: PageId) -> u64 { (id + 1) * self.page_size as u64 }

    async fn ensure_capacity(&self, state: &mut FileState, id: PageId) -> Result<()> {
        if id < state.capacity {
            return Ok(());
        }
        let new_cap = grown_capacity(state.capacity, id + 1);
        state.file.set_len((new_cap + 1) * self.page_size as u64).await?;
        log::debug!("page file {} grown to {} pages", self.path.display(), new_cap);
        state.capacity = new_cap;
        Ok(())
    }
}

impl std::fmt::Debug for FilePageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePageStore")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .finish()
    }
}

#[async_trait]
impl PageStore for FilePageStore {
    fn page_size(&self) -> usize { self.page_size }

    fn page_count(&self) -> u64 { self.alloc.lock().page_count() }

    async fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        self.alloc.lock().check_live(id)?;
        if let Some(hit) = self.cache.lock().get(&id) {
            return Ok(hit.to_vec());
        }
        let mut state = self.file.lock().await;
        let mut buf = vec![0u8; self.page_size];
        if id < state.capacity {
            state.file.seek(SeekFrom::Start(self.offset(id))).await?;
            state.file.read_exact(&mut buf).await?;
        }
        drop(state);
        self.cache.lock().put(id, buf.clone().into_boxed_slice());
        Ok(buf)
    }

    async fn write_page(&self, id: PageId, data: &[u8]) -> Result<()> {
        check_len(self.page_size, data)?;
        self.alloc.lock().check_live(id)?;
        let mut state = self.file.lock().await;
        self.ensure_capacity(&mut state, id).await?;
        state.file.seek(SeekFrom::Start(self.offset(id))).await?;
        state.file.write_all(data).await?;
        state.file.flush().await?;
        drop(state);
        self.cache.lock().put(id, data.into());
        Ok(())
    }

    async fn allocate_page(&self) -> Result<PageId> {
        Ok(self.alloc.lock().alloc())
    }

    async fn free_page(&self, id: PageId) -> Result<()> {
        self.alloc.lock().free(id)?;
        self.cache.lock().pop(&id);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut header = StoreHeader::new(FILE_STORE_MAGIC, self.page_size as u32);
        self.alloc.lock().export_to_header(&mut header);
        let mut state = self.file.lock().await;
        state.file.seek(SeekFrom::Start(0)).await?;
        state.file.write_all(&header.encode()).await?;
        state.file.flush().await?;
        state.file.sync_all().await?;
        Ok(())
    }
}
