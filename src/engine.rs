//! Engine façade: configured backend + WAL-backed store + checkpoint service.

use std::path::Path;
use std::sync::Arc;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::btree::{BPlusTree, FixedKey, FixedValue};
use crate::checkpoint::{checkpoint_once, CheckpointService, CheckpointStats};
use crate::config::{BackendKind, EngineConfig};
use crate::durable::WalPageStore;
use crate::errors::{Result, StorageError};
use crate::logger;
use crate::recovery::RecoveryReport;
use crate::storage::{Backend, FilePageStore, MemoryPageStore, MmapPageStore, PageId, PageStore};
use crate::wal::{Lsn, TxnId};

/// Store type every engine index runs on.
pub type EngineStore = WalPageStore<Backend>;

/// Index handle returned by the engine.
pub type Index<K, V> = BPlusTree<EngineStore, K, V>;

pub struct Engine {
    config: EngineConfig,
    store: Arc<EngineStore>,
    checkpoints: Option<CheckpointService<Backend>>,
    recovery: Option<RecoveryReport>,
}

impl Engine {
    /// Builds the configured backend, recovers it from the WAL and starts the checkpoint
    /// service when enabled.
    ///
    /// # Errors
    /// `Config` for an invalid config; backend, WAL or recovery errors.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        if let Some(dir) = config.logging.dir.as_deref() {
            if let Err(e) = logger::configure_logging(Some(dir), config.logging.level.as_deref(), config.logging.retention) {
                warn!("logging setup in {} failed: {e}", dir.display());
            }
        }
        let backend = match config.backend {
            BackendKind::File => {
                Backend::File(FilePageStore::open(&config.data_path, config.page_size, config.cache_capacity).await?)
            }
            BackendKind::Mmap => {
                let (path, page_size) = (config.data_path.clone(), config.page_size);
                let store = tokio::task::spawn_blocking(move || MmapPageStore::open(path, page_size))
                    .await
                    .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;
                Backend::Mmap(store)
            }
            BackendKind::Memory => {
                discard_wal(&config.wal_path()).await?;
                Backend::Memory(MemoryPageStore::new(config.page_size)?)
            }
        };
        info!("opening {} engine at {}", backend.kind(), config.data_path.display());
        let (store, recovery) = WalPageStore::open(Arc::new(backend), config.wal_path(), &CancellationToken::new()).await?;
        let store = Arc::new(store);
        let checkpoints = config
            .checkpoint
            .enabled
            .then(|| CheckpointService::spawn(Arc::clone(&store), config.checkpoint_options()));
        Ok(Self { config, store, checkpoints, recovery })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<EngineStore> {
        &self.store
    }

    /// Report of the recovery run at open, `None` when the log was empty.
    #[must_use]
    pub const fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    /// Opens the index rooted at page 0, creating it when the store is empty.
    ///
    /// # Errors
    /// `InvalidFormat` when page 0 holds an index with other widths; store errors.
    pub async fn open_index<K: FixedKey, V: FixedValue>(&self) -> Result<Index<K, V>> {
        if self.store.page_count() == 0 {
            return self.create_index().await;
        }
        BPlusTree::open_at(Arc::clone(&self.store), 0).await
    }

    /// Creates another index in the same store; keep its `meta_page` to reopen it.
    ///
    /// Runs inside the active transaction, or in one of its own that commits on success.
    ///
    /// # Errors
    /// Store errors.
    pub async fn create_index<K: FixedKey, V: FixedValue>(&self) -> Result<Index<K, V>> {
        if self.store.current_transaction().await.is_some() {
            return BPlusTree::create(Arc::clone(&self.store)).await;
        }
        self.store.begin_transaction().await?;
        match BPlusTree::create(Arc::clone(&self.store)).await {
            Ok(tree) => {
                self.store.commit().await?;
                Ok(tree)
            }
            Err(e) => {
                self.store.rollback().await?;
                Err(e)
            }
        }
    }

    /// # Errors
    /// `InvalidFormat` when `meta_page` is not a matching index.
    pub async fn open_index_at<K: FixedKey, V: FixedValue>(&self, meta_page: PageId) -> Result<Index<K, V>> {
        BPlusTree::open_at(Arc::clone(&self.store), meta_page).await
    }

    /// # Errors
    /// `ProtocolViolation` when a transaction is already active.
    pub async fn begin(&self) -> Result<TxnId> {
        self.store.begin_transaction().await
    }

    /// # Errors
    /// `ProtocolViolation` without an active transaction.
    pub async fn commit(&self) -> Result<Lsn> {
        self.store.commit().await
    }

    /// # Errors
    /// `ProtocolViolation` without an active transaction.
    pub async fn rollback(&self) -> Result<usize> {
        self.store.rollback().await
    }

    /// Forces one checkpoint cycle.
    ///
    /// # Errors
    /// Store or WAL errors.
    pub async fn checkpoint(&self) -> Result<CheckpointStats> {
        match &self.checkpoints {
            Some(service) => service.trigger().await,
            None => checkpoint_once(&self.store, &CancellationToken::new()).await,
        }
    }

    /// Stops the checkpoint service (running its final cycle), rolls back an active
    /// transaction and flushes everything.
    ///
    /// # Errors
    /// Checkpoint, store or WAL errors.
    pub async fn close(mut self) -> Result<()> {
        if self.store.current_transaction().await.is_some() {
            self.store.rollback().await?;
        }
        if let Some(service) = self.checkpoints.take() {
            service.shutdown().await?;
        }
        self.store.close().await?;
        info!("engine at {} closed", self.config.data_path.display());
        Ok(())
    }
}

/// A memory store starts empty, so a log left by an earlier run describes pages that no
/// longer exist.
async fn discard_wal(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!("discarded WAL {} left by a previous memory engine", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_path", &self.config.data_path)
            .field("backend", &self.config.backend)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
