//! `PageStore` decorator that logs every mutation before applying it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, StorageError};
use crate::recovery::{self, RecoveryReport};
use crate::storage::{check_len, stamp_page_lsn, PageId, PageStore};
use crate::txn::{TransactionContext, TransactionManager};
use crate::wal::{Lsn, TxnId, WalFile, WalRecord};

/// The single in-flight transaction and the allocation work it has not settled yet.
struct ActiveTxn {
    ctx: TransactionContext,
    allocated: Vec<PageId>,
    deferred_frees: Vec<PageId>,
}

/// Write-ahead-logged page store. At most one transaction is active at a time and every
/// mutation must happen inside it.
pub struct WalPageStore<S> {
    inner: Arc<S>,
    undo: Arc<dyn PageStore>,
    wal: Arc<WalFile>,
    txns: Arc<TransactionManager>,
    current: tokio::sync::Mutex<Option<ActiveTxn>>,
    dirty: Mutex<HashMap<PageId, Bytes>>,
    checkpoint_gate: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl<S: PageStore + 'static> WalPageStore<S> {
    /// Opens the log at `wal_path`, recovers `inner` from it when it holds records and seeds
    /// transaction IDs above every ID the log has seen.
    ///
    /// # Errors
    /// `Cancelled` when `cancel` fires during recovery; WAL format or store errors.
    pub async fn open(
        inner: Arc<S>,
        wal_path: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<(Self, Option<RecoveryReport>)> {
        let wal = Arc::new(WalFile::open(wal_path).await?);
        let txns = TransactionManager::new(Arc::clone(&wal));
        let report = if wal.is_empty().await {
            None
        } else {
            let report = recovery::recover(inner.as_ref(), &wal, cancel).await?;
            txns.seed_txn_ids(report.next_txn_id);
            Some(report)
        };
        info!(
            "WAL-backed store ready: {} pages, next txn {}",
            inner.page_count(),
            txns.next_txn_id()
        );
        let undo: Arc<dyn PageStore> = inner.clone();
        let store = Self {
            inner,
            undo,
            wal,
            txns,
            current: tokio::sync::Mutex::new(None),
            dirty: Mutex::new(HashMap::new()),
            checkpoint_gate: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        };
        Ok((store, report))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::protocol("WAL-backed store is closed"));
        }
        Ok(())
    }

    async fn active_id(&self) -> Result<TxnId> {
        self.ensure_open()?;
        self.current
            .lock()
            .await
            .as_ref()
            .map(|t| t.ctx.id())
            .ok_or_else(|| StorageError::protocol("no active transaction"))
    }

    /// # Errors
    /// `ProtocolViolation` when a transaction is already active or the store is closed.
    pub async fn begin_transaction(&self) -> Result<TxnId> {
        self.ensure_open()?;
        let mut current = self.current.lock().await;
        if let Some(active) = current.as_ref() {
            return Err(StorageError::protocol(format!("transaction {} is already active", active.ctx.id())));
        }
        let ctx = self.txns.begin(Some(Arc::clone(&self.undo))).await?;
        let id = ctx.id();
        *current = Some(ActiveTxn { ctx, allocated: Vec::new(), deferred_frees: Vec::new() });
        Ok(id)
    }

    /// Logs Commit, flushes the log, then applies the deferred frees.
    ///
    /// # Errors
    /// `ProtocolViolation` without an active transaction; store or WAL errors.
    pub async fn commit(&self) -> Result<Lsn> {
        self.ensure_open()?;
        let active = self.current.lock().await.take().ok_or_else(|| StorageError::protocol("no active transaction"))?;
        let ActiveTxn { ctx, deferred_frees, .. } = active;
        let id = ctx.id();
        let lsn = ctx.commit().await?;
        self.dirty.lock().clear();
        for page in &deferred_frees {
            self.inner.free_page(*page).await?;
        }
        debug!("txn {id} committed at LSN {lsn}, {} pages freed", deferred_frees.len());
        Ok(lsn)
    }

    /// Restores every page the transaction wrote, releases its allocations and logs Abort.
    ///
    /// # Errors
    /// `ProtocolViolation` without an active transaction; store or WAL errors.
    pub async fn rollback(&self) -> Result<usize> {
        self.ensure_open()?;
        let active = self.current.lock().await.take().ok_or_else(|| StorageError::protocol("no active transaction"))?;
        self.settle_rollback(active).await
    }

    async fn settle_rollback(&self, active: ActiveTxn) -> Result<usize> {
        let restored = active.ctx.rollback().await?;
        for page in active.allocated.iter().rev() {
            self.inner.free_page(*page).await?;
        }
        self.dirty.lock().clear();
        Ok(restored)
    }

    /// Rolls back an active transaction and flushes store and log. Further use fails with
    /// `ProtocolViolation`.
    ///
    /// # Errors
    /// Store or WAL errors.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let active = self.current.lock().await.take();
        if let Some(active) = active {
            warn!("closing with active transaction {}, rolling back", active.ctx.id());
            self.settle_rollback(active).await?;
        }
        let stray = self.txns.shutdown(Some(&*self.undo)).await?;
        if stray > 0 {
            warn!("rolled back {stray} transactions begun directly on the manager");
        }
        self.dirty.lock().clear();
        self.inner.flush().await?;
        self.wal.flush().await?;
        info!("WAL-backed store closed at LSN {}", self.wal.next_lsn().await.saturating_sub(1));
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// ID of the active transaction, if any.
    pub async fn current_transaction(&self) -> Option<TxnId> {
        self.current.lock().await.as_ref().map(|t| t.ctx.id())
    }

    #[must_use]
    pub const fn inner(&self) -> &Arc<S> {
        &self.inner
    }

    #[must_use]
    pub const fn wal(&self) -> &Arc<WalFile> {
        &self.wal
    }

    #[must_use]
    pub const fn transactions(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    /// Serializes checkpoint cycles.
    pub(crate) const fn checkpoint_gate(&self) -> &tokio::sync::Mutex<()> {
        &self.checkpoint_gate
    }
}

#[async_trait]
impl<S: PageStore + 'static> PageStore for WalPageStore<S> {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn page_count(&self) -> u64 {
        self.inner.page_count()
    }

    async fn read_page(&self, id: PageId) -> Result<Vec<u8>> {
        self.ensure_open()?;
        if let Some(txn) = self.current.lock().await.as_ref() {
            txn.ctx.track_read(id)?;
        }
        if let Some(hit) = self.dirty.lock().get(&id) {
            return Ok(hit.to_vec());
        }
        self.inner.read_page(id).await
    }

    /// Logs a Write record whose after-image carries its own LSN, then applies it.
    async fn write_page(&self, id: PageId, data: &[u8]) -> Result<()> {
        check_len(self.inner.page_size(), data)?;
        let txn = self.active_id().await?;
        let cached = self.dirty.lock().get(&id).cloned();
        let before = match cached {
            Some(hit) => hit,
            None => Bytes::from(self.inner.read_page(id).await?),
        };
        let logged_before = before.clone();
        let lsn = self
            .wal
            .append_with(|lsn| {
                let mut after = data.to_vec();
                stamp_page_lsn(&mut after, lsn);
                WalRecord::write(lsn, txn, id, logged_before, Bytes::from(after))
            })
            .await?;
        let mut after = data.to_vec();
        stamp_page_lsn(&mut after, lsn);
        let after = Bytes::from(after);
        self.txns.track_write(txn, id, before, lsn)?;
        self.dirty.lock().insert(id, after.clone());
        self.inner.write_page(id, &after).await
    }

    async fn allocate_page(&self) -> Result<PageId> {
        let txn = self.active_id().await?;
        let id = self.inner.allocate_page().await?;
        if let Err(e) = self.wal.append_with(|lsn| WalRecord::allocate(lsn, txn, id)).await {
            self.inner.free_page(id).await?;
            return Err(e);
        }
        if let Some(active) = self.current.lock().await.as_mut() {
            active.allocated.push(id);
        }
        Ok(id)
    }

    /// The page stays readable until commit; rollback simply forgets the free.
    async fn free_page(&self, id: PageId) -> Result<()> {
        let txn = self.active_id().await?;
        self.inner.read_page(id).await?;
        let mut current = self.current.lock().await;
        let Some(active) = current.as_mut() else {
            return Err(StorageError::protocol("no active transaction"));
        };
        if active.deferred_frees.contains(&id) {
            return Err(StorageError::PageNotFound { page_id: id });
        }
        self.wal.append_with(|lsn| WalRecord::free(lsn, txn, id)).await?;
        active.deferred_frees.push(id);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.flush().await?;
        self.wal.flush().await
    }
}

impl<S> Drop for WalPageStore<S> {
    fn drop(&mut self) {
        let active = self.current.get_mut().take();
        if active.is_none() && self.txns.active_count() == 0 {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("WAL-backed store dropped with active transactions outside a runtime");
            return;
        };
        warn!("WAL-backed store dropped with active transactions, scheduling rollback");
        let undo = Arc::clone(&self.undo);
        let txns = Arc::clone(&self.txns);
        handle.spawn(async move {
            if let Some(ActiveTxn { ctx, allocated, .. }) = active {
                let id = ctx.id();
                match ctx.rollback().await {
                    Ok(_) => {
                        for page in allocated.into_iter().rev() {
                            if let Err(e) = undo.free_page(page).await {
                                warn!("txn {id}: releasing page {page} failed: {e}");
                            }
                        }
                    }
                    Err(e) => warn!("txn {id}: background rollback failed: {e}"),
                }
            }
            if let Err(e) = txns.shutdown(Some(&*undo)).await {
                warn!("background transaction shutdown failed: {e}");
            }
        });
    }
}

impl<S> std::fmt::Debug for WalPageStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalPageStore")
            .field("wal", &self.wal)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
