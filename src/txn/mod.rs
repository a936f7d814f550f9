//! Transaction IDs, active-transaction tracking and log-driven rollback.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::errors::{Result, StorageError};
use crate::storage::{stamp_page_lsn, write_materialized, PageId, PageStore};
use crate::wal::{Lsn, TxnId, WalFile, WalRecord};

/// First logged write of one page inside a transaction.
#[derive(Debug, Clone)]
pub struct WriteEntry {
    pub page_id: PageId,
    pub before: Bytes,
    pub lsn: Lsn,
}

#[derive(Debug)]
struct TxnState {
    begin_lsn: Lsn,
    writes: Vec<WriteEntry>,
    written: HashSet<PageId>,
    reads: HashSet<PageId>,
}

/// Issues transaction IDs and keeps the write/read sets of every active transaction.
pub struct TransactionManager {
    wal: Arc<WalFile>,
    next_txn: AtomicU64,
    active: Mutex<HashMap<TxnId, TxnState>>,
}

impl TransactionManager {
    #[must_use]
    pub fn new(wal: Arc<WalFile>) -> Arc<Self> {
        Arc::new(Self { wal, next_txn: AtomicU64::new(1), active: Mutex::new(HashMap::new()) })
    }

    #[must_use]
    pub const fn wal(&self) -> &Arc<WalFile> {
        &self.wal
    }

    /// Makes sure future IDs are at least `min_next`.
    pub fn seed_txn_ids(&self, min_next: TxnId) {
        self.next_txn.fetch_max(min_next.max(1), Ordering::SeqCst);
    }

    #[must_use]
    pub fn next_txn_id(&self) -> TxnId {
        self.next_txn.load(Ordering::SeqCst)
    }

    /// Logs a Begin record and registers the transaction.
    ///
    /// `undo` is the store that rollback restores before-images into; `None` rolls back the
    /// log only.
    ///
    /// # Errors
    /// WAL append errors.
    pub async fn begin(self: &Arc<Self>, undo: Option<Arc<dyn PageStore>>) -> Result<TransactionContext> {
        let id = self.next_txn.fetch_add(1, Ordering::SeqCst);
        let begin_lsn = self.wal.append_with(|lsn| WalRecord::begin(lsn, id)).await?;
        self.active.lock().insert(
            id,
            TxnState { begin_lsn, writes: Vec::new(), written: HashSet::new(), reads: HashSet::new() },
        );
        debug!("txn {id} began at LSN {begin_lsn}");
        Ok(TransactionContext { id, begin_lsn, manager: Arc::clone(self), undo, finished: false })
    }

    fn with_state<T>(&self, id: TxnId, f: impl FnOnce(&mut TxnState) -> T) -> Result<T> {
        let mut active = self.active.lock();
        let state = active
            .get_mut(&id)
            .ok_or_else(|| StorageError::protocol(format!("transaction {id} is not active")))?;
        Ok(f(state))
    }

    fn take_state(&self, id: TxnId) -> Result<TxnState> {
        self.active
            .lock()
            .remove(&id)
            .ok_or_else(|| StorageError::protocol(format!("transaction {id} is not active")))
    }

    /// # Errors
    /// `ProtocolViolation` when `id` is not active.
    pub fn track_read(&self, id: TxnId, page_id: PageId) -> Result<()> {
        self.with_state(id, |s| {
            s.reads.insert(page_id);
        })
    }

    /// Records the before-image of the first write to `page_id`. Returns whether this was the
    /// first write.
    ///
    /// # Errors
    /// `ProtocolViolation` when `id` is not active.
    pub fn track_write(&self, id: TxnId, page_id: PageId, before: Bytes, lsn: Lsn) -> Result<bool> {
        self.with_state(id, |s| {
            if !s.written.insert(page_id) {
                return false;
            }
            s.writes.push(WriteEntry { page_id, before, lsn });
            true
        })
    }

    /// Appends Commit, flushes the log and forgets the transaction.
    ///
    /// # Errors
    /// `ProtocolViolation` when `id` is not active; WAL errors.
    pub async fn commit(&self, id: TxnId) -> Result<Lsn> {
        if !self.is_active(id) {
            return Err(StorageError::protocol(format!("transaction {id} is not active")));
        }
        let lsn = self.wal.append_with(|lsn| WalRecord::commit(lsn, id)).await?;
        self.wal.flush().await?;
        self.take_state(id)?;
        debug!("txn {id} committed at LSN {lsn}");
        Ok(lsn)
    }

    /// Appends a CLR per written page in reverse write order, restoring each before-image into
    /// `undo`, then Abort, then flushes. Returns the number of pages restored.
    ///
    /// # Errors
    /// `ProtocolViolation` when `id` is not active; WAL or store errors.
    pub async fn rollback(&self, id: TxnId, undo: Option<&dyn PageStore>) -> Result<usize> {
        let state = self.take_state(id)?;
        let restored = state.writes.len();
        for entry in state.writes.into_iter().rev() {
            let before = match undo {
                Some(store) => Bytes::from(store.read_page(entry.page_id).await?),
                None => entry.before.clone(),
            };
            let mut image = entry.before.to_vec();
            let clr_lsn = self
                .wal
                .append_with(|lsn| {
                    let mut after = entry.before.to_vec();
                    stamp_page_lsn(&mut after, lsn);
                    WalRecord::compensation(lsn, id, entry.page_id, entry.lsn, before, Bytes::from(after))
                })
                .await?;
            stamp_page_lsn(&mut image, clr_lsn);
            if let Some(store) = undo {
                write_materialized(store, entry.page_id, &image).await?;
            }
        }
        let abort = self.wal.append_with(|lsn| WalRecord::abort(lsn, id)).await?;
        self.wal.flush().await?;
        info!("txn {id} rolled back at LSN {abort}: {restored} pages restored");
        Ok(restored)
    }

    /// Rolls back every still-active transaction. Returns how many there were.
    ///
    /// # Errors
    /// The first rollback failure.
    pub async fn shutdown(&self, undo: Option<&dyn PageStore>) -> Result<usize> {
        let ids: Vec<TxnId> = self.active.lock().keys().copied().collect();
        for id in &ids {
            self.rollback(*id, undo).await?;
        }
        Ok(ids.len())
    }

    #[must_use]
    pub fn is_active(&self, id: TxnId) -> bool {
        self.active.lock().contains_key(&id)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    #[must_use]
    pub fn min_active_begin_lsn(&self) -> Option<Lsn> {
        self.active.lock().values().map(|s| s.begin_lsn).min()
    }

    /// Pages written by `id`, in first-write order.
    #[must_use]
    pub fn write_set(&self, id: TxnId) -> Vec<PageId> {
        self.with_state(id, |s| s.writes.iter().map(|w| w.page_id).collect()).unwrap_or_default()
    }

    #[must_use]
    pub fn read_set(&self, id: TxnId) -> Vec<PageId> {
        self.with_state(id, |s| {
            let mut pages: Vec<_> = s.reads.iter().copied().collect();
            pages.sort_unstable();
            pages
        })
        .unwrap_or_default()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_txn", &self.next_txn_id())
            .field("active", &self.active_count())
            .finish()
    }
}

/// Handle to one active transaction.
///
/// Dropping it without `commit` or `rollback` schedules a rollback on the current tokio
/// runtime.
pub struct TransactionContext {
    id: TxnId,
    begin_lsn: Lsn,
    manager: Arc<TransactionManager>,
    undo: Option<Arc<dyn PageStore>>,
    finished: bool,
}

impl TransactionContext {
    #[must_use]
    pub const fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub const fn begin_lsn(&self) -> Lsn {
        self.begin_lsn
    }

    /// # Errors
    /// `ProtocolViolation` when the transaction is no longer active.
    pub fn track_read(&self, page_id: PageId) -> Result<()> {
        self.manager.track_read(self.id, page_id)
    }

    /// # Errors
    /// `ProtocolViolation` when the transaction is no longer active.
    pub fn track_write(&self, page_id: PageId, before: Bytes, lsn: Lsn) -> Result<bool> {
        self.manager.track_write(self.id, page_id, before, lsn)
    }

    /// # Errors
    /// WAL errors; the transaction stays active if the Commit record was not written.
    pub async fn commit(mut self) -> Result<Lsn> {
        let lsn = self.manager.commit(self.id).await?;
        self.finished = true;
        Ok(lsn)
    }

    /// # Errors
    /// WAL or store errors.
    pub async fn rollback(mut self) -> Result<usize> {
        self.finished = true;
        self.manager.rollback(self.id, self.undo.as_deref()).await
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id)
            .field("begin_lsn", &self.begin_lsn)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if self.finished || !self.manager.is_active(self.id) {
            return;
        }
        let id = self.id;
        warn!("txn {id} dropped while active, scheduling rollback");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("txn {id}: no tokio runtime, rollback left to recovery");
            return;
        };
        let manager = Arc::clone(&self.manager);
        let undo = self.undo.take();
        handle.spawn(async move {
            if let Err(e) = manager.rollback(id, undo.as_deref()).await {
                warn!("txn {id}: background rollback failed: {e}");
            }
        });
    }
}
