//! Background checkpointing: flush committed state, then cut the log.
//!
//! Logs to the `lodestone::checkpoint` target.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::durable::WalPageStore;
use crate::errors::{Result, StorageError};
use crate::storage::{page_lsn, PageId, PageStore};
use crate::wal::{Lsn, RecordType, WalRecord, NULL_LSN};

const TARGET: &str = crate::logger::CHECKPOINT_TARGET;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointOptions {
    /// Run a cycle at least this often.
    pub interval: Duration,
    /// How often the trigger conditions are evaluated.
    pub poll_interval: Duration,
    pub max_wal_bytes: u64,
    pub max_wal_entries: u64,
    pub checkpoint_on_shutdown: bool,
}

impl Default for CheckpointOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            max_wal_bytes: 64 * 1024 * 1024,
            max_wal_entries: 10_000,
            checkpoint_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CheckpointStats {
    pub safe_lsn: Lsn,
    /// LSN of the Checkpoint record, `0` when the log was empty.
    pub checkpoint_lsn: Lsn,
    pub committed_txns: usize,
    pub pages_written: usize,
    pub pages_skipped: usize,
    pub records_truncated: usize,
}

/// One checkpoint cycle.
///
/// The safe LSN is the oldest Begin of an active transaction, or the latest LSN when none is
/// active. Pages touched by transactions committed at or before it are brought up to their
/// last committed image, the store is flushed, a Checkpoint record is logged and everything
/// before the safe LSN is dropped from the log.
///
/// # Errors
/// `Cancelled` between pages; store or WAL errors.
pub async fn checkpoint_once<S: PageStore + 'static>(
    store: &WalPageStore<S>,
    cancel: &CancellationToken,
) -> Result<CheckpointStats> {
    let _gate = store.checkpoint_gate().lock().await;
    if store.is_closed() {
        return Err(StorageError::protocol("WAL-backed store is closed"));
    }
    let wal = store.wal();
    let txns = store.transactions();
    let inner = store.inner();

    let last = wal.next_lsn().await.saturating_sub(1);
    let safe = txns.min_active_begin_lsn().unwrap_or(last);
    if safe == NULL_LSN {
        return Ok(CheckpointStats::default());
    }

    let records: Vec<WalRecord> = wal.read_from(NULL_LSN).await?.into_iter().filter(|r| r.lsn <= safe).collect();
    let committed: HashSet<_> =
        records.iter().filter(|r| r.record_type == RecordType::Commit).map(|r| r.txn_id).collect();
    let mut per_page: BTreeMap<PageId, Vec<&WalRecord>> = BTreeMap::new();
    for record in records.iter().filter(|r| r.record_type == RecordType::Write && committed.contains(&r.txn_id)) {
        per_page.entry(record.page_id).or_default().push(record);
    }
    let mut candidates: Vec<(Lsn, PageId)> = per_page.iter().map(|(page, w)| (w[0].lsn, *page)).collect();
    candidates.sort_unstable();

    let mut stats = CheckpointStats { safe_lsn: safe, committed_txns: committed.len(), ..CheckpointStats::default() };
    for (_, page) in candidates {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let current = match inner.read_page(page).await {
            Ok(current) => current,
            Err(e) if e.is_page_not_found() => {
                stats.pages_skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        let current_lsn = page_lsn(&current);
        let newest = per_page.get(&page).and_then(|w| w.iter().rev().find(|r| r.lsn > current_lsn));
        if let Some(record) = newest {
            inner.write_page(page, &record.after).await?;
            stats.pages_written += 1;
            debug!(target: TARGET, "page {page} brought from LSN {current_lsn} to {}", record.lsn);
        }
    }
    inner.flush().await?;

    let next_txn = txns.next_txn_id();
    stats.checkpoint_lsn = wal.append_with(|lsn| WalRecord::checkpoint(lsn, safe, next_txn)).await?;
    wal.flush().await?;
    stats.records_truncated = wal.truncate_before(safe).await?;
    info!(
        target: TARGET,
        "checkpoint at LSN {} (safe {safe}): {} pages written, {} skipped, {} records truncated",
        stats.checkpoint_lsn,
        stats.pages_written,
        stats.pages_skipped,
        stats.records_truncated
    );
    Ok(stats)
}

/// Periodic checkpoint task over one WAL-backed store.
pub struct CheckpointService<S: PageStore + 'static> {
    store: Arc<WalPageStore<S>>,
    options: CheckpointOptions,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl<S: PageStore + 'static> CheckpointService<S> {
    /// Starts the loop on the current tokio runtime.
    #[must_use]
    pub fn spawn(store: Arc<WalPageStore<S>>, options: CheckpointOptions) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(Arc::clone(&store), options.clone(), cancel.clone()));
        info!(target: TARGET, "checkpoint service started: interval {:?}", options.interval);
        Self { store, options, cancel, handle: Some(handle) }
    }

    #[must_use]
    pub const fn options(&self) -> &CheckpointOptions {
        &self.options
    }

    /// Runs a cycle right now, outside the timer.
    ///
    /// # Errors
    /// See [`checkpoint_once`].
    pub async fn trigger(&self) -> Result<CheckpointStats> {
        checkpoint_once(&self.store, &self.cancel).await
    }

    /// Stops the loop and, when configured, runs a final cycle.
    ///
    /// # Errors
    /// Errors from the final cycle.
    pub async fn shutdown(mut self) -> Result<Option<CheckpointStats>> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(target: TARGET, "checkpoint task ended abnormally: {e}");
            }
        }
        if !self.options.checkpoint_on_shutdown || self.store.is_closed() {
            return Ok(None);
        }
        let stats = checkpoint_once(&self.store, &CancellationToken::new()).await?;
        info!(target: TARGET, "final checkpoint at LSN {}", stats.checkpoint_lsn);
        Ok(Some(stats))
    }
}

impl<S: PageStore + 'static> Drop for CheckpointService<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn due<S: PageStore + 'static>(store: &WalPageStore<S>, options: &CheckpointOptions, last: Instant) -> bool {
    if last.elapsed() >= options.interval {
        return true;
    }
    let wal = store.wal();
    wal.size_bytes().await >= options.max_wal_bytes || wal.appended_since_checkpoint().await >= options.max_wal_entries
}

async fn run<S: PageStore + 'static>(store: Arc<WalPageStore<S>>, options: CheckpointOptions, cancel: CancellationToken) {
    let mut last = Instant::now();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(options.poll_interval) => {}
        }
        if store.is_closed() {
            break;
        }
        if !due(&store, &options, last).await {
            continue;
        }
        match checkpoint_once(&store, &cancel).await {
            Ok(_) => last = Instant::now(),
            Err(StorageError::Cancelled) => break,
            Err(e) => warn!(target: TARGET, "checkpoint failed: {e}"),
        }
    }
    debug!(target: TARGET, "checkpoint loop stopped");
}
