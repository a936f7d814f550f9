//! ARIES-style restart: analysis, redo, undo.
//!
//! Analysis is a pure function over decoded records; redo and undo mutate the page store.
//! Everything here logs to the `lodestone::recovery` target.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Bytes;
use log::{debug, info};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, StorageError};
use crate::storage::{materialize, page_lsn, stamp_page_lsn, write_materialized, PageId, PageStore};
use crate::wal::{Lsn, RecordType, TxnId, WalFile, WalRecord, NULL_LSN};

const TARGET: &str = crate::logger::RECOVERY_TARGET;

/// What the log says about transactions and pages since the last checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Analysis {
    /// Checkpoint LSN the scan started from.
    pub from_lsn: Lsn,
    pub winners: BTreeSet<TxnId>,
    /// Transactions that logged an Abort.
    pub aborted: BTreeSet<TxnId>,
    /// Unfinished transactions and their Begin LSN.
    pub losers: BTreeMap<TxnId, Lsn>,
    /// Earliest LSN that touched each page.
    pub dirty_pages: BTreeMap<PageId, Lsn>,
    pub entries_scanned: usize,
    pub max_lsn: Lsn,
    pub max_txn_id: TxnId,
    /// Next transaction ID carried by the latest Checkpoint record.
    pub checkpoint_next_txn: TxnId,
}

impl Analysis {
    /// First LSN redo has to look at.
    #[must_use]
    pub fn redo_start(&self) -> Option<Lsn> {
        self.dirty_pages.values().min().copied()
    }

    /// Smallest transaction ID that was never used.
    #[must_use]
    pub fn next_txn_id(&self) -> TxnId {
        (self.max_txn_id + 1).max(self.checkpoint_next_txn).max(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub winners: Vec<TxnId>,
    pub losers: Vec<TxnId>,
    pub pages_redone: usize,
    pub pages_undone: usize,
    pub entries_processed: usize,
    /// Last LSN in the log once recovery finished, including its own CLRs and Aborts.
    pub recovered_lsn: Lsn,
    pub next_txn_id: TxnId,
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(StorageError::Cancelled);
    }
    Ok(())
}

/// Classifies transactions and builds the dirty page table from records at or after
/// `checkpoint_lsn`.
#[must_use]
pub fn analyze(records: &[WalRecord], checkpoint_lsn: Lsn) -> Analysis {
    let mut analysis = Analysis { from_lsn: checkpoint_lsn, ..Analysis::default() };
    for record in records.iter().filter(|r| r.lsn >= checkpoint_lsn) {
        analysis.entries_scanned += 1;
        analysis.max_lsn = analysis.max_lsn.max(record.lsn);
        analysis.max_txn_id = analysis.max_txn_id.max(record.txn_id);
        match record.record_type {
            RecordType::Begin => {
                analysis.losers.insert(record.txn_id, record.lsn);
            }
            RecordType::Commit => {
                analysis.losers.remove(&record.txn_id);
                analysis.winners.insert(record.txn_id);
            }
            RecordType::Abort => {
                analysis.losers.remove(&record.txn_id);
                analysis.aborted.insert(record.txn_id);
            }
            RecordType::Write | RecordType::Compensation => {
                analysis.dirty_pages.entry(record.page_id).or_insert(record.lsn);
            }
            RecordType::Checkpoint => {
                analysis.checkpoint_next_txn = analysis.checkpoint_next_txn.max(record.page_id);
            }
            RecordType::Allocate | RecordType::Free => {}
        }
    }
    analysis
}

/// Reapplies page images newer than the page's embedded LSN and replays the allocator in log
/// order: every Allocate makes its page live, an Abort releases that transaction's allocations
/// and a Commit applies that transaction's deferred frees. Returns the number of pages written.
///
/// # Errors
/// `Cancelled` between records; store errors.
pub async fn redo(
    store: &dyn PageStore,
    records: &[WalRecord],
    analysis: &Analysis,
    cancel: &CancellationToken,
) -> Result<usize> {
    if let Some(start) = analysis.redo_start() {
        info!(target: TARGET, "redo of page images from LSN {start}");
    }
    let mut allocated: HashMap<TxnId, Vec<PageId>> = HashMap::new();
    let mut freed: HashMap<TxnId, Vec<PageId>> = HashMap::new();
    let mut redone = 0;
    for record in records.iter().filter(|r| r.lsn >= analysis.from_lsn) {
        check_cancel(cancel)?;
        match record.record_type {
            RecordType::Write | RecordType::Compensation => {
                materialize(store, record.page_id).await?;
                let current = store.read_page(record.page_id).await?;
                if record.lsn > page_lsn(&current) {
                    store.write_page(record.page_id, &record.after).await?;
                    redone += 1;
                    debug!(target: TARGET, "redo {} lsn={} page={}", record.record_type, record.lsn, record.page_id);
                }
            }
            RecordType::Allocate => {
                materialize(store, record.page_id).await?;
                allocated.entry(record.txn_id).or_default().push(record.page_id);
            }
            RecordType::Free => freed.entry(record.txn_id).or_default().push(record.page_id),
            RecordType::Commit => {
                for page in freed.remove(&record.txn_id).unwrap_or_default() {
                    release(store, page).await?;
                }
                allocated.remove(&record.txn_id);
            }
            RecordType::Abort => {
                let pages = allocated.remove(&record.txn_id).unwrap_or_default();
                for page in pages.into_iter().rev() {
                    release(store, page).await?;
                }
                freed.remove(&record.txn_id);
            }
            RecordType::Begin | RecordType::Checkpoint => {}
        }
    }
    Ok(redone)
}

/// Frees `page`, treating a page that is already free as done.
async fn release(store: &dyn PageStore, page: PageId) -> Result<()> {
    match store.free_page(page).await {
        Err(e) if e.is_page_not_found() => Ok(()),
        other => other,
    }
}

/// Rolls back every loser: a CLR and a restored before-image per Write in reverse order, loser
/// allocations released, then one Abort per loser and a single log flush.
///
/// # Errors
/// `Cancelled` between records; store or WAL errors.
pub async fn undo(
    store: &dyn PageStore,
    wal: &WalFile,
    records: &[WalRecord],
    analysis: &Analysis,
    cancel: &CancellationToken,
) -> Result<usize> {
    if analysis.losers.is_empty() {
        return Ok(0);
    }
    let mut undone = 0;
    for &txn in analysis.losers.keys().rev() {
        let writes: Vec<&WalRecord> =
            records.iter().filter(|r| r.txn_id == txn && r.record_type == RecordType::Write).collect();
        for write in writes.into_iter().rev() {
            check_cancel(cancel)?;
            let clr = wal
                .append_with(|lsn| {
                    let mut restored = write.before.to_vec();
                    stamp_page_lsn(&mut restored, lsn);
                    WalRecord::compensation(lsn, txn, write.page_id, write.lsn, write.after.clone(), Bytes::from(restored))
                })
                .await?;
            let mut image = write.before.to_vec();
            stamp_page_lsn(&mut image, clr);
            write_materialized(store, write.page_id, &image).await?;
            undone += 1;
        }
        let allocs: Vec<&WalRecord> =
            records.iter().filter(|r| r.txn_id == txn && r.record_type == RecordType::Allocate).collect();
        for alloc in allocs.into_iter().rev() {
            release(store, alloc.page_id).await?;
        }
        let abort = wal.append_with(|lsn| WalRecord::abort(lsn, txn)).await?;
        info!(target: TARGET, "loser txn {txn} aborted at LSN {abort}");
    }
    wal.flush().await?;
    Ok(undone)
}

/// Runs all three passes over `wal` against `store` and flushes the store.
///
/// # Errors
/// `Cancelled` when `cancel` fires; WAL or store errors.
pub async fn recover(store: &dyn PageStore, wal: &WalFile, cancel: &CancellationToken) -> Result<RecoveryReport> {
    check_cancel(cancel)?;
    let records = wal.read_from(NULL_LSN).await?;
    let checkpoint_lsn = wal.checkpoint_lsn().await;
    let analysis = analyze(&records, checkpoint_lsn);
    info!(
        target: TARGET,
        "analysis from LSN {checkpoint_lsn}: {} entries, {} winners, {} losers, {} dirty pages",
        analysis.entries_scanned,
        analysis.winners.len(),
        analysis.losers.len(),
        analysis.dirty_pages.len()
    );
    let pages_redone = redo(store, &records, &analysis, cancel).await?;
    let pages_undone = undo(store, wal, &records, &analysis, cancel).await?;
    store.flush().await?;
    let report = RecoveryReport {
        winners: analysis.winners.iter().copied().collect(),
        losers: analysis.losers.keys().copied().collect(),
        pages_redone,
        pages_undone,
        entries_processed: analysis.entries_scanned,
        recovered_lsn: wal.next_lsn().await.saturating_sub(1),
        next_txn_id: analysis.next_txn_id(),
    };
    info!(
        target: TARGET,
        "recovery done: {pages_redone} pages redone, {pages_undone} undone, log at LSN {}",
        report.recovered_lsn
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(fill: u8, lsn: Lsn) -> Bytes {
        let mut p = vec![fill; 512];
        stamp_page_lsn(&mut p, lsn);
        Bytes::from(p)
    }

    #[test]
    fn analysis_classifies() {
        let records = vec![
            WalRecord::begin(1, 1),
            WalRecord::write(2, 1, 0, page(0, 0), page(1, 2)),
            WalRecord::begin(3, 2),
            WalRecord::write(4, 2, 1, page(0, 0), page(2, 4)),
            WalRecord::write(5, 1, 0, page(1, 2), page(3, 5)),
            WalRecord::commit(6, 1),
            WalRecord::begin(7, 3),
            WalRecord::abort(8, 3),
        ];
        let a = analyze(&records, NULL_LSN);
        assert_eq!(a.winners.iter().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(a.losers.get(&2), Some(&3));
        assert!(!a.losers.contains_key(&3));
        assert!(a.aborted.contains(&3));
        assert_eq!(a.dirty_pages.get(&0), Some(&2));
        assert_eq!(a.dirty_pages.get(&1), Some(&4));
        assert_eq!(a.redo_start(), Some(2));
        assert_eq!(a.max_lsn, 8);
        assert_eq!(a.next_txn_id(), 4);
    }

    #[test]
    fn analysis_starts_at_checkpoint() {
        let records = vec![
            WalRecord::begin(1, 1),
            WalRecord::commit(2, 1),
            WalRecord::begin(3, 2),
            WalRecord::checkpoint(4, 3, 9),
        ];
        let a = analyze(&records, 3);
        assert!(a.winners.is_empty());
        assert_eq!(a.entries_scanned, 2);
        assert_eq!(a.next_txn_id(), 9);
    }

    #[tokio::test]
    async fn redo_replays_allocator_in_log_order() {
        let records = vec![
            WalRecord::begin(1, 1),
            WalRecord::allocate(2, 1, 0),
            WalRecord::write(3, 1, 0, page(0, 0), page(1, 3)),
            WalRecord::commit(4, 1),
            WalRecord::begin(5, 2),
            WalRecord::allocate(6, 2, 1),
            WalRecord::write(7, 2, 1, page(0, 0), page(2, 7)),
            WalRecord::compensation(8, 2, 1, 7, page(2, 7), page(0, 8)),
            WalRecord::abort(9, 2),
            WalRecord::begin(10, 3),
            WalRecord::allocate(11, 3, 1),
            WalRecord::write(12, 3, 1, page(0, 8), page(3, 12)),
            WalRecord::free(13, 3, 0),
            WalRecord::write(14, 3, 0, page(1, 3), page(4, 14)),
            WalRecord::commit(15, 3),
        ];
        let analysis = analyze(&records, NULL_LSN);
        let store = crate::storage::MemoryPageStore::new(512).unwrap();
        let redone = redo(&store, &records, &analysis, &CancellationToken::new()).await.unwrap();
        assert_eq!(redone, 5);
        assert_eq!(store.page_count(), 2);
        assert_eq!(store.free_count(), 1);
        assert!(store.read_page(0).await.unwrap_err().is_page_not_found());
        assert_eq!(store.read_page(1).await.unwrap(), page(3, 12).to_vec());
    }
}
