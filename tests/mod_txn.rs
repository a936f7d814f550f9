use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lodestone::storage::{page_lsn, MemoryPageStore, PageId, PageStore};
use lodestone::wal::RecordType;
use lodestone::{StorageError, WalPageStore};
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;

const PS: usize = 512;

async fn open_store() -> (TempDir, Arc<MemoryPageStore>, WalPageStore<MemoryPageStore>) {
    let dir = tempdir().unwrap();
    let inner = Arc::new(MemoryPageStore::new(PS).unwrap());
    let (store, report) = WalPageStore::open(Arc::clone(&inner), dir.path().join("s.wal"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_none());
    (dir, inner, store)
}

fn page(fill: u8) -> Vec<u8> {
    vec![fill; PS]
}

fn is_protocol(err: StorageError) -> bool {
    matches!(err, StorageError::ProtocolViolation(_))
}

#[tokio::test]
async fn mutations_need_a_transaction() {
    let (_dir, _inner, store) = open_store().await;
    assert!(is_protocol(store.allocate_page().await.unwrap_err()));
    store.begin_transaction().await.unwrap();
    let id = store.allocate_page().await.unwrap();
    store.commit().await.unwrap();
    assert!(is_protocol(store.write_page(id, &page(1)).await.unwrap_err()));
    assert!(is_protocol(store.free_page(id).await.unwrap_err()));
    assert!(is_protocol(store.commit().await.unwrap_err()));
    assert!(is_protocol(store.rollback().await.unwrap_err()));
    // reads are allowed outside transactions
    assert_eq!(store.read_page(id).await.unwrap(), page(0));
}

#[tokio::test]
async fn one_transaction_at_a_time() {
    let (_dir, _inner, store) = open_store().await;
    let first = store.begin_transaction().await.unwrap();
    assert!(is_protocol(store.begin_transaction().await.unwrap_err()));
    assert_eq!(store.current_transaction().await, Some(first));
    store.commit().await.unwrap();
    let second = store.begin_transaction().await.unwrap();
    assert!(second > first);
    store.rollback().await.unwrap();
}

#[tokio::test]
async fn commit_logs_and_stamps_pages() {
    let (_dir, inner, store) = open_store().await;
    let txn = store.begin_transaction().await.unwrap();
    let id = store.allocate_page().await.unwrap();
    store.write_page(id, &page(7)).await.unwrap();
    let commit_lsn = store.commit().await.unwrap();

    let records = store.wal().read_from(1).await.unwrap();
    let kinds: Vec<_> = records.iter().map(|r| r.record_type).collect();
    assert_eq!(kinds, vec![RecordType::Begin, RecordType::Allocate, RecordType::Write, RecordType::Commit]);
    assert!(records.iter().all(|r| r.txn_id == txn));
    assert_eq!(records[3].lsn, commit_lsn);

    let write = &records[2];
    assert_eq!(write.page_id, id);
    assert_eq!(write.before.as_ref(), &page(0)[..]);
    assert_eq!(page_lsn(&write.after), write.lsn);

    let stored = inner.read_page(id).await.unwrap();
    assert_eq!(page_lsn(&stored), write.lsn);
    assert_eq!(&stored[8..], &page(7)[8..]);
    assert_eq!(store.read_page(id).await.unwrap(), stored);
}

#[tokio::test]
async fn rollback_restores_and_releases() {
    let (_dir, inner, store) = open_store().await;
    store.begin_transaction().await.unwrap();
    let kept = store.allocate_page().await.unwrap();
    store.write_page(kept, &page(1)).await.unwrap();
    store.commit().await.unwrap();

    store.begin_transaction().await.unwrap();
    store.write_page(kept, &page(2)).await.unwrap();
    store.write_page(kept, &page(3)).await.unwrap();
    let scratch = store.allocate_page().await.unwrap();
    store.write_page(scratch, &page(4)).await.unwrap();
    assert_eq!(store.rollback().await.unwrap(), 2);

    assert_eq!(&store.read_page(kept).await.unwrap()[8..], &page(1)[8..]);
    assert!(inner.read_page(scratch).await.unwrap_err().is_page_not_found());
    assert_eq!(inner.free_count(), 1);

    let records = store.wal().read_from(1).await.unwrap();
    let tail: Vec<_> = records.iter().rev().take(3).map(|r| (r.record_type, r.page_id)).collect();
    assert_eq!(
        tail,
        vec![(RecordType::Abort, u64::MAX), (RecordType::Compensation, kept), (RecordType::Compensation, scratch)]
    );
    let clr = &records[records.len() - 2];
    assert_eq!(page_lsn(&inner.read_page(kept).await.unwrap()), clr.lsn);
}

#[tokio::test]
async fn frees_are_deferred_to_commit() {
    let (_dir, inner, store) = open_store().await;
    store.begin_transaction().await.unwrap();
    let a = store.allocate_page().await.unwrap();
    let b = store.allocate_page().await.unwrap();
    store.commit().await.unwrap();

    store.begin_transaction().await.unwrap();
    store.free_page(a).await.unwrap();
    assert!(store.free_page(a).await.unwrap_err().is_page_not_found());
    assert!(store.read_page(a).await.is_ok());
    store.rollback().await.unwrap();
    assert!(inner.read_page(a).await.is_ok());

    store.begin_transaction().await.unwrap();
    store.free_page(b).await.unwrap();
    store.commit().await.unwrap();
    assert!(inner.read_page(b).await.unwrap_err().is_page_not_found());
}

#[tokio::test]
async fn closed_store_rejects_everything() {
    let (_dir, inner, store) = open_store().await;
    store.begin_transaction().await.unwrap();
    let id = store.allocate_page().await.unwrap();
    store.write_page(id, &page(5)).await.unwrap();
    store.close().await.unwrap();
    // close rolled the transaction back
    assert!(inner.read_page(id).await.unwrap_err().is_page_not_found());
    assert!(is_protocol(store.begin_transaction().await.unwrap_err()));
    assert!(is_protocol(store.read_page(0).await.unwrap_err()));
    assert!(is_protocol(store.flush().await.unwrap_err()));
    store.close().await.unwrap();
}

#[tokio::test]
async fn dropped_store_rolls_back_in_background() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("d.wal");
    let inner = Arc::new(MemoryPageStore::new(PS).unwrap());
    {
        let (store, _) = WalPageStore::open(Arc::clone(&inner), &wal_path, &CancellationToken::new()).await.unwrap();
        store.begin_transaction().await.unwrap();
        store.allocate_page().await.unwrap();
    }
    for _ in 0..200 {
        if inner.free_count() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert_eq!(inner.free_count(), 1);
}

/// Memory store whose writes and frees can be switched to fail.
#[derive(Debug)]
struct Flaky {
    pages: MemoryPageStore,
    fail_writes: AtomicBool,
    fail_frees: AtomicBool,
}

impl Flaky {
    fn new() -> Self {
        Self { pages: MemoryPageStore::new(PS).unwrap(), fail_writes: AtomicBool::new(false), fail_frees: AtomicBool::new(false) }
    }
}

fn injected() -> StorageError {
    StorageError::Io(std::io::Error::other("injected failure"))
}

#[async_trait]
impl PageStore for Flaky {
    fn page_size(&self) -> usize {
        self.pages.page_size()
    }

    fn page_count(&self) -> u64 {
        self.pages.page_count()
    }

    async fn read_page(&self, id: PageId) -> lodestone::Result<Vec<u8>> {
        self.pages.read_page(id).await
    }

    async fn write_page(&self, id: PageId, data: &[u8]) -> lodestone::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.pages.write_page(id, data).await
    }

    async fn allocate_page(&self) -> lodestone::Result<PageId> {
        self.pages.allocate_page().await
    }

    async fn free_page(&self, id: PageId) -> lodestone::Result<()> {
        if self.fail_frees.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.pages.free_page(id).await
    }

    async fn flush(&self) -> lodestone::Result<()> {
        self.pages.flush().await
    }
}

async fn open_flaky() -> (TempDir, Arc<Flaky>, WalPageStore<Flaky>) {
    let dir = tempdir().unwrap();
    let inner = Arc::new(Flaky::new());
    let (store, _) =
        WalPageStore::open(Arc::clone(&inner), dir.path().join("f.wal"), &CancellationToken::new()).await.unwrap();
    (dir, inner, store)
}

#[tokio::test]
async fn commit_is_logged_before_frees_apply() {
    let (_dir, inner, store) = open_flaky().await;
    store.begin_transaction().await.unwrap();
    let id = store.allocate_page().await.unwrap();
    store.write_page(id, &page(1)).await.unwrap();
    store.commit().await.unwrap();

    let txn = store.begin_transaction().await.unwrap();
    store.free_page(id).await.unwrap();
    inner.fail_frees.store(true, Ordering::SeqCst);
    assert!(matches!(store.commit().await, Err(StorageError::Io(_))));

    let last = store.wal().read_from(0).await.unwrap().pop().unwrap();
    assert_eq!((last.record_type, last.txn_id), (RecordType::Commit, txn));
    assert!(store.current_transaction().await.is_none());
    assert!(!store.transactions().is_active(txn));
}

#[tokio::test]
async fn failed_inner_write_still_reads_the_logged_image() {
    let (_dir, inner, store) = open_flaky().await;
    store.begin_transaction().await.unwrap();
    let id = store.allocate_page().await.unwrap();
    store.commit().await.unwrap();

    store.begin_transaction().await.unwrap();
    store.write_page(id, &page(1)).await.unwrap();
    inner.fail_writes.store(true, Ordering::SeqCst);
    assert!(store.write_page(id, &page(2)).await.is_err());

    let logged = store.wal().read_from(0).await.unwrap().pop().unwrap();
    assert_eq!(logged.record_type, RecordType::Write);
    let seen = store.read_page(id).await.unwrap();
    assert_eq!(seen, logged.after.to_vec());
    assert_eq!(&seen[8..], &page(2)[8..]);

    inner.fail_writes.store(false, Ordering::SeqCst);
    assert_eq!(store.rollback().await.unwrap(), 1);
    assert_eq!(&store.read_page(id).await.unwrap()[8..], &page(0)[8..]);
}

#[tokio::test]
async fn close_rolls_back_transactions_begun_on_the_manager() {
    let (_dir, inner, store) = open_store().await;
    store.begin_transaction().await.unwrap();
    let id = store.allocate_page().await.unwrap();
    store.write_page(id, &page(6)).await.unwrap();
    store.commit().await.unwrap();

    let undo: Arc<dyn PageStore> = inner.clone();
    let ctx = store.transactions().begin(Some(Arc::clone(&undo))).await.unwrap();
    let before = inner.read_page(id).await.unwrap();
    ctx.track_write(id, before.clone().into(), store.wal().last_lsn().await.unwrap()).unwrap();
    inner.write_page(id, &page(9)).await.unwrap();

    store.close().await.unwrap();
    assert_eq!(store.transactions().active_count(), 0);
    assert_eq!(&inner.read_page(id).await.unwrap()[8..], &before[8..]);
    let last = store.wal().read_from(0).await.unwrap().pop().unwrap();
    assert_eq!((last.record_type, last.txn_id), (RecordType::Abort, ctx.id()));
}
