use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lodestone::storage::{FilePageStore, MemoryPageStore, PageStore};
use lodestone::wal::RecordType;
use lodestone::{checkpoint_once, BPlusTree, CheckpointOptions, CheckpointService, StorageError, WalPageStore};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const PS: usize = 512;

fn page(fill: u8) -> Vec<u8> {
    vec![fill; PS]
}

async fn memory_store(dir: &Path) -> WalPageStore<MemoryPageStore> {
    let inner = Arc::new(MemoryPageStore::new(PS).unwrap());
    WalPageStore::open(inner, dir.join("m.wal"), &CancellationToken::new()).await.unwrap().0
}

async fn file_store(dir: &Path) -> WalPageStore<FilePageStore> {
    let inner = Arc::new(FilePageStore::open(dir.join("data.db"), PS, 8).await.unwrap());
    WalPageStore::open(inner, dir.join("data.wal"), &CancellationToken::new()).await.unwrap().0
}

async fn committed_page(store: &WalPageStore<impl PageStore + 'static>, fill: u8) -> u64 {
    store.begin_transaction().await.unwrap();
    let id = store.allocate_page().await.unwrap();
    store.write_page(id, &page(fill)).await.unwrap();
    store.commit().await.unwrap();
    id
}

#[tokio::test]
async fn empty_log_is_a_no_op() {
    let dir = tempdir().unwrap();
    let store = memory_store(dir.path()).await;
    let stats = checkpoint_once(&store, &CancellationToken::new()).await.unwrap();
    assert_eq!(stats.checkpoint_lsn, 0);
    assert!(store.wal().is_empty().await);
}

#[tokio::test]
async fn idle_checkpoint_cuts_at_last_lsn() {
    let dir = tempdir().unwrap();
    let store = memory_store(dir.path()).await;
    committed_page(&store, 1).await;
    committed_page(&store, 2).await;
    let last = store.wal().last_lsn().await.unwrap();

    let stats = checkpoint_once(&store, &CancellationToken::new()).await.unwrap();
    assert_eq!(stats.safe_lsn, last);
    assert_eq!(stats.committed_txns, 2);
    assert_eq!(stats.checkpoint_lsn, last + 1);
    assert!(stats.records_truncated > 0);
    assert_eq!(store.wal().first_lsn().await, Some(last));
    assert_eq!(store.wal().checkpoint_lsn().await, last);

    let records = store.wal().read_from(0).await.unwrap();
    let cp = records.last().unwrap();
    assert_eq!(cp.record_type, RecordType::Checkpoint);
    assert_eq!(cp.ref_lsn, last);
}

#[tokio::test]
async fn active_transaction_holds_the_cut() {
    let dir = tempdir().unwrap();
    let store = memory_store(dir.path()).await;
    let kept = committed_page(&store, 1).await;
    store.begin_transaction().await.unwrap();
    let begin = store.wal().last_lsn().await.unwrap();
    store.write_page(kept, &page(9)).await.unwrap();

    let stats = checkpoint_once(&store, &CancellationToken::new()).await.unwrap();
    assert_eq!(stats.safe_lsn, begin);
    assert_eq!(store.wal().first_lsn().await, Some(begin));

    // the open transaction can still roll back from what is left of the log
    assert_eq!(store.rollback().await.unwrap(), 1);
    assert_eq!(&store.read_page(kept).await.unwrap()[8..], &page(1)[8..]);
}

#[tokio::test]
async fn cancelled_checkpoint_leaves_the_log_alone() {
    let dir = tempdir().unwrap();
    let store = memory_store(dir.path()).await;
    committed_page(&store, 3).await;
    let before = store.wal().len().await;
    let token = CancellationToken::new();
    token.cancel();
    assert!(matches!(checkpoint_once(&store, &token).await, Err(StorageError::Cancelled)));
    assert_eq!(store.wal().len().await, before);
}

fn copy_files(from: &Path, to: &Path) {
    for name in ["data.db", "data.wal"] {
        std::fs::copy(from.join(name), to.join(name)).unwrap();
    }
}

async fn tree_contents(dir: &Path) -> Vec<(u64, u64)> {
    let store = Arc::new(file_store(dir).await);
    let tree: BPlusTree<_, u64, u64> = BPlusTree::open_at(Arc::clone(&store), 0).await.unwrap();
    let entries = tree.in_order().collect_all().await.unwrap();
    drop(tree);
    store.close().await.unwrap();
    entries
}

#[tokio::test]
async fn recovery_after_truncation_matches_full_log() {
    let live = tempdir().unwrap();
    let snapshot = tempdir().unwrap();
    {
        let store = Arc::new(file_store(live.path()).await);
        store.begin_transaction().await.unwrap();
        let mut tree: BPlusTree<_, u64, u64> = BPlusTree::create(Arc::clone(&store)).await.unwrap();
        for k in 0..300u64 {
            tree.insert(k, k * 10).await.unwrap();
        }
        store.commit().await.unwrap();
        store.begin_transaction().await.unwrap();
        for k in (0..300u64).step_by(3) {
            tree.delete(&k).await.unwrap();
        }
        store.commit().await.unwrap();

        copy_files(live.path(), snapshot.path());
        let stats = checkpoint_once(&store, &CancellationToken::new()).await.unwrap();
        assert!(stats.records_truncated > 0);

        store.begin_transaction().await.unwrap();
        for k in 1_000..1_200u64 {
            tree.insert(k, k).await.unwrap();
        }
        drop(tree);
        std::mem::forget(store);
    }
    let expected: Vec<(u64, u64)> = (0..300u64).filter(|k| k % 3 != 0).map(|k| (k, k * 10)).collect();
    assert_eq!(tree_contents(live.path()).await, expected);
    assert_eq!(tree_contents(snapshot.path()).await, expected);
}

#[tokio::test]
async fn service_checkpoints_on_schedule() {
    let dir = tempdir().unwrap();
    let store = Arc::new(memory_store(dir.path()).await);
    committed_page(&store, 5).await;
    let options = CheckpointOptions {
        interval: Duration::from_millis(20),
        poll_interval: Duration::from_millis(5),
        ..CheckpointOptions::default()
    };
    let service = CheckpointService::spawn(Arc::clone(&store), options);
    for _ in 0..200 {
        if store.wal().checkpoint_lsn().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.wal().checkpoint_lsn().await > 0);
    assert!(service.trigger().await.is_ok());
    let last = service.shutdown().await.unwrap();
    assert!(last.is_some());
}

#[tokio::test]
async fn service_fires_on_wal_growth() {
    let dir = tempdir().unwrap();
    let store = Arc::new(memory_store(dir.path()).await);
    let options = CheckpointOptions {
        interval: Duration::from_secs(3_600),
        poll_interval: Duration::from_millis(5),
        max_wal_entries: 4,
        checkpoint_on_shutdown: false,
        ..CheckpointOptions::default()
    };
    let service = CheckpointService::spawn(Arc::clone(&store), options);
    committed_page(&store, 1).await;
    for _ in 0..200 {
        if store.wal().checkpoint_lsn().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(store.wal().checkpoint_lsn().await > 0);
    assert!(service.shutdown().await.unwrap().is_none());
}
