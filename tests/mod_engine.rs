use std::path::Path;

use lodestone::config::CheckpointConfig;
use lodestone::{BackendKind, Engine, EngineConfig, PageStore, StorageError};
use tempfile::tempdir;

fn config(dir: &Path, backend: BackendKind) -> EngineConfig {
    EngineConfig {
        backend,
        page_size: 1024,
        checkpoint: CheckpointConfig { interval_ms: 50, poll_interval_ms: 10, ..CheckpointConfig::default() },
        ..EngineConfig::for_path(dir.join("engine.db"))
    }
}

async fn fill(engine: &Engine, range: std::ops::Range<u64>) {
    let mut index = engine.open_index::<u64, u64>().await.unwrap();
    engine.begin().await.unwrap();
    for k in range {
        index.insert(k, k + 1).await.unwrap();
    }
    engine.commit().await.unwrap();
}

async fn contents(engine: &Engine) -> Vec<(u64, u64)> {
    let index = engine.open_index::<u64, u64>().await.unwrap();
    index.in_order().collect_all().await.unwrap()
}

#[tokio::test]
async fn persistent_backends_reopen() {
    for backend in [BackendKind::File, BackendKind::Mmap] {
        let dir = tempdir().unwrap();
        let engine = Engine::open(config(dir.path(), backend)).await.unwrap();
        assert!(engine.recovery_report().is_none());
        fill(&engine, 0..400).await;
        engine.checkpoint().await.unwrap();
        fill(&engine, 400..600).await;
        engine.close().await.unwrap();

        let engine = Engine::open(config(dir.path(), backend)).await.unwrap();
        assert!(engine.recovery_report().unwrap().losers.is_empty());
        let entries = contents(&engine).await;
        assert_eq!(entries.len(), 600, "{backend:?}");
        assert_eq!(entries[599], (599, 600));
        engine.close().await.unwrap();
    }
}

#[tokio::test]
async fn memory_backend_round_trip() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path(), BackendKind::Memory)).await.unwrap();
    fill(&engine, 0..100).await;
    let index = engine.open_index::<u64, u64>().await.unwrap();
    assert_eq!(index.try_get(&42).await.unwrap(), Some(43));
    assert_eq!(index.len().await.unwrap(), 100);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn memory_backend_reopens_empty() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path(), BackendKind::Memory);
    cfg.checkpoint.enabled = false;
    let engine = Engine::open(cfg.clone()).await.unwrap();
    fill(&engine, 0..400).await;
    engine.checkpoint().await.unwrap();
    fill(&engine, 400..410).await;
    engine.close().await.unwrap();

    let engine = Engine::open(cfg).await.unwrap();
    assert!(engine.recovery_report().is_none());
    assert_eq!(engine.store().page_count(), 0);
    assert!(contents(&engine).await.is_empty());
    fill(&engine, 0..3).await;
    assert_eq!(contents(&engine).await.len(), 3);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn rollback_discards_index_changes() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path(), BackendKind::File)).await.unwrap();
    fill(&engine, 0..10).await;
    let mut index = engine.open_index::<u64, u64>().await.unwrap();
    engine.begin().await.unwrap();
    for k in 10..300 {
        index.insert(k, 0).await.unwrap();
    }
    index.delete(&3).await.unwrap();
    assert!(engine.rollback().await.unwrap() > 0);
    assert_eq!(contents(&engine).await, (0..10).map(|k| (k, k + 1)).collect::<Vec<_>>());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn second_index_by_meta_page() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path(), BackendKind::File)).await.unwrap();
    fill(&engine, 0..5).await;
    let meta = {
        let mut names = engine.create_index::<u32, [u8; 8]>().await.unwrap();
        engine.begin().await.unwrap();
        names.insert(7, *b"seventh!").await.unwrap();
        engine.commit().await.unwrap();
        names.meta_page()
    };
    assert_ne!(meta, 0);
    engine.close().await.unwrap();

    let engine = Engine::open(config(dir.path(), BackendKind::File)).await.unwrap();
    let names = engine.open_index_at::<u32, [u8; 8]>(meta).await.unwrap();
    assert_eq!(names.try_get(&7).await.unwrap(), Some(*b"seventh!"));
    assert!(matches!(engine.open_index_at::<u64, u64>(meta).await, Err(StorageError::InvalidFormat(_))));
    engine.close().await.unwrap();
}

#[tokio::test]
async fn transaction_protocol_is_enforced() {
    let dir = tempdir().unwrap();
    let engine = Engine::open(config(dir.path(), BackendKind::File)).await.unwrap();
    assert!(matches!(engine.commit().await, Err(StorageError::ProtocolViolation(_))));
    fill(&engine, 0..0).await;
    engine.begin().await.unwrap();
    assert!(matches!(engine.begin().await, Err(StorageError::ProtocolViolation(_))));
    let mut index = engine.open_index::<u64, u64>().await.unwrap();
    index.insert(1, 1).await.unwrap();
    // close rolls the open transaction back
    engine.close().await.unwrap();

    let engine = Engine::open(config(dir.path(), BackendKind::File)).await.unwrap();
    assert!(contents(&engine).await.is_empty());
    engine.close().await.unwrap();
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path(), BackendKind::File);
    cfg.page_size = 1000;
    assert!(matches!(Engine::open(cfg).await, Err(StorageError::Config(_))));
}
