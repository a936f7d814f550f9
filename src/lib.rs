//! Lodestone: an embedded page store with a persistent B+Tree index, a write-ahead log,
//! ARIES-style recovery and background checkpointing.
//!
//! ```no_run
//! # async fn demo() -> lodestone::Result<()> {
//! use lodestone::{Engine, EngineConfig};
//!
//! let engine = Engine::open(EngineConfig::for_path("data/idx.db")).await?;
//! let mut index = engine.open_index::<u64, u64>().await?;
//! engine.begin().await?;
//! index.insert(1, 100).await?;
//! engine.commit().await?;
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod checkpoint;
pub mod config;
pub mod durable;
pub mod engine;
pub mod errors;
pub mod logger;
pub mod recovery;
pub mod storage;
pub mod txn;
pub mod wal;

pub use btree::{BPlusTree, Cursor, FixedKey, FixedValue, FixedWidth};
pub use checkpoint::{checkpoint_once, CheckpointOptions, CheckpointService, CheckpointStats};
pub use config::{BackendKind, EngineConfig};
pub use durable::WalPageStore;
pub use engine::{Engine, EngineStore, Index};
pub use errors::{Result, StorageError};
pub use recovery::{Analysis, RecoveryReport};
pub use storage::{
    Backend, FilePageStore, MemoryPageStore, MmapPageStore, PageId, PageRef, PageStore, ZeroCopyPages, NO_PAGE,
};
pub use txn::{TransactionContext, TransactionManager};
pub use wal::{Lsn, RecordType, TxnId, WalFile, WalRecord};
