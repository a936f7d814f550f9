//! Write-ahead log: CRC-checked records addressed by LSN.

pub mod file;
pub mod record;

pub use file::{WalFile, WAL_HEADER_SIZE};
pub use record::{Lsn, RecordType, TxnId, WalRecord, NULL_LSN};
