//! Append-only log file with an LSN -> offset index.
//!
//! ```text
//! 0..4    magic "LSWL"
//! 4..8    version (u32)
//! 8..16   last checkpoint LSN
//! 16..24  next LSN
//! 24..    records
//! ```

use std::collections::BTreeMap;
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use super::record::{Lsn, WalRecord, NULL_LSN};
use crate::errors::{Result, StorageError};
use crate::storage::header::{read_u32, read_u64};

pub const WAL_MAGIC: [u8; 4] = *b"LSWL";
pub const WAL_VERSION: u32 = 1;
pub const WAL_HEADER_SIZE: usize = 24;

const OFF_WAL_MAGIC: usize = 0;
const OFF_WAL_VERSION: usize = 4;
const OFF_WAL_CHECKPOINT: usize = 8;
const OFF_WAL_NEXT_LSN: usize = 16;

fn encode_header(checkpoint_lsn: Lsn, next_lsn: Lsn) -> [u8; WAL_HEADER_SIZE] {
    let mut buf = [0u8; WAL_HEADER_SIZE];
    buf[OFF_WAL_MAGIC..OFF_WAL_MAGIC + 4].copy_from_slice(&WAL_MAGIC);
    buf[OFF_WAL_VERSION..OFF_WAL_VERSION + 4].copy_from_slice(&WAL_VERSION.to_le_bytes());
    buf[OFF_WAL_CHECKPOINT..OFF_WAL_CHECKPOINT + 8].copy_from_slice(&checkpoint_lsn.to_le_bytes());
    buf[OFF_WAL_NEXT_LSN..OFF_WAL_NEXT_LSN + 8].copy_from_slice(&next_lsn.to_le_bytes());
    buf
}

/// Decoded records plus the offset just past the last valid one.
struct Scan {
    records: Vec<(u64, WalRecord)>,
    end: u64,
}

/// Walks `bytes` (which begin at file offset `base`) until the first torn record.
fn scan(bytes: &[u8], base: u64) -> Result<Scan> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    let mut last = NULL_LSN;
    while pos < bytes.len() {
        let Some(record) = WalRecord::decode(&bytes[pos..])? else {
            break;
        };
        if record.lsn <= last {
            break;
        }
        last = record.lsn;
        let len = record.encoded_len();
        records.push((base + pos as u64, record));
        pos += len;
    }
    Ok(Scan { records, end: base + pos as u64 })
}

struct WalState {
    file: File,
    index: BTreeMap<Lsn, u64>,
    end: u64,
    next_lsn: Lsn,
    checkpoint_lsn: Lsn,
    appended_since_checkpoint: u64,
}

pub struct WalFile {
    path: PathBuf,
    state: Mutex<WalState>,
}

impl WalFile {
    /// Opens or creates a log, rebuilding the index and cutting off a torn tail.
    ///
    /// # Errors
    /// `InvalidFormat` for a bad magic, version or a header shorter than 24 bytes.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path).await?;
        let len = file.metadata().await?.len();
        if len == 0 {
            file.write_all(&encode_header(NULL_LSN, 1)).await?;
            file.sync_data().await?;
            info!("created WAL {}", path.display());
            return Ok(Self {
                path,
                state: Mutex::new(WalState {
                    file,
                    index: BTreeMap::new(),
                    end: WAL_HEADER_SIZE as u64,
                    next_lsn: 1,
                    checkpoint_lsn: NULL_LSN,
                    appended_since_checkpoint: 0,
                }),
            });
        }

        let mut bytes = Vec::with_capacity(len as usize);
        file.seek(SeekFrom::Start(0)).await?;
        file.read_to_end(&mut bytes).await?;
        if bytes.len() < WAL_HEADER_SIZE {
            return Err(StorageError::format(format!("truncated WAL header: {} bytes", bytes.len())));
        }
        if bytes[OFF_WAL_MAGIC..OFF_WAL_MAGIC + 4] != WAL_MAGIC {
            return Err(StorageError::format(format!("{} is not a WAL file", path.display())));
        }
        let version = read_u32(&bytes, OFF_WAL_VERSION);
        if version != WAL_VERSION {
            return Err(StorageError::format(format!("unsupported WAL version {version}")));
        }
        let checkpoint_lsn = read_u64(&bytes, OFF_WAL_CHECKPOINT);
        let header_next = read_u64(&bytes, OFF_WAL_NEXT_LSN);

        let Scan { records, end } = scan(&bytes[WAL_HEADER_SIZE..], WAL_HEADER_SIZE as u64)?;
        if end < len {
            warn!("WAL {}: dropping {} torn tail bytes at offset {end}", path.display(), len - end);
            file.set_len(end).await?;
        }
        let last = records.last().map_or(NULL_LSN, |(_, r)| r.lsn);
        let next_lsn = header_next.max(last + 1).max(1);
        let appended_since_checkpoint = records.iter().filter(|(_, r)| r.lsn > checkpoint_lsn).count() as u64;
        let index = records.into_iter().map(|(off, r)| (r.lsn, off)).collect::<BTreeMap<_, _>>();
        info!(
            "opened WAL {}: {} records, next LSN {next_lsn}, checkpoint LSN {checkpoint_lsn}",
            path.display(),
            index.len()
        );
        Ok(Self {
            path,
            state: Mutex::new(WalState { file, index, end, next_lsn, checkpoint_lsn, appended_since_checkpoint }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Assigns the next LSN, lets `build` produce the record for it and appends it.
    ///
    /// The append lock is held for the whole call, so LSN order equals file order.
    ///
    /// # Errors
    /// `ProtocolViolation` when `build` returns a record with a different LSN; `Io` on write
    /// failure, in which case the LSN is not consumed.
    pub async fn append_with<F>(&self, build: F) -> Result<Lsn>
    where
        F: FnOnce(Lsn) -> WalRecord + Send,
    {
        let mut state = self.state.lock().await;
        let lsn = state.next_lsn;
        let record = build(lsn);
        if record.lsn != lsn {
            return Err(StorageError::protocol(format!("record built with LSN {} for slot {lsn}", record.lsn)));
        }
        let bytes = record.encode()?;
        let offset = state.end;
        state.file.seek(SeekFrom::Start(offset)).await?;
        state.file.write_all(&bytes).await?;
        state.file.flush().await?;
        state.index.insert(lsn, offset);
        state.end = offset + bytes.len() as u64;
        state.next_lsn = lsn + 1;
        state.appended_since_checkpoint += 1;
        debug!("WAL append {} lsn={lsn} txn={} page={}", record.record_type, record.txn_id, record.page_id);
        Ok(lsn)
    }

    /// Rewrites the header and syncs the log to stable storage.
    ///
    /// # Errors
    /// `Io` on failure.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let header = encode_header(state.checkpoint_lsn, state.next_lsn);
        state.file.seek(SeekFrom::Start(0)).await?;
        state.file.write_all(&header).await?;
        state.file.flush().await?;
        state.file.sync_data().await?;
        Ok(())
    }

    /// Every record with LSN `>= start`, in order. Reading stops silently at a torn record.
    ///
    /// # Errors
    /// `Io` on read failure; `InvalidFormat` for a checksummed record of unknown type.
    pub async fn read_from(&self, start: Lsn) -> Result<Vec<WalRecord>> {
        let mut state = self.state.lock().await;
        let offset = state
            .index
            .range(..=start)
            .next_back()
            .map_or(WAL_HEADER_SIZE as u64, |(_, off)| *off);
        let len = usize::try_from(state.end.saturating_sub(offset))
            .map_err(|_| StorageError::Corrupt("WAL larger than address space".into()))?;
        let mut bytes = vec![0u8; len];
        state.file.seek(SeekFrom::Start(offset)).await?;
        state.file.read_exact(&mut bytes).await?;
        drop(state);
        let Scan { records, .. } = scan(&bytes, offset)?;
        Ok(records.into_iter().map(|(_, r)| r).filter(|r| r.lsn >= start).collect())
    }

    /// Drops every record with LSN `< lsn` and records `lsn` as the checkpoint LSN.
    ///
    /// The surviving suffix is written to a temporary file that replaces the log atomically.
    /// Returns the number of records removed.
    ///
    /// # Errors
    /// `Io` on failure; the original log is untouched in that case.
    pub async fn truncate_before(&self, lsn: Lsn) -> Result<usize> {
        let mut state = self.state.lock().await;
        let cut = state.index.range(lsn..).next().map_or(state.end, |(_, off)| *off);
        let kept_len = usize::try_from(state.end - cut)
            .map_err(|_| StorageError::Corrupt("WAL larger than address space".into()))?;
        let mut kept = vec![0u8; kept_len];
        state.file.seek(SeekFrom::Start(cut)).await?;
        state.file.read_exact(&mut kept).await?;

        let checkpoint_lsn = lsn.min(state.next_lsn).max(state.checkpoint_lsn);
        let header = encode_header(checkpoint_lsn, state.next_lsn);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
            tmp.write_all(&header)?;
            tmp.write_all(&kept)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;

        state.file = OpenOptions::new().read(true).write(true).open(&self.path).await?;
        let removed = state.index.range(..lsn).count();
        let shift = cut - WAL_HEADER_SIZE as u64;
        state.index = state.index.split_off(&lsn).into_iter().map(|(l, off)| (l, off - shift)).collect();
        state.end -= shift;
        state.checkpoint_lsn = checkpoint_lsn;
        state.appended_since_checkpoint = 0;
        info!("WAL {} truncated before LSN {lsn}: {removed} records removed", self.path.display());
        Ok(removed)
    }

    pub async fn first_lsn(&self) -> Option<Lsn> {
        self.state.lock().await.index.keys().next().copied()
    }

    pub async fn last_lsn(&self) -> Option<Lsn> {
        self.state.lock().await.index.keys().next_back().copied()
    }

    /// LSN the next append will receive.
    pub async fn next_lsn(&self) -> Lsn {
        self.state.lock().await.next_lsn
    }

    pub async fn checkpoint_lsn(&self) -> Lsn {
        self.state.lock().await.checkpoint_lsn
    }

    /// Bytes of header plus valid records.
    pub async fn size_bytes(&self) -> u64 {
        self.state.lock().await.end
    }

    pub async fn appended_since_checkpoint(&self) -> u64 {
        self.state.lock().await.appended_since_checkpoint
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.index.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.index.is_empty()
    }
}

impl std::fmt::Debug for WalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalFile").field("path", &self.path).finish_non_exhaustive()
    }
}
