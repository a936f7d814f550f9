//! B+Tree node page layout.
//!
//! ```text
//! 0..8    page LSN (owned by the WAL layer)
//! 8       node type (1 = leaf, 2 = internal)
//! 12..16  key count (u32)
//! 16..24  next sibling (leaf only, NO_PAGE otherwise)
//! 24..    keys[max_keys], then values[max_keys] (leaf) or children[max_keys + 1] (internal)
//! ```

use super::codec::{FixedKey, FixedValue};
use crate::errors::{Result, StorageError};
use crate::storage::header::{read_u32, read_u64};
use crate::storage::{PageId, NO_PAGE, PAGE_LSN_SIZE};

pub const OFF_NODE_TYPE: usize = PAGE_LSN_SIZE;
pub const OFF_KEY_COUNT: usize = 12;
pub const OFF_NEXT: usize = 16;
pub const NODE_HEADER_SIZE: usize = 24;
pub const CHILD_SIZE: usize = 8;

const LEAF: u8 = 1;
const INTERNAL: u8 = 2;

/// Smallest fan-out that still splits into two non-empty halves with a separator.
pub const MIN_FANOUT: usize = 3;

/// Offsets derived once per tree from page size and key/value widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub page_size: usize,
    pub key_width: usize,
    pub value_width: usize,
    /// Max keys in any node, leaf or internal.
    pub max_keys: usize,
}

impl NodeLayout {
    /// # Errors
    /// `Config` when the page cannot hold `MIN_FANOUT` entries.
    pub fn new(page_size: usize, key_width: usize, value_width: usize) -> Result<Self> {
        let body = page_size.saturating_sub(NODE_HEADER_SIZE);
        let leaf_max = body / (key_width + value_width).max(1);
        let internal_max = body.saturating_sub(CHILD_SIZE) / (key_width + CHILD_SIZE);
        let max_keys = leaf_max.min(internal_max);
        if max_keys < MIN_FANOUT {
            return Err(StorageError::Config(format!(
                "page size {page_size} too small for key width {key_width} and value width {value_width}"
            )));
        }
        Ok(Self { page_size, key_width, value_width, max_keys })
    }

    const fn keys_off(&self) -> usize { NODE_HEADER_SIZE }

    const fn tail_off(&self) -> usize { NODE_HEADER_SIZE + self.max_keys * self.key_width }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node<K, V> {
    Leaf { keys: Vec<K>, values: Vec<V>, next: PageId },
    Internal { keys: Vec<K>, children: Vec<PageId> },
}

impl<K: FixedKey, V: FixedValue> Node<K, V> {
    #[must_use]
    pub const fn empty_leaf() -> Self {
        Self::Leaf { keys: Vec::new(), values: Vec::new(), next: NO_PAGE }
    }

    #[must_use]
    pub fn keys(&self) -> &[K] {
        match self {
            Self::Leaf { keys, .. } | Self::Internal { keys, .. } => keys,
        }
    }

    /// Child slot to follow for `key`: the first `i` with `key < keys[i]`, equal keys go right.
    #[must_use]
    pub fn child_index(keys: &[K], key: &K) -> usize {
        keys.partition_point(|k| k <= key)
    }

    #[must_use]
    pub fn encode(&self, layout: &NodeLayout) -> Vec<u8> {
        let mut buf = vec![0u8; layout.page_size];
        let kw = layout.key_width;
        let keys = self.keys();
        buf[OFF_KEY_COUNT..OFF_KEY_COUNT + 4].copy_from_slice(&(keys.len() as u32).to_le_bytes());
        for (i, k) in keys.iter().enumerate() {
            let off = layout.keys_off() + i * kw;
            k.write_to(&mut buf[off..off + kw]);
        }
        let tail = layout.tail_off();
        match self {
            Self::Leaf { values, next, .. } => {
                buf[OFF_NODE_TYPE] = LEAF;
                buf[OFF_NEXT..OFF_NEXT + 8].copy_from_slice(&next.to_le_bytes());
                let vw = layout.value_width;
                for (i, v) in values.iter().enumerate() {
                    let off = tail + i * vw;
                    v.write_to(&mut buf[off..off + vw]);
                }
            }
            Self::Internal { children, .. } => {
                buf[OFF_NODE_TYPE] = INTERNAL;
                buf[OFF_NEXT..OFF_NEXT + 8].copy_from_slice(&NO_PAGE.to_le_bytes());
                for (i, c) in children.iter().enumerate() {
                    let off = tail + i * CHILD_SIZE;
                    buf[off..off + CHILD_SIZE].copy_from_slice(&c.to_le_bytes());
                }
            }
        }
        buf
    }

    /// # Errors
    /// `Corrupt` when the node type or key count is invalid for this layout.
    pub fn decode(page_id: PageId, buf: &[u8], layout: &NodeLayout) -> Result<Self> {
        if buf.len() != layout.page_size {
            return Err(StorageError::PageSizeMismatch { expected: layout.page_size, actual: buf.len() });
        }
        let count = read_u32(buf, OFF_KEY_COUNT) as usize;
        if count > layout.max_keys {
            return Err(StorageError::Corrupt(format!("page {page_id}: key count {count} exceeds {}", layout.max_keys)));
        }
        let kw = layout.key_width;
        let keys = (0..count)
            .map(|i| {
                let off = layout.keys_off() + i * kw;
                K::read_from(&buf[off..off + kw])
            })
            .collect();
        let tail = layout.tail_off();
        match buf[OFF_NODE_TYPE] {
            LEAF => {
                let vw = layout.value_width;
                let values = (0..count)
                    .map(|i| {
                        let off = tail + i * vw;
                        V::read_from(&buf[off..off + vw])
                    })
                    .collect();
                Ok(Self::Leaf { keys, values, next: read_u64(buf, OFF_NEXT) })
            }
            INTERNAL => {
                let children = (0..=count).map(|i| read_u64(buf, tail + i * CHILD_SIZE)).collect();
                Ok(Self::Internal { keys, children })
            }
            other => Err(StorageError::Corrupt(format!("page {page_id}: unknown node type {other}"))),
        }
    }
}
