//! Persistent B+Tree index built only on `PageStore` operations.
//!
//! The first page an index allocates holds its metadata:
//!
//! ```text
//! 0..8    page LSN
//! 8..12   magic "LSBT"
//! 12..16  key width (u32)
//! 16..20  value width (u32)
//! 24..32  root page id (u64)
//! ```

pub mod codec;
pub mod cursor;
pub mod node;

use std::marker::PhantomData;
use std::sync::Arc;

use log::{debug, info};

use crate::errors::{Result, StorageError};
use crate::storage::header::{read_u32, read_u64};
use crate::storage::{PageId, PageStore};

pub use codec::{FixedKey, FixedValue, FixedWidth};
pub use cursor::Cursor;
pub use node::{Node, NodeLayout};

pub const TREE_MAGIC: [u8; 4] = *b"LSBT";

const OFF_META_MAGIC: usize = 8;
const OFF_META_KEY_WIDTH: usize = 12;
const OFF_META_VALUE_WIDTH: usize = 16;
const OFF_META_ROOT: usize = 24;

/// Ordered unique-key index. Mutations take `&mut self`; one writer per tree.
pub struct BPlusTree<S, K, V> {
    store: Arc<S>,
    layout: NodeLayout,
    meta_page: PageId,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<S: PageStore, K: FixedKey, V: FixedValue> BPlusTree<S, K, V> {
    /// Creates a new index when the store is empty, otherwise loads the index whose metadata
    /// lives on page 0.
    ///
    /// # Errors
    /// `InvalidFormat` when page 0 is not a tree metadata page for these key/value widths.
    pub async fn open(store: Arc<S>) -> Result<Self> {
        if store.page_count() == 0 {
            Self::create(store).await
        } else {
            Self::open_at(store, 0).await
        }
    }

    /// Allocates a metadata page and an empty root leaf.
    ///
    /// # Errors
    /// `Config` when the page size cannot hold three entries; store errors otherwise.
    pub async fn create(store: Arc<S>) -> Result<Self> {
        let layout = NodeLayout::new(store.page_size(), K::WIDTH, V::WIDTH)?;
        let meta_page = store.allocate_page().await?;
        let root = store.allocate_page().await?;
        let tree = Self { store, layout, meta_page, _marker: PhantomData };
        tree.write_node(root, &Node::empty_leaf()).await?;
        tree.write_root(root).await?;
        info!("created index: meta page {meta_page}, root {root}, fan-out {}", layout.max_keys);
        Ok(tree)
    }

    /// # Errors
    /// `InvalidFormat` on a magic or width mismatch.
    pub async fn open_at(store: Arc<S>, meta_page: PageId) -> Result<Self> {
        let layout = NodeLayout::new(store.page_size(), K::WIDTH, V::WIDTH)?;
        let meta = store.read_page(meta_page).await?;
        if meta[OFF_META_MAGIC..OFF_META_MAGIC + 4] != TREE_MAGIC {
            return Err(StorageError::format(format!("page {meta_page} is not an index metadata page")));
        }
        let key_width = read_u32(&meta, OFF_META_KEY_WIDTH) as usize;
        let value_width = read_u32(&meta, OFF_META_VALUE_WIDTH) as usize;
        if key_width != K::WIDTH || value_width != V::WIDTH {
            return Err(StorageError::format(format!(
                "index widths {key_width}/{value_width} do not match requested {}/{}",
                K::WIDTH,
                V::WIDTH
            )));
        }
        debug!("opened index at meta page {meta_page}, root {}", read_u64(&meta, OFF_META_ROOT));
        Ok(Self { store, layout, meta_page, _marker: PhantomData })
    }

    #[must_use]
    pub const fn meta_page(&self) -> PageId {
        self.meta_page
    }

    #[must_use]
    pub const fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The root is read from the metadata page on every operation so a rolled back root split
    /// is never observed.
    async fn root(&self) -> Result<PageId> {
        let meta = self.store.read_page(self.meta_page).await?;
        Ok(read_u64(&meta, OFF_META_ROOT))
    }

    async fn write_root(&self, root: PageId) -> Result<()> {
        let mut meta = vec![0u8; self.layout.page_size];
        meta[OFF_META_MAGIC..OFF_META_MAGIC + 4].copy_from_slice(&TREE_MAGIC);
        meta[OFF_META_KEY_WIDTH..OFF_META_KEY_WIDTH + 4].copy_from_slice(&(K::WIDTH as u32).to_le_bytes());
        meta[OFF_META_VALUE_WIDTH..OFF_META_VALUE_WIDTH + 4].copy_from_slice(&(V::WIDTH as u32).to_le_bytes());
        meta[OFF_META_ROOT..OFF_META_ROOT + 8].copy_from_slice(&root.to_le_bytes());
        self.store.write_page(self.meta_page, &meta).await
    }

    pub(crate) async fn load(&self, page: PageId) -> Result<Node<K, V>> {
        let buf = self.store.read_page(page).await?;
        Node::decode(page, &buf, &self.layout)
    }

    async fn write_node(&self, page: PageId, node: &Node<K, V>) -> Result<()> {
        self.store.write_page(page, &node.encode(&self.layout)).await
    }

    /// Walks to the leaf responsible for `key`, or the leftmost leaf when `key` is `None`.
    pub(crate) async fn descend(&self, key: Option<&K>) -> Result<Node<K, V>> {
        let mut page = self.root().await?;
        loop {
            match self.load(page).await? {
                Node::Internal { keys, children } => {
                    let idx = key.map_or(0, |k| Node::<K, V>::child_index(&keys, k));
                    page = children[idx];
                }
                leaf @ Node::Leaf { .. } => return Ok(leaf),
            }
        }
    }

    /// # Errors
    /// Store or decode errors.
    pub async fn try_get(&self, key: &K) -> Result<Option<V>> {
        match self.descend(Some(key)).await? {
            Node::Leaf { keys, values, .. } => Ok(keys.binary_search(key).ok().map(|i| values[i])),
            Node::Internal { .. } => Ok(None),
        }
    }

    /// # Errors
    /// Store or decode errors.
    pub async fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.try_get(key).await?.is_some())
    }

    /// Inserts or overwrites `key`.
    ///
    /// A full leaf splits at its midpoint and the right half's first key goes up to the parent
    /// recorded during descent; full internal nodes split the same way, promoting their middle
    /// key. Only a root split adds a level.
    ///
    /// # Errors
    /// Store or decode errors.
    pub async fn insert(&mut self, key: K, value: V) -> Result<()> {
        let mut path: Vec<(PageId, usize)> = Vec::new();
        let mut page = self.root().await?;
        let (mut keys, mut values, next) = loop {
            match self.load(page).await? {
                Node::Internal { keys, children } => {
                    let idx = Node::<K, V>::child_index(&keys, &key);
                    path.push((page, idx));
                    page = children[idx];
                }
                Node::Leaf { keys, values, next } => break (keys, values, next),
            }
        };

        match keys.binary_search(&key) {
            Ok(i) => {
                values[i] = value;
                return self.write_node(page, &Node::Leaf { keys, values, next }).await;
            }
            Err(i) => {
                keys.insert(i, key);
                values.insert(i, value);
            }
        }
        if keys.len() < self.layout.max_keys {
            return self.write_node(page, &Node::Leaf { keys, values, next }).await;
        }

        let mid = keys.len() / 2;
        let right_keys = keys.split_off(mid);
        let right_values = values.split_off(mid);
        let separator = right_keys[0];
        let right = self.store.allocate_page().await?;
        self.write_node(right, &Node::Leaf { keys: right_keys, values: right_values, next }).await?;
        self.write_node(page, &Node::Leaf { keys, values, next: right }).await?;
        debug!("split leaf {page} into {page}/{right} at {separator:?}");
        self.propagate_split(path, page, separator, right).await
    }

    async fn propagate_split(
        &mut self,
        mut path: Vec<(PageId, usize)>,
        mut left: PageId,
        mut separator: K,
        mut right: PageId,
    ) -> Result<()> {
        while let Some((parent, idx)) = path.pop() {
            let Node::Internal { mut keys, mut children } = self.load(parent).await? else {
                return Err(StorageError::Corrupt(format!("page {parent} on the descent path is not internal")));
            };
            keys.insert(idx, separator);
            children.insert(idx + 1, right);
            if keys.len() < self.layout.max_keys {
                return self.write_node(parent, &Node::Internal { keys, children }).await;
            }

            let mid = keys.len() / 2;
            let mut right_keys = keys.split_off(mid);
            let promoted = right_keys.remove(0);
            let right_children = children.split_off(mid + 1);
            let sibling = self.store.allocate_page().await?;
            self.write_node(sibling, &Node::Internal { keys: right_keys, children: right_children }).await?;
            self.write_node(parent, &Node::Internal { keys, children }).await?;
            debug!("split internal {parent} into {parent}/{sibling}, promoting {promoted:?}");
            left = parent;
            separator = promoted;
            right = sibling;
        }

        let root = self.store.allocate_page().await?;
        self.write_node(root, &Node::Internal { keys: vec![separator], children: vec![left, right] }).await?;
        self.write_root(root).await?;
        debug!("new root {root}");
        Ok(())
    }

    /// Removes `key`. Nodes are never merged; an emptied leaf stays in the sibling chain.
    ///
    /// # Errors
    /// Store or decode errors.
    pub async fn delete(&mut self, key: &K) -> Result<bool> {
        let mut page = self.root().await?;
        loop {
            match self.load(page).await? {
                Node::Internal { keys, children } => page = children[Node::<K, V>::child_index(&keys, key)],
                Node::Leaf { mut keys, mut values, next } => {
                    let Ok(i) = keys.binary_search(key) else {
                        return Ok(false);
                    };
                    keys.remove(i);
                    values.remove(i);
                    self.write_node(page, &Node::Leaf { keys, values, next }).await?;
                    return Ok(true);
                }
            }
        }
    }

    /// # Errors
    /// Store or decode errors.
    pub async fn min(&self) -> Result<Option<(K, V)>> {
        self.in_order().next().await
    }

    /// # Errors
    /// Store or decode errors.
    pub async fn max(&self) -> Result<Option<(K, V)>> {
        let mut page = self.root().await?;
        loop {
            match self.load(page).await? {
                Node::Internal { children, .. } => page = children[children.len() - 1],
                Node::Leaf { keys, values, .. } => {
                    if let (Some(k), Some(v)) = (keys.last(), values.last()) {
                        return Ok(Some((*k, *v)));
                    }
                    break;
                }
            }
        }
        let mut cursor = self.in_order();
        let mut last = None;
        while let Some(entry) = cursor.next().await? {
            last = Some(entry);
        }
        Ok(last)
    }

    /// Lazy ascending iteration over every entry, starting from the root on each call.
    #[must_use]
    pub fn in_order(&self) -> Cursor<'_, S, K, V> {
        Cursor::new(self, None, None)
    }

    /// Lazy iteration over `from <= key <= to`.
    #[must_use]
    pub fn scan(&self, from: K, to: K) -> Cursor<'_, S, K, V> {
        Cursor::new(self, Some(from), Some(to))
    }

    /// Number of levels, 1 for a lone root leaf.
    ///
    /// # Errors
    /// Store or decode errors.
    pub async fn height(&self) -> Result<usize> {
        let mut page = self.root().await?;
        let mut levels = 1;
        while let Node::Internal { children, .. } = self.load(page).await? {
            page = children[0];
            levels += 1;
        }
        Ok(levels)
    }

    /// Counts entries by walking the leaf chain.
    ///
    /// # Errors
    /// Store or decode errors.
    pub async fn len(&self) -> Result<u64> {
        let mut cursor = self.in_order();
        let mut n = 0;
        while cursor.next().await?.is_some() {
            n += 1;
        }
        Ok(n)
    }

    /// # Errors
    /// Store or decode errors.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.min().await?.is_none())
    }

    /// # Errors
    /// Store flush errors.
    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    /// Flushes and releases the tree's handle on the store.
    ///
    /// # Errors
    /// Store flush errors.
    pub async fn close(self) -> Result<()> {
        self.flush().await
    }
}
