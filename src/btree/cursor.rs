//! Lazy leaf-chain iteration.

use std::vec::IntoIter;

use super::node::Node;
use super::{BPlusTree, FixedKey, FixedValue};
use crate::errors::{Result, StorageError};
use crate::storage::{PageId, PageStore, NO_PAGE};

/// Reads one leaf at a time; nothing is loaded until the first `next`.
pub struct Cursor<'t, S, K, V> {
    tree: &'t BPlusTree<S, K, V>,
    start: Option<Option<K>>,
    lower: Option<K>,
    upper: Option<K>,
    buffered: IntoIter<(K, V)>,
    next_leaf: PageId,
    done: bool,
}

impl<'t, S: PageStore, K: FixedKey, V: FixedValue> Cursor<'t, S, K, V> {
    pub(crate) fn new(tree: &'t BPlusTree<S, K, V>, from: Option<K>, to: Option<K>) -> Self {
        Self {
            tree,
            start: Some(from),
            lower: from,
            upper: to,
            buffered: Vec::new().into_iter(),
            next_leaf: NO_PAGE,
            done: false,
        }
    }

    fn fill(&mut self, page: PageId, node: Node<K, V>) -> Result<()> {
        let Node::Leaf { keys, values, next } = node else {
            return Err(StorageError::Corrupt(format!("sibling chain reached internal page {page}")));
        };
        let lower = self.lower;
        self.next_leaf = next;
        self.buffered = keys
            .into_iter()
            .zip(values)
            .filter(|(k, _)| lower.is_none_or(|lo| *k >= lo))
            .collect::<Vec<_>>()
            .into_iter();
        Ok(())
    }

    /// Next entry in key order, `None` once exhausted or past the upper bound.
    ///
    /// # Errors
    /// Store or decode errors.
    pub async fn next(&mut self) -> Result<Option<(K, V)>> {
        if let Some(from) = self.start.take() {
            let leaf = self.tree.descend(from.as_ref()).await?;
            self.fill(NO_PAGE, leaf)?;
        }
        loop {
            if self.done {
                return Ok(None);
            }
            if let Some((k, v)) = self.buffered.next() {
                if self.upper.is_some_and(|hi| k > hi) {
                    self.done = true;
                    return Ok(None);
                }
                return Ok(Some((k, v)));
            }
            if self.next_leaf == NO_PAGE {
                self.done = true;
                return Ok(None);
            }
            let page = self.next_leaf;
            let node = self.tree.load(page).await?;
            self.fill(page, node)?;
        }
    }

    /// Drains the cursor.
    ///
    /// # Errors
    /// Store or decode errors.
    pub async fn collect_all(mut self) -> Result<Vec<(K, V)>> {
        let mut out = Vec::new();
        while let Some(entry) = self.next().await? {
            out.push(entry);
        }
        Ok(out)
    }
}
