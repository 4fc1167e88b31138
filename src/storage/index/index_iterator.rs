use crate::buffer::buffer_pool_manager::BufferPoolManager;
use crate::common::config::INVALID_PAGE_ID;
use crate::storage::page::b_plus_tree_page::BPlusTreePage;
use crate::storage::page::page_guard::{PageRef, ReadPageGuard};
use std::sync::Arc;

/// Forward cursor over the leaf chain for range scans.
///
/// The cursor pins and read-latches its current leaf; advancing past the
/// last slot latches the next leaf before the current one is released. An
/// iterator with no page, or parked one past the last slot of the last
/// leaf, is the end position.
pub struct IndexIterator<K, V> {
    bpm: Arc<BufferPoolManager<BPlusTreePage<K, V>>>,
    leaf: Option<ReadPageGuard<BPlusTreePage<K, V>>>,
    index: usize,
}

impl<K, V> IndexIterator<K, V>
where
    K: Clone + Default,
    V: Clone,
{
    pub(crate) fn new(
        bpm: Arc<BufferPoolManager<BPlusTreePage<K, V>>>,
        leaf: Option<ReadPageGuard<BPlusTreePage<K, V>>>,
        index: usize,
    ) -> Self {
        Self { bpm, leaf, index }
    }

    pub(crate) fn end_iterator(bpm: Arc<BufferPoolManager<BPlusTreePage<K, V>>>) -> Self {
        Self::new(bpm, None, 0)
    }

    pub fn is_end(&self) -> bool {
        match &self.leaf {
            None => true,
            Some(guard) => {
                let leaf = guard.as_leaf();
                self.index >= leaf.size() && leaf.next_page_id() == INVALID_PAGE_ID
            }
        }
    }

    /// The current entry. Must not be called on an end iterator.
    pub fn value(&self) -> (&K, &V) {
        let guard = self
            .leaf
            .as_ref()
            .expect("dereferencing an end iterator");
        guard.as_leaf().item_at(self.index)
    }

    /// Steps to the next entry, following the leaf chain when the current
    /// leaf is exhausted. The next leaf is latched before the current one is
    /// released.
    pub fn advance(&mut self) {
        let Some(guard) = &self.leaf else { return };
        let leaf = guard.as_leaf();
        if self.index + 1 < leaf.size() {
            self.index += 1;
            return;
        }
        let next = leaf.next_page_id();
        if next == INVALID_PAGE_ID {
            // Park one past the last slot; this equals `end()`.
            self.index = leaf.size();
            return;
        }
        let next_guard = PageRef::fetch(&self.bpm, next)
            .expect("leaf chain page must exist")
            .read_owned();
        self.leaf = Some(next_guard);
        self.index = 0;
    }
}

impl<K, V> Iterator for IndexIterator<K, V>
where
    K: Clone + Default,
    V: Clone,
{
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            let step = {
                let guard = self.leaf.as_ref()?;
                let leaf = guard.as_leaf();
                if self.index < leaf.size() {
                    let (key, value) = leaf.item_at(self.index);
                    Ok((key.clone(), value.clone()))
                } else {
                    Err(leaf.next_page_id())
                }
            };
            match step {
                Ok(item) => {
                    self.index += 1;
                    return Some(item);
                }
                Err(INVALID_PAGE_ID) => return None,
                Err(next) => {
                    let next_guard = PageRef::fetch(&self.bpm, next)
                        .expect("leaf chain page must exist")
                        .read_owned();
                    self.leaf = Some(next_guard);
                    self.index = 0;
                }
            }
        }
    }
}

impl<K, V> PartialEq for IndexIterator<K, V>
where
    K: Clone + Default,
    V: Clone,
{
    fn eq(&self, other: &Self) -> bool {
        match (self.is_end(), other.is_end()) {
            (true, true) => true,
            (false, false) => {
                let a = self.leaf.as_ref().map(|guard| guard.page_id());
                let b = other.leaf.as_ref().map(|guard| guard.page_id());
                a == b && self.index == other.index
            }
            _ => false,
        }
    }
}

impl<K, V> Eq for IndexIterator<K, V>
where
    K: Clone + Default,
    V: Clone,
{
}
