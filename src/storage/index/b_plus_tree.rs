use crate::buffer::buffer_pool_manager::BufferPoolManager;
use crate::common::config::{PageId, HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::storage::index::index_iterator::IndexIterator;
use crate::storage::index::latch_crabbing::{LatchContext, Operation};
use crate::storage::page::b_plus_tree_internal_page::BPlusTreeInternalPage;
use crate::storage::page::b_plus_tree_leaf_page::BPlusTreeLeafPage;
use crate::storage::page::b_plus_tree_page::BPlusTreePage;
use crate::storage::page::header_page::HeaderPage;
use crate::storage::page::page_guard::{PageRef, ReadPageGuard, WritePageGuard};
use log::{debug, trace};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

/// Three-valued key comparator. Keys never need `Ord`; the tree orders them
/// exclusively through a caller-supplied comparator.
pub trait KeyComparator<K>: Fn(&K, &K) -> Ordering + Send + Sync {}

impl<K, F> KeyComparator<K> for F where F: Fn(&K, &K) -> Ordering + Send + Sync {}

type NodeGuard<K, V> = WritePageGuard<BPlusTreePage<K, V>>;
type NodeReadGuard<K, V> = ReadPageGuard<BPlusTreePage<K, V>>;

#[derive(Clone, Copy)]
enum LeafSearch<'a, K> {
    Leftmost,
    Rightmost,
    Key(&'a K),
}

/// Concurrent B+ tree index over buffer-pooled pages.
///
/// Unique keys only. Internal pages direct the search, leaf pages hold the
/// records and form a linked chain for range scans. The tree grows and
/// shrinks dynamically; concurrent operations coordinate by latch crabbing
/// (see `latch_crabbing`).
pub struct BPlusTree<K, V, C> {
    index_name: String,
    root_page_id: Arc<RwLock<PageId>>,
    bpm: Arc<BufferPoolManager<BPlusTreePage<K, V>>>,
    comparator: C,
    leaf_max_size: usize,
    internal_max_size: usize,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: Clone + Default + Debug,
    V: Clone,
    C: KeyComparator<K>,
{
    /// Creates (or re-opens) the index named `index_name` on `bpm`.
    ///
    /// The header page is created on first use and must end up as page 0,
    /// so the first index on a pool has to be created before any other page
    /// is allocated from it. If the name is already registered in the
    /// header page, the recorded root is adopted.
    pub fn new(
        index_name: impl Into<String>,
        bpm: Arc<BufferPoolManager<BPlusTreePage<K, V>>>,
        comparator: C,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Self {
        assert!(leaf_max_size >= 2, "leaf pages need room to split");
        assert!(internal_max_size >= 3, "internal pages need room to split");
        let tree = Self {
            index_name: index_name.into(),
            root_page_id: Arc::new(RwLock::new(INVALID_PAGE_ID)),
            bpm,
            comparator,
            leaf_max_size,
            internal_max_size,
        };
        tree.register_in_header();
        tree
    }

    fn register_in_header(&self) {
        if PageRef::fetch(&self.bpm, HEADER_PAGE_ID).is_none() {
            let header = PageRef::allocate(&self.bpm, BPlusTreePage::Header(HeaderPage::new()))
                .expect("buffer pool must have room for the header page");
            assert_eq!(
                header.page_id(),
                HEADER_PAGE_ID,
                "header page must be allocated before any other page"
            );
        }
        let mut header = self.fetch_write(HEADER_PAGE_ID);
        if !header
            .as_header_mut()
            .insert_record(&self.index_name, INVALID_PAGE_ID)
        {
            let recorded = header
                .as_header()
                .get_root_id(&self.index_name)
                .unwrap_or(INVALID_PAGE_ID);
            *self.root_page_id.write() = recorded;
        }
        header.mark_dirty();
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    /// Current root page id.
    ///
    /// The read latch on the root pointer is released before returning, so
    /// the value may be stale by the time the caller looks at it. Callers
    /// that need a stable root must hold the root-pointer guard themselves.
    pub fn root_page_id(&self) -> PageId {
        let guard = self.root_page_id.read();
        *guard
    }

    /*****************************************************************
     * Search
     *****************************************************************/

    /// Point lookup.
    pub fn get_value(&self, key: &K) -> Option<V> {
        let leaf = self.find_leaf_read(LeafSearch::Key(key))?;
        leaf.as_leaf().lookup(key, &self.comparator).cloned()
    }

    /// Hand-over-hand read descent: the parent's latch is released only
    /// after the child's latch is held. The root-pointer guard is released
    /// as soon as the root page itself is latched.
    fn find_leaf_read(&self, search: LeafSearch<'_, K>) -> Option<NodeReadGuard<K, V>> {
        let root_guard = self.root_page_id.read();
        if *root_guard == INVALID_PAGE_ID {
            return None;
        }
        let mut page = self.fetch_read(*root_guard);
        drop(root_guard);
        loop {
            let child_id = match &*page {
                BPlusTreePage::Leaf(_) => break,
                BPlusTreePage::Internal(internal) => match search {
                    LeafSearch::Leftmost => internal.value_at(0),
                    LeafSearch::Rightmost => internal.value_at(internal.size() - 1),
                    LeafSearch::Key(key) => internal.lookup(key, &self.comparator),
                },
                BPlusTreePage::Header(_) => unreachable!("header page inside the tree"),
            };
            let child = self.fetch_read(child_id);
            page = child;
        }
        Some(page)
    }

    /*****************************************************************
     * Insert
     *****************************************************************/

    /// Inserts `key -> value`. Returns false iff the key is already present.
    pub fn insert(&self, key: K, value: V) -> bool {
        let mut ctx = LatchContext::new(Operation::Insert);
        ctx.lock_root(&self.root_page_id);
        if ctx.root_id() == INVALID_PAGE_ID {
            self.start_new_tree(&mut ctx, key, value);
            return true;
        }

        let mut page = self.fetch_write(ctx.root_id());
        if Self::is_insert_safe(&page) {
            ctx.release_ancestors();
        }
        loop {
            let child_id = match &*page {
                BPlusTreePage::Leaf(_) => break,
                BPlusTreePage::Internal(internal) => internal.lookup(&key, &self.comparator),
                BPlusTreePage::Header(_) => unreachable!("header page inside the tree"),
            };
            let child = self.fetch_write(child_id);
            ctx.push(page);
            page = child;
            if Self::is_insert_safe(&page) {
                ctx.release_ancestors();
            }
        }

        if page.as_leaf().lookup(&key, &self.comparator).is_some() {
            trace!("insert rejected, duplicate key {:?}", key);
            return false;
        }
        let new_size = page.as_leaf_mut().insert(key, value, &self.comparator);
        page.mark_dirty();
        if new_size == self.leaf_max_size {
            self.split_leaf(&mut ctx, &mut page);
        }
        true
    }

    fn start_new_tree(&self, ctx: &mut LatchContext<K, V>, key: K, value: V) {
        let page = self.allocate_page(BPlusTreePage::Leaf(BPlusTreeLeafPage::new(
            self.leaf_max_size,
        )));
        let page_id = page.page_id();
        let mut guard = page.write_owned();
        {
            let leaf = guard.as_leaf_mut();
            leaf.init(page_id, INVALID_PAGE_ID, self.leaf_max_size);
            leaf.insert(key, value, &self.comparator);
        }
        guard.mark_dirty();
        ctx.set_root_id(page_id);
        self.update_root_page_id(page_id);
        debug!("started new tree, root page {page_id}");
        ctx.release_ancestors();
    }

    /// A full leaf just absorbed one entry too many: carve off the upper
    /// half into a fresh sibling and push the separator into the parent.
    fn split_leaf(&self, ctx: &mut LatchContext<K, V>, page: &mut NodeGuard<K, V>) {
        let new_page = self.allocate_page(BPlusTreePage::Leaf(BPlusTreeLeafPage::new(
            self.leaf_max_size,
        )));
        let new_page_id = new_page.page_id();
        let mut sibling = new_page.write_owned();
        sibling
            .as_leaf_mut()
            .init(new_page_id, page.parent_page_id(), self.leaf_max_size);
        page.as_leaf_mut().move_half_to(sibling.as_leaf_mut());
        let separator = sibling.as_leaf().key_at(0).clone();
        sibling.mark_dirty();
        page.mark_dirty();
        debug!(
            "split leaf {} -> {} at {:?}",
            page.page_id(),
            new_page_id,
            separator
        );
        self.insert_into_parent(ctx, page, separator, &mut sibling);
    }

    /// Hooks `new` (right sibling of `old`, covering keys >= `key`) into the
    /// tree, growing a new root or splitting ancestors as needed. Ancestor
    /// write latches come out of `ctx`; the crabbing protocol guarantees
    /// they are held on any path that reaches here.
    fn insert_into_parent(
        &self,
        ctx: &mut LatchContext<K, V>,
        old: &mut NodeGuard<K, V>,
        key: K,
        new: &mut NodeGuard<K, V>,
    ) {
        if old.is_root_page() {
            let root_page = self.allocate_page(BPlusTreePage::Internal(
                BPlusTreeInternalPage::new(self.internal_max_size),
            ));
            let root_id = root_page.page_id();
            let mut root = root_page.write_owned();
            {
                let internal = root.as_internal_mut();
                internal.init(root_id, INVALID_PAGE_ID, self.internal_max_size);
                internal.populate_new_root(old.page_id(), key, new.page_id());
            }
            root.mark_dirty();
            old.set_parent_page_id(root_id);
            old.mark_dirty();
            new.set_parent_page_id(root_id);
            new.mark_dirty();
            ctx.set_root_id(root_id);
            self.update_root_page_id(root_id);
            debug!("grew new root {root_id}");
            ctx.release_ancestors();
            return;
        }

        let mut parent = ctx
            .pop()
            .expect("parent latch must be held for an unsafe child");
        debug_assert_eq!(parent.page_id(), old.parent_page_id());
        new.set_parent_page_id(parent.page_id());
        new.mark_dirty();
        let parent_size =
            parent
                .as_internal_mut()
                .insert_node_after(old.page_id(), key, new.page_id());
        parent.mark_dirty();
        if parent_size <= self.internal_max_size {
            ctx.release_ancestors();
            return;
        }

        // The parent overflowed by one entry; split it evenly and recurse
        // with the separator left in the new sibling's sentinel slot.
        let sibling_page = self.allocate_page(BPlusTreePage::Internal(
            BPlusTreeInternalPage::new(self.internal_max_size),
        ));
        let sibling_id = sibling_page.page_id();
        let mut sibling = sibling_page.write_owned();
        sibling
            .as_internal_mut()
            .init(sibling_id, parent.parent_page_id(), self.internal_max_size);
        parent.as_internal_mut().move_half_to(sibling.as_internal_mut());
        sibling.mark_dirty();
        self.reparent_children(&mut sibling, &mut [old, new]);
        let separator = sibling.as_internal().key_at(0).clone();
        debug!("split internal {} -> {}", parent.page_id(), sibling_id);
        self.insert_into_parent(ctx, &mut parent, separator, &mut sibling);
    }

    /// Rewrites `parent_page_id` of every child of `node`. Children whose
    /// write guards the operation already holds are updated through those
    /// guards; the rest are fetched and latched briefly. Latch order stays
    /// strictly downward.
    fn reparent_children(&self, node: &mut NodeGuard<K, V>, held: &mut [&mut NodeGuard<K, V>]) {
        let node_id = node.page_id();
        let child_ids: Vec<PageId> = node.as_internal().children().to_vec();
        for child_id in child_ids {
            if let Some(guard) = held.iter_mut().find(|g| g.page_id() == child_id) {
                guard.set_parent_page_id(node_id);
                guard.mark_dirty();
            } else {
                let mut child = self.fetch_write(child_id);
                child.set_parent_page_id(node_id);
                child.mark_dirty();
            }
        }
    }

    fn reparent_to(&self, parent_id: PageId, child_ids: &[PageId]) {
        for &child_id in child_ids {
            let mut child = self.fetch_write(child_id);
            child.set_parent_page_id(parent_id);
            child.mark_dirty();
        }
    }

    /*****************************************************************
     * Remove
     *****************************************************************/

    /// Removes `key`. No-op if the key is absent.
    pub fn remove(&self, key: &K) {
        let mut ctx = LatchContext::new(Operation::Delete);
        ctx.lock_root(&self.root_page_id);
        if ctx.root_id() == INVALID_PAGE_ID {
            return;
        }

        let mut page = self.fetch_write(ctx.root_id());
        if self.is_delete_safe(&page, key) {
            ctx.release_ancestors();
        }
        loop {
            let child_id = match &*page {
                BPlusTreePage::Leaf(_) => break,
                BPlusTreePage::Internal(internal) => internal.lookup(key, &self.comparator),
                BPlusTreePage::Header(_) => unreachable!("header page inside the tree"),
            };
            let child = self.fetch_write(child_id);
            ctx.push(page);
            page = child;
            if self.is_delete_safe(&page, key) {
                ctx.release_ancestors();
            }
        }

        let was_first = {
            let leaf = page.as_leaf();
            leaf.size() > 0 && (self.comparator)(leaf.key_at(0), key) == Ordering::Equal
        };
        if !page
            .as_leaf_mut()
            .remove_and_delete_record(key, &self.comparator)
        {
            trace!("remove of absent key {:?}", key);
            return;
        }
        page.mark_dirty();

        if was_first && !page.is_root_page() {
            self.fix_parent_separator(&mut ctx, &page);
        }

        let leaf_deleted = self.coalesce_or_redistribute(&mut ctx, &mut page, &mut []);
        if leaf_deleted {
            ctx.add_deleted(page.page_id());
        }
        drop(page);
        let deleted = ctx.take_deleted();
        drop(ctx);
        for page_id in deleted {
            self.bpm.delete_page(page_id);
        }
    }

    /// The removed key was the leaf's first: unless the leaf is its parent's
    /// slot-0 child, the parent separator must follow the leaf's new first
    /// key. The parent latch is guaranteed held because such a leaf is never
    /// judged delete-safe.
    fn fix_parent_separator(&self, ctx: &mut LatchContext<K, V>, page: &NodeGuard<K, V>) {
        let leaf = page.as_leaf();
        if leaf.size() == 0 {
            // The leaf is about to coalesce away; no separator survives it.
            return;
        }
        let parent = ctx
            .last_mut()
            .expect("parent latch must be held when the first key changes");
        debug_assert_eq!(parent.page_id(), leaf.parent_page_id());
        let idx = parent
            .as_internal()
            .value_index(page.page_id())
            .expect("leaf must be registered in its parent");
        if idx != 0 {
            let new_first = leaf.key_at(0).clone();
            parent.as_internal_mut().set_key_at(idx, new_first);
            parent.mark_dirty();
        }
    }

    /// Restores the balance invariant for an underfull `node`, preferring to
    /// borrow from the left sibling and merging when neither sibling can
    /// spare an entry. Returns whether `node` itself must be deleted.
    ///
    /// `held_below`: write guards on level-below pages still held by outer
    /// frames (the survivor of a lower-level merge). Their parent pointers
    /// are updated through the guards rather than by re-latching.
    fn coalesce_or_redistribute(
        &self,
        ctx: &mut LatchContext<K, V>,
        node: &mut NodeGuard<K, V>,
        held_below: &mut [&mut NodeGuard<K, V>],
    ) -> bool {
        if node.is_root_page() {
            return self.adjust_root(ctx, node, held_below);
        }
        if node.size() >= node.min_size() {
            ctx.release_ancestors();
            return false;
        }

        let mut parent = ctx
            .pop()
            .expect("parent latch must be held for an underfull child");
        let idx = parent
            .as_internal()
            .value_index(node.page_id())
            .expect("child must be registered in its parent");
        debug_assert!(parent.as_internal().size() >= 2);

        if idx > 0 {
            // Prefer the left sibling.
            let sibling_id = parent.as_internal().value_at(idx - 1);
            let mut sibling = self.fetch_write(sibling_id);
            if sibling.size() > sibling.min_size() {
                self.redistribute(&mut parent, &mut sibling, node, idx, true);
                ctx.release_ancestors();
                return false;
            }
            debug!("coalesce page {} into left sibling {}", node.page_id(), sibling_id);
            self.merge(&mut parent, &mut sibling, node, idx, held_below);
            let parent_deleted =
                self.coalesce_or_redistribute(ctx, &mut parent, &mut [&mut sibling]);
            if parent_deleted {
                ctx.add_deleted(parent.page_id());
            }
            true
        } else {
            let sibling_id = parent.as_internal().value_at(idx + 1);
            let mut sibling = self.fetch_write(sibling_id);
            if sibling.size() > sibling.min_size() {
                self.redistribute(&mut parent, &mut sibling, node, idx, false);
                ctx.release_ancestors();
                return false;
            }
            debug!("coalesce right sibling {} into page {}", sibling_id, node.page_id());
            self.merge(&mut parent, node, &mut sibling, idx + 1, held_below);
            ctx.add_deleted(sibling.page_id());
            let parent_deleted =
                self.coalesce_or_redistribute(ctx, &mut parent, &mut [&mut *node]);
            if parent_deleted {
                ctx.add_deleted(parent.page_id());
            }
            false
        }
    }

    /// The root is exempt from the min-size rule, but it collapses in two
    /// cases: an internal root left with a single child promotes that child,
    /// and an empty leaf root empties the tree. Returns whether the old root
    /// page must be deleted.
    fn adjust_root(
        &self,
        ctx: &mut LatchContext<K, V>,
        node: &mut NodeGuard<K, V>,
        held_below: &mut [&mut NodeGuard<K, V>],
    ) -> bool {
        match &**node {
            BPlusTreePage::Internal(internal) if internal.size() == 1 => {
                let child_id = internal.value_at(0);
                if let Some(child) = held_below.iter_mut().find(|g| g.page_id() == child_id) {
                    child.set_parent_page_id(INVALID_PAGE_ID);
                    child.mark_dirty();
                } else {
                    let mut child = self.fetch_write(child_id);
                    child.set_parent_page_id(INVALID_PAGE_ID);
                    child.mark_dirty();
                }
                ctx.set_root_id(child_id);
                self.update_root_page_id(child_id);
                debug!("root {} collapsed into child {}", node.page_id(), child_id);
                ctx.release_ancestors();
                true
            }
            BPlusTreePage::Leaf(leaf) if leaf.size() == 0 => {
                ctx.set_root_id(INVALID_PAGE_ID);
                self.update_root_page_id(INVALID_PAGE_ID);
                debug!("removed last entry, tree is empty");
                ctx.release_ancestors();
                true
            }
            _ => {
                ctx.release_ancestors();
                false
            }
        }
    }

    /// Moves one boundary entry from `sibling` into `node` and refreshes the
    /// parent separator. `from_prev` says whether `sibling` is the left
    /// (separator at `idx`) or right (separator at `idx + 1`) neighbor.
    fn redistribute(
        &self,
        parent: &mut NodeGuard<K, V>,
        sibling: &mut NodeGuard<K, V>,
        node: &mut NodeGuard<K, V>,
        idx: usize,
        from_prev: bool,
    ) {
        let node_id = node.page_id();
        let separator_idx = if from_prev { idx } else { idx + 1 };
        let middle_key = parent.as_internal().key_at(separator_idx).clone();
        let (new_separator, moved_child) = match (&mut **sibling, &mut **node) {
            (BPlusTreePage::Leaf(s), BPlusTreePage::Leaf(n)) => {
                let key = if from_prev {
                    s.move_last_to_front_of(n)
                } else {
                    s.move_first_to_end_of(n)
                };
                (key, None)
            }
            (BPlusTreePage::Internal(s), BPlusTreePage::Internal(n)) => {
                let (key, child) = if from_prev {
                    s.move_last_to_front_of(n, middle_key)
                } else {
                    s.move_first_to_end_of(n, middle_key)
                };
                (key, Some(child))
            }
            _ => unreachable!("redistributing pages of different kinds"),
        };
        if let Some(child_id) = moved_child {
            self.reparent_to(node_id, &[child_id]);
        }
        parent
            .as_internal_mut()
            .set_key_at(separator_idx, new_separator);
        parent.mark_dirty();
        sibling.mark_dirty();
        node.mark_dirty();
        trace!("redistributed into page {} (from_prev: {})", node_id, from_prev);
    }

    /// Merges `right` into `left` (left keeps its ids) and drops the
    /// separator at `sep_index` from the parent. Children moved across an
    /// internal merge are reparented, through held guards where the
    /// operation already latched them.
    fn merge(
        &self,
        parent: &mut NodeGuard<K, V>,
        left: &mut NodeGuard<K, V>,
        right: &mut NodeGuard<K, V>,
        sep_index: usize,
        held_below: &mut [&mut NodeGuard<K, V>],
    ) {
        let middle_key = parent.as_internal().key_at(sep_index).clone();
        let left_id = left.page_id();
        let moved_children = match (&mut **left, &mut **right) {
            (BPlusTreePage::Leaf(l), BPlusTreePage::Leaf(r)) => {
                r.move_all_to(l);
                Vec::new()
            }
            (BPlusTreePage::Internal(l), BPlusTreePage::Internal(r)) => {
                r.move_all_to(l, middle_key)
            }
            _ => unreachable!("coalescing pages of different kinds"),
        };
        left.mark_dirty();
        right.mark_dirty();
        for child_id in moved_children {
            if let Some(guard) = held_below.iter_mut().find(|g| g.page_id() == child_id) {
                guard.set_parent_page_id(left_id);
                guard.mark_dirty();
            } else {
                self.reparent_to(left_id, &[child_id]);
            }
        }
        parent.as_internal_mut().remove(sep_index);
        parent.mark_dirty();
    }

    /*****************************************************************
     * Iterators
     *****************************************************************/

    /// Cursor at the first entry of the tree.
    pub fn begin(&self) -> IndexIterator<K, V> {
        match self.find_leaf_read(LeafSearch::Leftmost) {
            Some(leaf) => IndexIterator::new(Arc::clone(&self.bpm), Some(leaf), 0),
            None => IndexIterator::end_iterator(Arc::clone(&self.bpm)),
        }
    }

    /// Cursor at the first entry whose key is >= `key`.
    pub fn begin_at(&self, key: &K) -> IndexIterator<K, V> {
        match self.find_leaf_read(LeafSearch::Key(key)) {
            Some(leaf) => {
                let index = leaf.as_leaf().key_index(key, &self.comparator);
                IndexIterator::new(Arc::clone(&self.bpm), Some(leaf), index)
            }
            None => IndexIterator::end_iterator(Arc::clone(&self.bpm)),
        }
    }

    /// Cursor one past the last entry.
    pub fn end(&self) -> IndexIterator<K, V> {
        match self.find_leaf_read(LeafSearch::Rightmost) {
            Some(leaf) => {
                let index = leaf.as_leaf().size();
                IndexIterator::new(Arc::clone(&self.bpm), Some(leaf), index)
            }
            None => IndexIterator::end_iterator(Arc::clone(&self.bpm)),
        }
    }

    /*****************************************************************
     * Helpers
     *****************************************************************/

    /// A node is insert-safe when one more entry cannot split it.
    fn is_insert_safe(node: &BPlusTreePage<K, V>) -> bool {
        match node {
            BPlusTreePage::Leaf(leaf) => leaf.size() < leaf.max_size().saturating_sub(1),
            BPlusTreePage::Internal(internal) => internal.size() < internal.max_size(),
            BPlusTreePage::Header(_) => unreachable!("header page inside the tree"),
        }
    }

    /// A node is delete-safe when one less entry cannot underflow it. A leaf
    /// whose first key is the delete target is additionally kept unsafe so
    /// the parent separator update happens under the parent's latch.
    fn is_delete_safe(&self, node: &BPlusTreePage<K, V>, key: &K) -> bool {
        let roomy = if node.is_root_page() {
            node.size() > 2
        } else {
            node.size() > node.min_size()
        };
        if !roomy {
            return false;
        }
        match node {
            BPlusTreePage::Leaf(leaf) if !node.is_root_page() => {
                !(leaf.size() > 0
                    && (self.comparator)(leaf.key_at(0), key) == Ordering::Equal)
            }
            _ => true,
        }
    }

    /// Writes the current root id through the header page. Called with the
    /// root-pointer write guard held, every time the root moves.
    fn update_root_page_id(&self, root_id: PageId) {
        let mut header = self.fetch_write(HEADER_PAGE_ID);
        let updated = header
            .as_header_mut()
            .update_record(&self.index_name, root_id);
        debug_assert!(updated, "index must be registered in the header page");
        header.mark_dirty();
    }

    fn fetch_read(&self, page_id: PageId) -> NodeReadGuard<K, V> {
        PageRef::fetch(&self.bpm, page_id)
            .expect("tree page must be fetchable")
            .read_owned()
    }

    fn fetch_write(&self, page_id: PageId) -> NodeGuard<K, V> {
        PageRef::fetch(&self.bpm, page_id)
            .expect("tree page must be fetchable")
            .write_owned()
    }

    fn allocate_page(&self, payload: BPlusTreePage<K, V>) -> PageRef<BPlusTreePage<K, V>> {
        PageRef::allocate(&self.bpm, payload).expect("buffer pool out of pages")
    }
}

#[cfg(test)]
impl<K, V, C> BPlusTree<K, V, C>
where
    K: Clone + Default + Debug,
    V: Clone,
    C: KeyComparator<K>,
{
    /// Structural audit used by tests: parent pointers, in-page ordering,
    /// separator bounds, size limits, and uniform leaf depth. Separators are
    /// checked as lower bounds (deleting a leaf's first key when the leaf is
    /// its parent's slot-0 child legitimately leaves the higher separator
    /// behind).
    fn verify_integrity(&self) {
        let root_id = self.root_page_id();
        if root_id == INVALID_PAGE_ID {
            return;
        }
        let mut leaf_depths = Vec::new();
        self.verify_subtree(root_id, INVALID_PAGE_ID, None, None, 0, &mut leaf_depths);
        assert!(
            leaf_depths.windows(2).all(|w| w[0] == w[1]),
            "leaves at differing depths: {leaf_depths:?}"
        );
    }

    fn verify_subtree(
        &self,
        page_id: PageId,
        expected_parent: PageId,
        low: Option<&K>,
        high: Option<&K>,
        depth: usize,
        leaf_depths: &mut Vec<usize>,
    ) {
        let guard = self.fetch_read(page_id);
        assert_eq!(
            guard.parent_page_id(),
            expected_parent,
            "parent pointer of page {page_id}"
        );
        match &*guard {
            BPlusTreePage::Leaf(leaf) => {
                if expected_parent != INVALID_PAGE_ID {
                    assert!(leaf.size() >= leaf.min_size(), "leaf {page_id} underfull");
                }
                assert!(leaf.size() <= leaf.max_size(), "leaf {page_id} overfull");
                for i in 0..leaf.size() {
                    let key = leaf.key_at(i);
                    if i > 0 {
                        assert_eq!(
                            (self.comparator)(leaf.key_at(i - 1), key),
                            Ordering::Less,
                            "leaf {page_id} keys out of order"
                        );
                    }
                    if let Some(low) = low {
                        assert_ne!(
                            (self.comparator)(low, key),
                            Ordering::Greater,
                            "leaf {page_id} holds a key below its separator"
                        );
                    }
                    if let Some(high) = high {
                        assert_eq!(
                            (self.comparator)(key, high),
                            Ordering::Less,
                            "leaf {page_id} holds a key at or above its upper bound"
                        );
                    }
                }
                leaf_depths.push(depth);
            }
            BPlusTreePage::Internal(internal) => {
                if expected_parent != INVALID_PAGE_ID {
                    assert!(
                        internal.size() >= internal.min_size(),
                        "internal {page_id} underfull"
                    );
                } else {
                    assert!(
                        internal.size() >= 2,
                        "internal root {page_id} must keep two children"
                    );
                }
                assert!(internal.size() <= internal.max_size(), "internal {page_id} overfull");
                for i in 2..internal.size() {
                    assert_eq!(
                        (self.comparator)(internal.key_at(i - 1), internal.key_at(i)),
                        Ordering::Less,
                        "internal {page_id} separators out of order"
                    );
                }
                for i in 0..internal.size() {
                    let child_low = if i == 0 { low } else { Some(internal.key_at(i)) };
                    let child_high = if i + 1 < internal.size() {
                        Some(internal.key_at(i + 1))
                    } else {
                        high
                    };
                    self.verify_subtree(
                        internal.value_at(i),
                        page_id,
                        child_low,
                        child_high,
                        depth + 1,
                        leaf_depths,
                    );
                }
            }
            BPlusTreePage::Header(_) => unreachable!("header page inside the tree"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::logger::initialize_logger;
    use crate::common::rid::Rid;
    use rand::seq::SliceRandom;
    use std::thread;

    type TestTree = BPlusTree<i64, Rid, fn(&i64, &i64) -> Ordering>;

    fn int_cmp(a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    fn rid(key: i64) -> Rid {
        Rid::new(key as u64, key as u32)
    }

    fn create_tree(leaf_max_size: usize, internal_max_size: usize) -> TestTree {
        initialize_logger();
        let bpm = Arc::new(BufferPoolManager::new(256));
        BPlusTree::new(
            "test_index",
            bpm,
            int_cmp as fn(&i64, &i64) -> Ordering,
            leaf_max_size,
            internal_max_size,
        )
    }

    fn assert_all_unpinned(tree: &TestTree) {
        for page_id in 0..tree.bpm.allocated_pages() {
            let pins = tree.bpm.pin_count(page_id);
            assert!(
                matches!(pins, None | Some(0)),
                "page {page_id} still pinned after the call returned: {pins:?}"
            );
        }
    }

    fn collect_keys(tree: &TestTree) -> Vec<i64> {
        tree.begin().map(|(key, _)| key).collect()
    }

    #[test]
    fn test_empty_tree() {
        let tree = create_tree(4, 4);
        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id(), INVALID_PAGE_ID);
        assert_eq!(tree.get_value(&1), None);
        tree.remove(&1);
        assert!(tree.begin().is_end());
        assert!(tree.begin() == tree.end());
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_insert_and_lookup() {
        let tree = create_tree(4, 4);
        for key in [3i64, 1, 4, 2] {
            assert!(tree.insert(key, rid(key)));
        }
        for key in 1..=4 {
            assert_eq!(tree.get_value(&key), Some(rid(key)), "key {key}");
        }
        assert_eq!(tree.get_value(&5), None);
        assert!(!tree.insert(3, rid(99)), "duplicate keys are rejected");
        assert_eq!(tree.get_value(&3), Some(rid(3)), "duplicate insert must not clobber");
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_leaf_split_builds_root() {
        let tree = create_tree(4, 4);
        for key in 1..=4i64 {
            assert!(tree.insert(key, rid(key)));
        }

        let root_id = tree.root_page_id();
        let (left_id, right_id) = {
            let root = tree.fetch_read(root_id);
            let internal = root.as_internal();
            assert_eq!(internal.size(), 2);
            assert_eq!(*internal.key_at(1), 3);
            (internal.value_at(0), internal.value_at(1))
        };

        let left = tree.fetch_read(left_id);
        let left_leaf = left.as_leaf();
        assert_eq!(left_leaf.size(), 2);
        assert_eq!(*left_leaf.key_at(0), 1);
        assert_eq!(*left_leaf.key_at(1), 2);
        assert_eq!(left_leaf.next_page_id(), right_id);
        drop(left);

        let right = tree.fetch_read(right_id);
        let right_leaf = right.as_leaf();
        assert_eq!(*right_leaf.key_at(0), 3);
        assert_eq!(*right_leaf.key_at(1), 4);
        assert_eq!(right_leaf.next_page_id(), INVALID_PAGE_ID);
        drop(right);

        tree.verify_integrity();
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_internal_split_grows_tree() {
        let tree = create_tree(3, 3);
        for key in 1..=10i64 {
            assert!(tree.insert(key, rid(key)));
        }
        // Ten keys over fanout-3 pages need a root above the first internal level.
        let root = tree.fetch_read(tree.root_page_id());
        let first_child = root.as_internal().value_at(0);
        drop(root);
        let child = tree.fetch_read(first_child);
        assert!(!child.is_leaf_page(), "tree must be at least three levels deep");
        drop(child);

        assert_eq!(collect_keys(&tree), (1..=10).collect::<Vec<_>>());
        tree.verify_integrity();
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_descending_insert() {
        let tree = create_tree(3, 3);
        for key in (1..=10i64).rev() {
            assert!(tree.insert(key, rid(key)));
        }
        assert_eq!(collect_keys(&tree), (1..=10).collect::<Vec<_>>());
        tree.verify_integrity();
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_remove_coalesce_and_root_collapse() {
        let tree = create_tree(3, 3);
        for key in 1..=6i64 {
            assert!(tree.insert(key, rid(key)));
        }

        tree.remove(&1);
        tree.remove(&2);
        tree.remove(&3);
        assert_eq!(collect_keys(&tree), vec![4, 5, 6]);
        for key in 1..=3i64 {
            assert_eq!(tree.get_value(&key), None);
        }
        tree.verify_integrity();

        // Keep removing until the root collapses back into a single leaf.
        tree.remove(&4);
        tree.remove(&5);
        let root = tree.fetch_read(tree.root_page_id());
        assert!(root.is_leaf_page(), "root must collapse to a leaf");
        assert_eq!(root.as_leaf().size(), 1);
        assert_eq!(*root.as_leaf().key_at(0), 6);
        drop(root);
        tree.verify_integrity();

        tree.remove(&6);
        assert!(tree.is_empty());
        assert!(tree.begin().is_end());
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_redistribution_updates_separator() {
        let tree = create_tree(4, 4);
        for key in (1..=7i64).rev() {
            assert!(tree.insert(key, rid(key)));
        }
        // Leaves now hold [1,2,3] | [4,5] | [6,7]. Removing 5 underflows the
        // middle leaf; its left sibling can spare an entry, so the tree
        // redistributes instead of coalescing.
        tree.remove(&5);

        let root = tree.fetch_read(tree.root_page_id());
        let internal = root.as_internal();
        assert_eq!(internal.size(), 3, "redistribution must not change fanout");
        assert_eq!(*internal.key_at(1), 3, "separator must follow the moved key");
        assert_eq!(*internal.key_at(2), 6);
        drop(root);

        assert_eq!(collect_keys(&tree), vec![1, 2, 3, 4, 6, 7]);
        tree.verify_integrity();
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_random_workload() {
        let tree = create_tree(4, 4);
        let mut rng = rand::rng();
        let mut keys: Vec<i64> = (0..200).collect();
        keys.shuffle(&mut rng);
        for &key in &keys {
            assert!(tree.insert(key, rid(key)));
        }
        tree.verify_integrity();
        assert_eq!(collect_keys(&tree), (0..200).collect::<Vec<_>>());

        let mut to_remove = keys.clone();
        to_remove.shuffle(&mut rng);
        let removed: Vec<i64> = to_remove.drain(..100).collect();
        for &key in &removed {
            tree.remove(&key);
        }
        tree.verify_integrity();

        let mut expected: Vec<i64> = (0..200).filter(|k| !removed.contains(k)).collect();
        expected.sort_unstable();
        assert_eq!(collect_keys(&tree), expected);
        for key in 0..200 {
            let expected = if removed.contains(&key) { None } else { Some(rid(key)) };
            assert_eq!(tree.get_value(&key), expected, "key {key}");
        }
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_remove_everything_random_order() {
        let tree = create_tree(4, 4);
        let mut rng = rand::rng();
        let mut keys: Vec<i64> = (0..100).collect();
        keys.shuffle(&mut rng);
        for &key in &keys {
            tree.insert(key, rid(key));
        }
        keys.shuffle(&mut rng);
        for (i, &key) in keys.iter().enumerate() {
            tree.remove(&key);
            if i % 10 == 0 {
                tree.verify_integrity();
            }
        }
        assert!(tree.is_empty());
        assert_eq!(tree.root_page_id(), INVALID_PAGE_ID);
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_iterator_begin_at() {
        let tree = create_tree(4, 4);
        for key in (10..=100i64).step_by(10) {
            tree.insert(key, rid(key));
        }

        let from_45: Vec<i64> = tree.begin_at(&45).map(|(k, _)| k).collect();
        assert_eq!(from_45, vec![50, 60, 70, 80, 90, 100]);

        let from_20: Vec<i64> = tree.begin_at(&20).map(|(k, _)| k).collect();
        assert_eq!(from_20, (20..=100).step_by(10).collect::<Vec<_>>());

        assert!(tree.begin_at(&101).is_end());
        assert_eq!(tree.begin_at(&101).next(), None);
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_cursor_walk_to_end() {
        let tree = create_tree(4, 4);
        for key in 1..=9i64 {
            tree.insert(key, rid(key));
        }
        let mut cursor = tree.begin();
        let mut seen = Vec::new();
        while cursor != tree.end() {
            let (key, value) = cursor.value();
            assert_eq!(*value, rid(*key));
            seen.push(*key);
            cursor.advance();
        }
        assert_eq!(seen, (1..=9).collect::<Vec<_>>());
        assert!(cursor.is_end());
    }

    #[test]
    fn test_values_round_trip() {
        let tree = create_tree(4, 4);
        for key in 0..40i64 {
            tree.insert(key, Rid::new(7, key as u32));
        }
        let collected: Vec<(i64, Rid)> = tree.begin().collect();
        assert_eq!(collected.len(), 40);
        for (key, value) in collected {
            assert_eq!(value, Rid::new(7, key as u32));
        }
    }

    #[test]
    fn test_reopen_existing_index() {
        initialize_logger();
        let bpm = Arc::new(BufferPoolManager::new(256));
        let tree = BPlusTree::new(
            "orders_pk",
            Arc::clone(&bpm),
            int_cmp as fn(&i64, &i64) -> Ordering,
            4,
            4,
        );
        for key in 0..20i64 {
            tree.insert(key, rid(key));
        }
        let root_before = tree.root_page_id();
        drop(tree);

        let reopened: TestTree = BPlusTree::new(
            "orders_pk",
            bpm,
            int_cmp as fn(&i64, &i64) -> Ordering,
            4,
            4,
        );
        assert_eq!(reopened.root_page_id(), root_before);
        for key in 0..20i64 {
            assert_eq!(reopened.get_value(&key), Some(rid(key)));
        }
    }

    #[test]
    fn test_two_indexes_share_pool() {
        initialize_logger();
        let bpm = Arc::new(BufferPoolManager::new(256));
        let orders: TestTree = BPlusTree::new(
            "orders_pk",
            Arc::clone(&bpm),
            int_cmp as fn(&i64, &i64) -> Ordering,
            4,
            4,
        );
        let users: TestTree = BPlusTree::new(
            "users_pk",
            Arc::clone(&bpm),
            int_cmp as fn(&i64, &i64) -> Ordering,
            3,
            3,
        );
        for key in 0..30i64 {
            orders.insert(key, rid(key));
            users.insert(key * 2, rid(key * 2));
        }
        assert_eq!(collect_keys(&orders), (0..30).collect::<Vec<_>>());
        assert_eq!(collect_keys(&users), (0..30).map(|k| k * 2).collect::<Vec<_>>());
        orders.verify_integrity();
        users.verify_integrity();

        let header = orders.fetch_read(HEADER_PAGE_ID);
        assert_eq!(header.as_header().num_records(), 2);
    }

    #[test]
    fn test_concurrent_inserts() {
        let tree = Arc::new(create_tree(16, 16));
        let mut handles = Vec::new();
        for t in 0..4i64 {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                for key in (t * 250)..((t + 1) * 250) {
                    assert!(tree.insert(key, rid(key)));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for key in 0..1000i64 {
            assert_eq!(tree.get_value(&key), Some(rid(key)), "key {key}");
        }
        assert_eq!(collect_keys(&tree).len(), 1000);
        tree.verify_integrity();
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let tree = Arc::new(create_tree(16, 16));
        for key in 0..200i64 {
            tree.insert(key, rid(key));
        }

        let mut handles = Vec::new();
        for t in 0..2i64 {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                for key in (200 + t * 200)..(200 + (t + 1) * 200) {
                    assert!(tree.insert(key, rid(key)));
                }
            }));
        }
        for _ in 0..2 {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                for round in 0..20 {
                    for key in 0..200i64 {
                        // The pre-loaded range is never touched by writers.
                        assert_eq!(tree.get_value(&key), Some(rid(key)), "round {round}");
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        for key in 0..600i64 {
            assert_eq!(tree.get_value(&key), Some(rid(key)));
        }
        tree.verify_integrity();
        assert_all_unpinned(&tree);
    }

    #[test]
    fn test_concurrent_disjoint_insert_and_remove() {
        let tree = Arc::new(create_tree(16, 16));
        for key in 0..400i64 {
            tree.insert(key, rid(key));
        }

        let mut handles = Vec::new();
        for t in 0..2i64 {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                for key in (t * 200)..((t + 1) * 200) {
                    tree.remove(&key);
                }
            }));
        }
        for t in 0..2i64 {
            let tree = Arc::clone(&tree);
            handles.push(thread::spawn(move || {
                for key in (400 + t * 200)..(400 + (t + 1) * 200) {
                    assert!(tree.insert(key, rid(key)));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for key in 0..400i64 {
            assert_eq!(tree.get_value(&key), None, "key {key} should be gone");
        }
        for key in 400..800i64 {
            assert_eq!(tree.get_value(&key), Some(rid(key)), "key {key}");
        }
        assert_eq!(collect_keys(&tree), (400..800).collect::<Vec<_>>());
        tree.verify_integrity();
        assert_all_unpinned(&tree);
    }
}
