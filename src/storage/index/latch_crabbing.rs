//! Latch crabbing support for B+ tree traversals.
//!
//! Write operations descend the tree latching pages hand over hand. A parent
//! latch may only be released once the child is *safe*:
//!
//! - insert: the child can absorb one more entry without splitting
//!   (`size < max_size - 1` for leaves, `size < max_size` for internals);
//! - delete: the child can lose one entry without underflowing
//!   (`size > min_size`).
//!
//! Until then, the ancestor latches accumulate in a [`LatchContext`] and are
//! released in FIFO order the moment a safe child is reached. The context
//! also owns the write guard on the root pointer, which counts as the
//! outermost ancestor, and the set of pages staged for deletion, which are
//! only returned to the buffer pool after every latch is dropped.

use crate::common::config::PageId;
use crate::storage::page::b_plus_tree_page::BPlusTreePage;
use crate::storage::page::page_guard::WritePageGuard;
use log::trace;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

/// Which kind of traversal holds the latches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Search,
    Insert,
    Delete,
}

/// Owned write guard on the tree's root pointer.
pub type RootPointerGuard = ArcRwLockWriteGuard<RawRwLock, PageId>;

/// Per-operation bag of held latches, threaded through the recursion of one
/// insert or delete. Dropping the context releases everything it still
/// holds; the deleted-page set survives (`take_deleted`) so physical
/// deletion can happen after the latches are gone.
pub struct LatchContext<K, V> {
    operation: Operation,
    root_guard: Option<RootPointerGuard>,
    write_set: VecDeque<WritePageGuard<BPlusTreePage<K, V>>>,
    deleted: Vec<PageId>,
}

impl<K, V> LatchContext<K, V> {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            root_guard: None,
            write_set: VecDeque::new(),
            deleted: Vec::new(),
        }
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Takes the write latch on the root pointer. Every insert/delete does
    /// this before anything else.
    pub fn lock_root(&mut self, root: &Arc<RwLock<PageId>>) {
        debug_assert!(self.root_guard.is_none(), "root pointer latched twice");
        self.root_guard = Some(RwLock::write_arc(root));
    }

    pub fn holds_root(&self) -> bool {
        self.root_guard.is_some()
    }

    pub fn root_id(&self) -> PageId {
        **self
            .root_guard
            .as_ref()
            .expect("root pointer guard must be held")
    }

    /// Redirects the root pointer. Only legal while the guard is still held,
    /// which the crabbing protocol guarantees on any path that can move the
    /// root.
    pub fn set_root_id(&mut self, page_id: PageId) {
        **self
            .root_guard
            .as_mut()
            .expect("root pointer guard must be held to move the root") = page_id;
    }

    /// Records an ancestor whose latch must outlive the descent.
    pub fn push(&mut self, guard: WritePageGuard<BPlusTreePage<K, V>>) {
        trace!(
            "{:?}: holding write latch on page {} ({} held)",
            self.operation,
            guard.page_id(),
            self.write_set.len() + 1
        );
        self.write_set.push_back(guard);
    }

    /// Hands back the most recently pushed ancestor (the immediate parent).
    pub fn pop(&mut self) -> Option<WritePageGuard<BPlusTreePage<K, V>>> {
        self.write_set.pop_back()
    }

    /// The most recently pushed ancestor, without releasing it.
    pub fn last_mut(&mut self) -> Option<&mut WritePageGuard<BPlusTreePage<K, V>>> {
        self.write_set.back_mut()
    }

    pub fn held_count(&self) -> usize {
        self.write_set.len()
    }

    /// Releases the root-pointer guard and every held ancestor, oldest
    /// first. Called when a safe child is latched and when an operation
    /// finishes.
    pub fn release_ancestors(&mut self) {
        if self.root_guard.is_some() || !self.write_set.is_empty() {
            trace!(
                "{:?}: releasing {} ancestor latches",
                self.operation,
                self.write_set.len()
            );
        }
        self.root_guard = None;
        while let Some(guard) = self.write_set.pop_front() {
            drop(guard);
        }
    }

    /// Stages a page for deletion once all latches are dropped.
    pub fn add_deleted(&mut self, page_id: PageId) {
        self.deleted.push(page_id);
    }

    pub fn take_deleted(&mut self) -> Vec<PageId> {
        std::mem::take(&mut self.deleted)
    }
}
