use crate::common::config::{PageId, BUFFER_POOL_SIZE};
use crate::common::exception::BufferPoolError;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// A resident page plus the bookkeeping the pool needs for it.
struct Frame<P> {
    page: Arc<RwLock<P>>,
    pin_count: u32,
    is_dirty: bool,
}

struct PoolState<P> {
    /// Pages currently resident in a frame.
    frames: HashMap<PageId, Frame<P>>,
    /// Evicted pages. Stands in for the disk manager: payloads are kept
    /// whole instead of being serialized, which is all the index layer needs.
    store: HashMap<PageId, Arc<RwLock<P>>>,
    /// Resident pages with a zero pin count, in eviction order.
    evict_queue: VecDeque<PageId>,
    next_page_id: PageId,
}

/// Buffer pool manager over typed page payloads.
///
/// Pages are handed out as `Arc<RwLock<P>>`; the per-page `RwLock` is the
/// page latch. Every fetch pins the page; the pin must be released exactly
/// once via `unpin_page` (the guard types in `storage::page::page_guard` do
/// this on drop). Unpinned pages are evicted in FIFO order to the page store
/// once all frames are occupied.
pub struct BufferPoolManager<P> {
    pool_size: usize,
    state: Mutex<PoolState<P>>,
}

impl<P> BufferPoolManager<P> {
    pub fn new(pool_size: usize) -> Self {
        assert!(pool_size > 0, "pool must have at least one frame");
        Self {
            pool_size,
            state: Mutex::new(PoolState {
                frames: HashMap::new(),
                store: HashMap::new(),
                evict_queue: VecDeque::new(),
                next_page_id: 0,
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of page ids handed out so far. Page ids are never reused.
    pub fn allocated_pages(&self) -> PageId {
        self.state.lock().next_page_id
    }

    /// Allocates a fresh page holding `payload`, pinned once.
    /// Returns `None` if every frame is pinned.
    pub fn new_page(&self, payload: P) -> Option<(PageId, Arc<RwLock<P>>)> {
        let mut state = self.state.lock();
        if !Self::make_room(&mut state, self.pool_size) {
            warn!("new_page failed: all {} frames are pinned", self.pool_size);
            return None;
        }
        let page_id = state.next_page_id;
        state.next_page_id += 1;
        let page = Arc::new(RwLock::new(payload));
        state.frames.insert(
            page_id,
            Frame {
                page: Arc::clone(&page),
                pin_count: 1,
                is_dirty: false,
            },
        );
        debug!("allocated page {page_id}");
        Some((page_id, page))
    }

    /// Fetches an existing page, pinning it. Returns `None` if the page does
    /// not exist (never created or deleted) or if every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Option<Arc<RwLock<P>>> {
        let mut state = self.state.lock();
        if let Some(frame) = state.frames.get_mut(&page_id) {
            frame.pin_count += 1;
            let page = Arc::clone(&frame.page);
            if frame.pin_count == 1 {
                state.evict_queue.retain(|&id| id != page_id);
            }
            return Some(page);
        }
        if !state.store.contains_key(&page_id) {
            return None;
        }
        if !Self::make_room(&mut state, self.pool_size) {
            warn!("fetch_page({page_id}) failed: all {} frames are pinned", self.pool_size);
            return None;
        }
        let page = state.store.remove(&page_id).expect("checked above");
        state.frames.insert(
            page_id,
            Frame {
                page: Arc::clone(&page),
                pin_count: 1,
                is_dirty: false,
            },
        );
        Some(page)
    }

    /// Drops one pin on `page_id`, recording whether the caller dirtied it.
    /// Returns false if the page is not resident or not pinned.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.state.lock();
        let Some(frame) = state.frames.get_mut(&page_id) else {
            warn!("unpin_page({page_id}): page is not resident");
            return false;
        };
        if frame.pin_count == 0 {
            warn!("unpin_page({page_id}): page is not pinned");
            return false;
        }
        frame.pin_count -= 1;
        frame.is_dirty |= is_dirty;
        if frame.pin_count == 0 {
            state.evict_queue.push_back(page_id);
        }
        true
    }

    /// Deletes `page_id` from the pool and the page store.
    /// Fails (returning false) if the page is currently pinned.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        match self.try_delete_page(page_id) {
            Ok(()) => true,
            Err(e) => {
                warn!("delete_page({page_id}) failed: {e}");
                false
            }
        }
    }

    fn try_delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        if let Some(frame) = state.frames.get(&page_id) {
            if frame.pin_count > 0 {
                return Err(BufferPoolError::PagePinned(page_id, frame.pin_count));
            }
            state.frames.remove(&page_id);
            state.evict_queue.retain(|&id| id != page_id);
            debug!("deleted resident page {page_id}");
            return Ok(());
        }
        if state.store.remove(&page_id).is_some() {
            debug!("deleted stored page {page_id}");
            return Ok(());
        }
        Err(BufferPoolError::PageNotFound(page_id))
    }

    /// Pin count of a page: `Some(0)` for evicted pages, `None` for pages
    /// that were never created or have been deleted.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        if let Some(frame) = state.frames.get(&page_id) {
            return Some(frame.pin_count);
        }
        if state.store.contains_key(&page_id) {
            return Some(0);
        }
        None
    }

    /// Makes sure at least one frame is free, evicting an unpinned page if
    /// necessary. Returns false when every frame is pinned.
    fn make_room(state: &mut PoolState<P>, pool_size: usize) -> bool {
        if state.frames.len() < pool_size {
            return true;
        }
        let Some(victim) = state.evict_queue.pop_front() else {
            return false;
        };
        let frame = state
            .frames
            .remove(&victim)
            .expect("evict queue entries are resident");
        debug_assert_eq!(frame.pin_count, 0);
        state.store.insert(victim, frame.page);
        debug!("evicted page {victim} to the page store");
        true
    }
}

impl<P> Default for BufferPoolManager<P> {
    fn default() -> Self {
        Self::new(BUFFER_POOL_SIZE)
    }
}

impl<P> std::fmt::Debug for BufferPoolManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BufferPoolManager")
            .field("pool_size", &self.pool_size)
            .field("resident", &state.frames.len())
            .field("stored", &state.store.len())
            .field("next_page_id", &state.next_page_id)
            .finish()
    }
}
