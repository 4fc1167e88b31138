use crate::buffer::buffer_pool_manager::BufferPoolManager;
use crate::common::config::PageId;
use log::trace;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A pinned page. The pin is dropped exactly once, when this handle drops,
/// reporting whether the holder dirtied the page. Latching goes through
/// `read_owned`/`write_owned`, which consume the pin so latch and pin share
/// one lifetime.
pub struct PageRef<P> {
    bpm: Arc<BufferPoolManager<P>>,
    page: Arc<RwLock<P>>,
    page_id: PageId,
    dirty: bool,
}

impl<P> PageRef<P> {
    /// Fetches and pins an existing page. `None` if the page does not exist
    /// or the pool has no evictable frame.
    pub fn fetch(bpm: &Arc<BufferPoolManager<P>>, page_id: PageId) -> Option<Self> {
        let page = bpm.fetch_page(page_id)?;
        Some(Self {
            bpm: Arc::clone(bpm),
            page,
            page_id,
            dirty: false,
        })
    }

    /// Allocates and pins a fresh page holding `payload`.
    pub fn allocate(bpm: &Arc<BufferPoolManager<P>>, payload: P) -> Option<Self> {
        let (page_id, page) = bpm.new_page(payload)?;
        Some(Self {
            bpm: Arc::clone(bpm),
            page,
            page_id,
            dirty: false,
        })
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Takes the page's read latch. The latch is released before the unpin
    /// when the returned guard drops.
    pub fn read_owned(self) -> ReadPageGuard<P> {
        let guard = RwLock::read_arc(&self.page);
        ReadPageGuard { guard, pin: self }
    }

    /// Takes the page's write latch.
    pub fn write_owned(self) -> WritePageGuard<P> {
        let guard = RwLock::write_arc(&self.page);
        WritePageGuard { guard, pin: self }
    }
}

impl<P> Drop for PageRef<P> {
    fn drop(&mut self) {
        trace!("unpin page {} (dirty: {})", self.page_id, self.dirty);
        self.bpm.unpin_page(self.page_id, self.dirty);
    }
}

/// Read latch + pin on one page. Fields drop in declaration order: the latch
/// is released first, then the pin.
pub struct ReadPageGuard<P> {
    guard: ArcRwLockReadGuard<RawRwLock, P>,
    pin: PageRef<P>,
}

impl<P> ReadPageGuard<P> {
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }
}

impl<P> Deref for ReadPageGuard<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.guard
    }
}

/// Write latch + pin on one page. Mutators must call `mark_dirty` so the
/// unpin reports the page as dirty.
pub struct WritePageGuard<P> {
    guard: ArcRwLockWriteGuard<RawRwLock, P>,
    pin: PageRef<P>,
}

impl<P> WritePageGuard<P> {
    pub fn page_id(&self) -> PageId {
        self.pin.page_id
    }

    pub fn mark_dirty(&mut self) {
        self.pin.dirty = true;
    }
}

impl<P> Deref for WritePageGuard<P> {
    type Target = P;

    fn deref(&self) -> &P {
        &self.guard
    }
}

impl<P> DerefMut for WritePageGuard<P> {
    fn deref_mut(&mut self) -> &mut P {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::logger::initialize_logger;

    fn pool() -> Arc<BufferPoolManager<i32>> {
        initialize_logger();
        Arc::new(BufferPoolManager::new(4))
    }

    #[test]
    fn test_pin_released_on_drop() {
        let bpm = pool();
        let page = PageRef::allocate(&bpm, 7).unwrap();
        let id = page.page_id();
        assert_eq!(bpm.pin_count(id), Some(1));
        drop(page);
        assert_eq!(bpm.pin_count(id), Some(0));
    }

    #[test]
    fn test_write_guard_marks_dirty_and_unpins() {
        let bpm = pool();
        let page = PageRef::allocate(&bpm, 0).unwrap();
        let id = page.page_id();
        {
            let mut guard = page.write_owned();
            *guard = 41;
            guard.mark_dirty();
            assert_eq!(bpm.pin_count(id), Some(1));
        }
        assert_eq!(bpm.pin_count(id), Some(0));
        let guard = PageRef::fetch(&bpm, id).unwrap().read_owned();
        assert_eq!(*guard, 41);
    }

    #[test]
    fn test_concurrent_readers() {
        let bpm = pool();
        let page = PageRef::allocate(&bpm, 3).unwrap();
        let id = page.page_id();
        drop(page);

        let a = PageRef::fetch(&bpm, id).unwrap().read_owned();
        let b = PageRef::fetch(&bpm, id).unwrap().read_owned();
        assert_eq!(*a, 3);
        assert_eq!(*b, 3);
        assert_eq!(bpm.pin_count(id), Some(2));
        drop(a);
        drop(b);
        assert_eq!(bpm.pin_count(id), Some(0));
    }
}
