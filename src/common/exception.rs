use crate::common::config::PageId;
use thiserror::Error;

/// Errors surfaced by the buffer pool manager. Exhaustion on
/// `new_page`/`fetch_page` and a redundant unpin are reported through the
/// return value instead; only page deletion has failure modes worth naming.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferPoolError {
    #[error("page {0} not found in the pool or the page store")]
    PageNotFound(PageId),
    #[error("page {0} is pinned ({1} pins) and cannot be deleted")]
    PagePinned(PageId, u32),
}
