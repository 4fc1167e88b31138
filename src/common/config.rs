pub const INVALID_PAGE_ID: PageId = u64::MAX; // invalid page id
pub const HEADER_PAGE_ID: PageId = 0; // the header page id
pub const DB_PAGE_SIZE: usize = 4096; // size of a data page in bytes
pub const BUFFER_POOL_SIZE: usize = 64; // default size of the buffer pool
pub const BUCKET_SIZE: usize = 50; // default size of an extendible hash bucket
pub const DEFAULT_LEAF_MAX_SIZE: usize = 32; // default leaf page fanout
pub const DEFAULT_INTERNAL_MAX_SIZE: usize = 32; // default internal page fanout

pub type FrameId = usize; // frame id type
pub type PageId = u64; // page id type
pub type SlotOffset = u32; // slot offset type
