mod buffer_manager;
mod buffer_pool;
mod page;
mod page_table;

pub use buffer_manager::BufferPoolManager;
pub use buffer_pool::{BufferPool, FrameId, FrameMeta};
pub use page::{
    AtomicPageId, PageId, ReadPageGuard, WritePageGuard, HEADER_PAGE_ID, INVALID_PAGE_ID,
    PAGE_SIZE,
};
pub use page_table::ExtendibleHashTable;
