use std::mem::{self, ManuallyDrop};
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use log::error;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use super::buffer_manager::BufferPoolManager;
use super::buffer_pool::{BufferPool, FrameId, FrameMeta};

pub type PageId = u32;
pub type AtomicPageId = AtomicU32;

pub const INVALID_PAGE_ID: PageId = u32::MAX;
pub const HEADER_PAGE_ID: PageId = 0;
pub const PAGE_SIZE: usize = 4096;

/// Shared handle to a cached page: holds one pin and the frame's read
/// latch until dropped.
#[derive(Debug)]
pub struct ReadPageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    guard: ManuallyDrop<RwLockReadGuard<'static, ()>>,
}

impl ReadPageGuard {
    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn page_id(&self) -> PageId {
        self.meta_snapshot().page_id
    }

    pub fn pin_count(&self) -> u32 {
        self.meta_snapshot().pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.meta_snapshot().is_dirty
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn meta_snapshot(&self) -> FrameMeta {
        self.pool.frame_meta(self.frame_id).clone()
    }
}

impl Drop for ReadPageGuard {
    fn drop(&mut self) {
        let page_id = self.meta_snapshot().page_id;
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if !self.bpm.unpin_page(page_id, false) {
            error!("failed to unpin page {} from read guard", page_id);
        }
    }
}

/// Exclusive handle to a cached page: holds one pin and the frame's write
/// latch until dropped. Mutations must be followed by `mark_dirty` (or go
/// through `overwrite`) so the eviction path writes the frame back.
#[derive(Debug)]
pub struct WritePageGuard {
    bpm: Arc<BufferPoolManager>,
    pool: Arc<BufferPool>,
    frame_id: FrameId,
    guard: ManuallyDrop<RwLockWriteGuard<'static, ()>>,
    dirtied: bool,
}

impl WritePageGuard {
    pub fn data(&self) -> &[u8] {
        unsafe { self.pool.frame_slice(self.frame_id) }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { self.pool.frame_slice_mut(self.frame_id) }
    }

    pub fn page_id(&self) -> PageId {
        self.meta_snapshot().page_id
    }

    pub fn pin_count(&self) -> u32 {
        self.meta_snapshot().pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.meta_snapshot().is_dirty
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn mark_dirty(&mut self) {
        self.dirtied = true;
        self.pool.frame_meta(self.frame_id).is_dirty = true;
    }

    /// Replace the full page image.
    pub fn overwrite(&mut self, data: &[u8]) {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let slice = unsafe { self.pool.frame_slice_mut(self.frame_id) };
        slice.copy_from_slice(data);
        self.mark_dirty();
    }

    pub fn meta_snapshot(&self) -> FrameMeta {
        self.pool.frame_meta(self.frame_id).clone()
    }
}

impl Drop for WritePageGuard {
    fn drop(&mut self) {
        let page_id = self.meta_snapshot().page_id;
        let dirtied = self.dirtied;
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
        if !self.bpm.unpin_page(page_id, dirtied) {
            error!("failed to unpin page {} from write guard", page_id);
        }
    }
}

pub(crate) fn new_read_guard(bpm: Arc<BufferPoolManager>, frame_id: FrameId) -> ReadPageGuard {
    let pool = bpm.buffer_pool();
    let guard = pool.frame_lock(frame_id).read();
    // The guard borrows from the pool, which the page guard keeps alive via
    // its own Arc, so extending the lifetime is sound.
    let guard_static: RwLockReadGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockReadGuard<'_, ()>, RwLockReadGuard<'static, ()>>(guard) };
    ReadPageGuard {
        bpm,
        pool,
        frame_id,
        guard: ManuallyDrop::new(guard_static),
    }
}

pub(crate) fn new_write_guard(bpm: Arc<BufferPoolManager>, frame_id: FrameId) -> WritePageGuard {
    let pool = bpm.buffer_pool();
    let guard = pool.frame_lock(frame_id).write();
    let guard_static: RwLockWriteGuard<'static, ()> =
        unsafe { mem::transmute::<RwLockWriteGuard<'_, ()>, RwLockWriteGuard<'static, ()>>(guard) };
    WritePageGuard {
        bpm,
        pool,
        frame_id,
        guard: ManuallyDrop::new(guard_static),
        dirtied: false,
    }
}
