use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::buffer::page::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::error::{ChalkDBError, ChalkDBResult};
use crate::storage::disk_scheduler::DiskScheduler;

pub type FrameId = usize;

/// Bookkeeping the pool keeps next to every cached page.
#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub page_id: PageId,
    pub pin_count: u32,
    pub is_dirty: bool,
}

impl Default for FrameMeta {
    fn default() -> Self {
        Self {
            page_id: INVALID_PAGE_ID,
            pin_count: 0,
            is_dirty: false,
        }
    }
}

/// Frame storage: one contiguous arena of page bytes plus, per frame, a
/// reader/writer latch over the bytes and a mutex-guarded `FrameMeta`.
/// Page bytes are only touched through `frame_slice`/`frame_slice_mut`
/// while the corresponding frame latch is held by a page guard.
#[derive(Debug)]
pub struct BufferPool {
    arena: Box<[UnsafeCell<u8>]>,
    locks: Vec<RwLock<()>>,
    meta: Vec<Mutex<FrameMeta>>,
    free_list: Mutex<VecDeque<FrameId>>,
    disk_scheduler: Arc<DiskScheduler>,
}

unsafe impl Sync for BufferPool {}

impl BufferPool {
    pub fn new(num_pages: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let mut free_list = VecDeque::with_capacity(num_pages);
        let mut meta = Vec::with_capacity(num_pages);
        let mut locks = Vec::with_capacity(num_pages);
        for frame_id in 0..num_pages {
            free_list.push_back(frame_id);
            meta.push(Mutex::new(FrameMeta::default()));
            locks.push(RwLock::new(()));
        }

        let mut arena_vec: Vec<UnsafeCell<u8>> = Vec::with_capacity(num_pages * PAGE_SIZE);
        arena_vec.resize_with(num_pages * PAGE_SIZE, || UnsafeCell::new(0u8));

        Self {
            arena: arena_vec.into_boxed_slice(),
            locks,
            meta,
            free_list: Mutex::new(free_list),
            disk_scheduler,
        }
    }

    pub fn capacity(&self) -> usize {
        self.locks.len()
    }

    pub fn frame_lock(&self, frame_id: FrameId) -> &RwLock<()> {
        &self.locks[frame_id]
    }

    pub fn frame_meta(&self, frame_id: FrameId) -> MutexGuard<'_, FrameMeta> {
        self.meta[frame_id].lock()
    }

    /// # Safety
    /// The caller must hold the frame's read or write latch.
    pub unsafe fn frame_slice(&self, frame_id: FrameId) -> &[u8] {
        let ptr = self.frame_ptr(frame_id) as *const u8;
        std::slice::from_raw_parts(ptr, PAGE_SIZE)
    }

    /// # Safety
    /// The caller must hold the frame's write latch (or otherwise own the
    /// frame exclusively, e.g. before it is published in the directory).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_slice_mut(&self, frame_id: FrameId) -> &mut [u8] {
        let ptr = self.frame_ptr(frame_id);
        std::slice::from_raw_parts_mut(ptr, PAGE_SIZE)
    }

    unsafe fn frame_ptr(&self, frame_id: FrameId) -> *mut u8 {
        self.arena.as_ptr().add(frame_id * PAGE_SIZE) as *mut u8
    }

    pub fn reset_frame_bytes(&self, frame_id: FrameId) {
        unsafe {
            self.frame_slice_mut(frame_id).fill(0);
        }
    }

    pub fn pop_free_frame(&self) -> Option<FrameId> {
        self.free_list.lock().pop_front()
    }

    pub fn push_free_frame(&self, frame_id: FrameId) {
        self.free_list.lock().push_back(frame_id);
    }

    pub fn has_free_frame(&self) -> bool {
        !self.free_list.lock().is_empty()
    }

    pub fn free_frame_count(&self) -> usize {
        self.free_list.lock().len()
    }

    pub fn load_page_into_frame(&self, page_id: PageId, frame_id: FrameId) -> ChalkDBResult<()> {
        let page_bytes = self.read_page_from_disk(page_id)?;
        let slice = unsafe { self.frame_slice_mut(frame_id) };
        let len = PAGE_SIZE.min(page_bytes.len());
        slice[..len].copy_from_slice(&page_bytes[..len]);
        if len < PAGE_SIZE {
            slice[len..].fill(0);
        }
        Ok(())
    }

    pub fn write_page_to_disk(&self, page_id: PageId, bytes: Bytes) -> ChalkDBResult<()> {
        self.disk_scheduler
            .schedule_write(page_id, bytes)?
            .recv()
            .map_err(|e| ChalkDBError::Internal(format!("channel disconnected: {}", e)))??;
        Ok(())
    }

    pub fn read_page_from_disk(&self, page_id: PageId) -> ChalkDBResult<BytesMut> {
        self.disk_scheduler
            .schedule_read(page_id)?
            .recv()
            .map_err(|e| ChalkDBError::Internal(format!("channel disconnected: {}", e)))?
    }

    pub fn allocate_page_id(&self) -> ChalkDBResult<PageId> {
        self.disk_scheduler
            .schedule_allocate()?
            .recv()
            .map_err(|e| ChalkDBError::Internal(format!("channel disconnected: {}", e)))?
    }

    pub fn deallocate_page_id(&self, page_id: PageId) -> ChalkDBResult<()> {
        self.disk_scheduler
            .schedule_deallocate(page_id)?
            .recv()
            .map_err(|e| ChalkDBError::Internal(format!("channel disconnected: {}", e)))??;
        Ok(())
    }

    pub fn disk_scheduler(&self) -> Arc<DiskScheduler> {
        self.disk_scheduler.clone()
    }
}
