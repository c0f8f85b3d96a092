use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;

use crate::buffer::buffer_pool::{BufferPool, FrameId, FrameMeta};
use crate::buffer::page::{self, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID};
use crate::buffer::page_table::ExtendibleHashTable;
use crate::config::BufferPoolConfig;
use crate::error::{ChalkDBError, ChalkDBResult};
use crate::storage::disk_scheduler::DiskScheduler;
use crate::utils::cache::lru_k::LRUKReplacer;
use crate::utils::cache::Replacer;

/// The buffer pool manager: a fixed set of frames cached over the disk
/// file, an extendible-hash directory from page id to frame id, and an
/// LRU-K replacer advising eviction.
///
/// Ownership contract: `new_page` / `fetch_page_*` hand out guards that
/// hold one pin each; dropping the guard unpins. A page with a positive
/// pin count is never evicted, and at most one frame caches any page id.
#[derive(Debug)]
pub struct BufferPoolManager {
    pool: Arc<BufferPool>,
    replacer: Mutex<LRUKReplacer>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    // Serializes loads (and eviction write-backs) of the same page id so
    // two fetches cannot double-load one page into two frames.
    inflight: DashMap<PageId, Arc<Mutex<()>>>,
}

impl BufferPoolManager {
    pub fn new(num_pages: usize, disk_scheduler: Arc<DiskScheduler>) -> Self {
        Self::new_with_config(
            BufferPoolConfig {
                buffer_pool_size: num_pages,
                ..Default::default()
            },
            disk_scheduler,
        )
    }

    pub fn new_with_config(config: BufferPoolConfig, disk_scheduler: Arc<DiskScheduler>) -> Self {
        let pool = Arc::new(BufferPool::new(config.buffer_pool_size, disk_scheduler));
        Self {
            replacer: Mutex::new(LRUKReplacer::new(config.buffer_pool_size, config.lru_k_k)),
            page_table: ExtendibleHashTable::new(config.page_table_bucket_size),
            inflight: DashMap::new(),
            pool,
        }
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        self.pool.clone()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.capacity()
    }

    pub fn lookup_frame(&self, page_id: PageId) -> Option<FrameId> {
        self.page_table.find(&page_id)
    }

    pub fn frame_meta_snapshot(&self, frame_id: FrameId) -> FrameMeta {
        self.pool.frame_meta(frame_id).clone()
    }

    pub fn evictable_count(&self) -> usize {
        self.replacer.lock().size()
    }

    /// Allocate a fresh page and return it pinned behind a write guard.
    pub fn new_page(self: &Arc<Self>) -> ChalkDBResult<WritePageGuard> {
        let frame_id = self.allocate_frame()?;
        let page_id = match self.pool.allocate_page_id() {
            Ok(page_id) => page_id,
            Err(e) => {
                self.pool.push_free_frame(frame_id);
                return Err(e);
            }
        };

        self.pool.reset_frame_bytes(frame_id);
        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.page_id = page_id;
            meta.pin_count = 1;
            meta.is_dirty = false;
        }
        self.page_table.insert(page_id, frame_id);
        self.record_access(frame_id);
        self.set_frame_evictable(frame_id, false);
        Ok(page::new_write_guard(Arc::clone(self), frame_id))
    }

    pub fn fetch_page_read(self: &Arc<Self>, page_id: PageId) -> ChalkDBResult<ReadPageGuard> {
        let frame_id = self.pin_frame(page_id)?;
        Ok(page::new_read_guard(Arc::clone(self), frame_id))
    }

    pub fn fetch_page_write(self: &Arc<Self>, page_id: PageId) -> ChalkDBResult<WritePageGuard> {
        let frame_id = self.pin_frame(page_id)?;
        Ok(page::new_write_guard(Arc::clone(self), frame_id))
    }

    /// Drop one pin on a cached page, OR-ing in the dirty flag. Returns
    /// false if the page is not cached or has no outstanding pins.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return false;
        };
        let mut meta = self.pool.frame_meta(frame_id);
        if meta.page_id != page_id || meta.pin_count == 0 {
            return false;
        }
        meta.pin_count -= 1;
        if is_dirty {
            meta.is_dirty = true;
        }
        let now_unpinned = meta.pin_count == 0;
        drop(meta);
        if now_unpinned {
            self.set_frame_evictable(frame_id, true);
        }
        true
    }

    /// Write a cached page's bytes through to disk and clear its dirty
    /// flag. Pin counts are untouched. Returns false when the page is not
    /// cached (or the id is invalid).
    pub fn flush_page(&self, page_id: PageId) -> ChalkDBResult<bool> {
        if page_id == INVALID_PAGE_ID {
            return Ok(false);
        }
        let Some(frame_id) = self.page_table.find(&page_id) else {
            return Ok(false);
        };
        {
            let meta = self.pool.frame_meta(frame_id);
            if meta.page_id != page_id {
                return Ok(false);
            }
        }
        let bytes = {
            let _latch = self.pool.frame_lock(frame_id).read();
            Bytes::copy_from_slice(unsafe { self.pool.frame_slice(frame_id) })
        };
        self.pool.write_page_to_disk(page_id, bytes)?;
        self.pool.frame_meta(frame_id).is_dirty = false;
        Ok(true)
    }

    pub fn flush_all_pages(&self) -> ChalkDBResult<()> {
        for frame_id in 0..self.pool.capacity() {
            let page_id = {
                let meta = self.pool.frame_meta(frame_id);
                if meta.page_id == INVALID_PAGE_ID {
                    continue;
                }
                meta.page_id
            };
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drop a page from the pool and deallocate its id. Returns true when
    /// the page is gone (including "was never cached"), false when it is
    /// still pinned.
    pub fn delete_page(&self, page_id: PageId) -> ChalkDBResult<bool> {
        let flight = self.inflight_entry(page_id);
        let _load_guard = flight.lock();

        let Some(frame_id) = self.page_table.find(&page_id) else {
            self.pool.deallocate_page_id(page_id)?;
            self.release_inflight_entry(page_id, &flight);
            return Ok(true);
        };
        {
            let mut meta = self.pool.frame_meta(frame_id);
            if meta.page_id != page_id {
                // The frame was evicted and rebound while we waited.
                drop(meta);
                self.pool.deallocate_page_id(page_id)?;
                self.release_inflight_entry(page_id, &flight);
                return Ok(true);
            }
            if meta.pin_count > 0 {
                self.release_inflight_entry(page_id, &flight);
                return Ok(false);
            }
            self.page_table.remove(&page_id);
            *meta = FrameMeta::default();
        }
        {
            let mut replacer = self.replacer.lock();
            let _ = replacer.set_evictable(frame_id, true);
            replacer.remove(frame_id);
        }
        self.pool.reset_frame_bytes(frame_id);
        self.pool.push_free_frame(frame_id);
        self.pool.deallocate_page_id(page_id)?;
        self.release_inflight_entry(page_id, &flight);
        Ok(true)
    }

    fn record_access(&self, frame_id: FrameId) {
        let _ = self.replacer.lock().record_access(frame_id);
    }

    fn set_frame_evictable(&self, frame_id: FrameId, evictable: bool) {
        let _ = self.replacer.lock().set_evictable(frame_id, evictable);
    }

    fn inflight_entry(&self, page_id: PageId) -> Arc<Mutex<()>> {
        self.inflight
            .entry(page_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_inflight_entry(&self, page_id: PageId, entry: &Arc<Mutex<()>>) {
        // Only drop the map entry if nobody else picked it up meanwhile.
        if Arc::strong_count(entry) <= 2 {
            self.inflight.remove(&page_id);
        }
    }

    /// Resolve a page id to a pinned frame, loading from disk on a miss.
    fn pin_frame(&self, page_id: PageId) -> ChalkDBResult<FrameId> {
        if page_id == INVALID_PAGE_ID {
            return Err(ChalkDBError::Storage("invalid page id".to_string()));
        }
        loop {
            let frame_id = self.ensure_frame(page_id)?;
            {
                let mut meta = self.pool.frame_meta(frame_id);
                if meta.page_id != page_id {
                    // Lost a race with eviction between lookup and pin.
                    continue;
                }
                meta.pin_count += 1;
            }
            self.record_access(frame_id);
            self.set_frame_evictable(frame_id, false);
            return Ok(frame_id);
        }
    }

    fn ensure_frame(&self, page_id: PageId) -> ChalkDBResult<FrameId> {
        if let Some(frame_id) = self.page_table.find(&page_id) {
            return Ok(frame_id);
        }

        let flight = self.inflight_entry(page_id);
        let _load_guard = flight.lock();

        // Re-check: another thread may have loaded it while we waited.
        if let Some(frame_id) = self.page_table.find(&page_id) {
            self.release_inflight_entry(page_id, &flight);
            return Ok(frame_id);
        }

        let frame_id = match self.allocate_frame() {
            Ok(frame_id) => frame_id,
            Err(e) => {
                self.release_inflight_entry(page_id, &flight);
                return Err(e);
            }
        };
        if let Err(e) = self.pool.load_page_into_frame(page_id, frame_id) {
            self.pool.push_free_frame(frame_id);
            self.release_inflight_entry(page_id, &flight);
            return Err(e);
        }
        {
            let mut meta = self.pool.frame_meta(frame_id);
            meta.page_id = page_id;
            meta.pin_count = 0;
            meta.is_dirty = false;
        }
        self.page_table.insert(page_id, frame_id);
        self.release_inflight_entry(page_id, &flight);
        Ok(frame_id)
    }

    fn allocate_frame(&self) -> ChalkDBResult<FrameId> {
        if let Some(frame_id) = self.pool.pop_free_frame() {
            return Ok(frame_id);
        }
        self.evict_victim_frame()
    }

    fn evict_victim_frame(&self) -> ChalkDBResult<FrameId> {
        loop {
            let victim = {
                let mut replacer = self.replacer.lock();
                match replacer.evict() {
                    Some(frame_id) => frame_id,
                    None => {
                        return Err(ChalkDBError::Storage(
                            "cannot allocate frame: buffer pool is full".to_string(),
                        ))
                    }
                }
            };

            let victim_page = self.pool.frame_meta(victim).page_id;
            if victim_page == INVALID_PAGE_ID {
                // Cleared by a concurrent delete; frame is back on the
                // free list and not ours to reuse.
                continue;
            }

            // Hold the page's single-flight entry across write-back and
            // unmapping so a concurrent fetch waits and then reloads the
            // freshly written bytes from disk.
            let flight = self.inflight_entry(victim_page);
            let _load_guard = flight.lock();

            let is_dirty = {
                let meta = self.pool.frame_meta(victim);
                if meta.pin_count > 0 || meta.page_id != victim_page {
                    // Re-pinned (or rebound) after the replacer chose it;
                    // put it back under replacement tracking and retry.
                    drop(meta);
                    let mut replacer = self.replacer.lock();
                    let _ = replacer.record_access(victim);
                    let _ = replacer.set_evictable(victim, false);
                    self.release_inflight_entry(victim_page, &flight);
                    continue;
                }
                meta.is_dirty
            };

            // Write back while the frame is still mapped: a failed write
            // must leave the page reachable, not leak the frame.
            if is_dirty {
                debug!("evicting dirty page {}, writing back", victim_page);
                let bytes = Bytes::copy_from_slice(unsafe { self.pool.frame_slice(victim) });
                if let Err(e) = self.pool.write_page_to_disk(victim_page, bytes) {
                    let mut replacer = self.replacer.lock();
                    let _ = replacer.record_access(victim);
                    let _ = replacer.set_evictable(victim, true);
                    drop(replacer);
                    self.release_inflight_entry(victim_page, &flight);
                    return Err(e);
                }
            }

            {
                let mut meta = self.pool.frame_meta(victim);
                if meta.pin_count > 0 || meta.page_id != victim_page {
                    // A fetch pinned the page during the write-back; the
                    // frame stays, the disk copy is simply fresher.
                    drop(meta);
                    let mut replacer = self.replacer.lock();
                    let _ = replacer.record_access(victim);
                    let _ = replacer.set_evictable(victim, false);
                    self.release_inflight_entry(victim_page, &flight);
                    continue;
                }
                self.page_table.remove(&victim_page);
                *meta = FrameMeta::default();
            }
            self.pool.reset_frame_bytes(victim);
            self.release_inflight_entry(victim_page, &flight);
            return Ok(victim);
        }
    }
}
