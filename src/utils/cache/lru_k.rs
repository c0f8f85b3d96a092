use std::collections::{HashMap, VecDeque};

use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{ChalkDBError, ChalkDBResult};

#[derive(Debug)]
struct LRUKNode {
    access_count: usize,
    is_evictable: bool,
}

/// LRU-K replacement policy.
///
/// Frames with fewer than `k` recorded accesses sit in `history_queue`
/// ordered FIFO by first access; frames with at least `k` accesses sit in
/// `cache_queue` ordered by least recent access. Eviction prefers the
/// history queue, then the cache queue, skipping non-evictable frames.
#[derive(Debug)]
pub struct LRUKReplacer {
    node_store: HashMap<FrameId, LRUKNode>,
    history_queue: VecDeque<FrameId>,
    cache_queue: VecDeque<FrameId>,
    current_size: usize,
    replacer_size: usize,
    k: usize,
}

impl LRUKReplacer {
    pub fn new(num_frames: usize, k: usize) -> Self {
        assert!(k > 0, "lru-k requires k > 0");
        Self {
            node_store: HashMap::with_capacity(num_frames),
            history_queue: VecDeque::new(),
            cache_queue: VecDeque::new(),
            current_size: 0,
            replacer_size: num_frames,
            k,
        }
    }

    fn detach(queue: &mut VecDeque<FrameId>, frame_id: FrameId) {
        if let Some(pos) = queue.iter().position(|f| *f == frame_id) {
            queue.remove(pos);
        }
    }
}

impl Replacer for LRUKReplacer {
    fn record_access(&mut self, frame_id: FrameId) -> ChalkDBResult<()> {
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            node.access_count += 1;
            if node.access_count == self.k {
                // Promote from the FIFO queue to the LRU queue.
                Self::detach(&mut self.history_queue, frame_id);
                self.cache_queue.push_back(frame_id);
            } else if node.access_count > self.k {
                Self::detach(&mut self.cache_queue, frame_id);
                self.cache_queue.push_back(frame_id);
            }
            Ok(())
        } else {
            if self.node_store.len() >= self.replacer_size {
                return Err(ChalkDBError::Internal(format!(
                    "frame {} exceeds replacer capacity {}",
                    frame_id, self.replacer_size
                )));
            }
            let node = LRUKNode {
                access_count: 1,
                is_evictable: false,
            };
            self.node_store.insert(frame_id, node);
            if self.k == 1 {
                self.cache_queue.push_back(frame_id);
            } else {
                self.history_queue.push_back(frame_id);
            }
            Ok(())
        }
    }

    fn evict(&mut self) -> Option<FrameId> {
        if self.current_size == 0 {
            return None;
        }
        let victim = self
            .history_queue
            .iter()
            .chain(self.cache_queue.iter())
            .copied()
            .find(|f| self.node_store[f].is_evictable)?;
        Self::detach(&mut self.history_queue, victim);
        Self::detach(&mut self.cache_queue, victim);
        self.node_store.remove(&victim);
        self.current_size -= 1;
        Some(victim)
    }

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> ChalkDBResult<()> {
        let Some(node) = self.node_store.get_mut(&frame_id) else {
            return Err(ChalkDBError::Internal(format!(
                "frame {} not tracked by replacer",
                frame_id
            )));
        };
        if set_evictable && !node.is_evictable {
            self.current_size += 1;
        } else if !set_evictable && node.is_evictable {
            self.current_size -= 1;
        }
        node.is_evictable = set_evictable;
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(node) = self.node_store.get(&frame_id) {
            assert!(node.is_evictable, "cannot remove a non-evictable frame");
            Self::detach(&mut self.history_queue, frame_id);
            Self::detach(&mut self.cache_queue, frame_id);
            self.node_store.remove(&frame_id);
            self.current_size -= 1;
        }
    }

    fn size(&self) -> usize {
        self.current_size
    }
}
