use crate::buffer::FrameId;
use crate::error::ChalkDBResult;

pub mod lru_k;

pub trait Replacer {
    fn record_access(&mut self, frame_id: FrameId) -> ChalkDBResult<()>;

    fn evict(&mut self) -> Option<FrameId>;

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> ChalkDBResult<()>;

    fn remove(&mut self, frame_id: FrameId);

    fn size(&self) -> usize;
}
