use std::sync::Arc;

use crate::buffer::{ReadPageGuard, INVALID_PAGE_ID};
use crate::error::ChalkDBResult;
use crate::storage::codec::BPlusTreeLeafPageCodec;
use crate::storage::index::btree_index::BPlusTreeIndex;
use crate::storage::page::{Key, RecordId};

/// Forward iterator over the leaf chain. Holds a read latch (and pin) on
/// the current leaf only; stepping to the next leaf acquires the next
/// latch before the previous one is released.
#[derive(Debug)]
pub struct TreeIndexIterator {
    index: Arc<BPlusTreeIndex>,
    current_guard: Option<ReadPageGuard>,
    cursor: usize,
}

impl TreeIndexIterator {
    pub(crate) fn with_position(
        index: Arc<BPlusTreeIndex>,
        current_guard: Option<ReadPageGuard>,
        cursor: usize,
    ) -> Self {
        Self {
            index,
            current_guard,
            cursor,
        }
    }

    /// Next entry in key order, or None once the chain is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> ChalkDBResult<Option<(Key, RecordId)>> {
        loop {
            let Some(guard) = self.current_guard.as_ref() else {
                return Ok(None);
            };
            let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data(), self.index.comparator)?;
            if self.cursor < leaf.header.current_size as usize {
                let entry = leaf.kv_at(self.cursor).clone();
                self.cursor += 1;
                return Ok(Some(entry));
            }
            if leaf.header.next_page_id == INVALID_PAGE_ID {
                self.current_guard = None;
                return Ok(None);
            }
            let next_guard = self
                .index
                .buffer_pool
                .fetch_page_read(leaf.header.next_page_id)?;
            // Assigning drops the previous guard after the next one is held.
            self.current_guard = Some(next_guard);
            self.cursor = 0;
        }
    }
}
