use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::{RwLock, RwLockWriteGuard};

use crate::buffer::{BufferPoolManager, PageId, ReadPageGuard, WritePageGuard, INVALID_PAGE_ID};
use crate::error::{ChalkDBError, ChalkDBResult};
use crate::storage::codec::{
    BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec,
};
use crate::storage::index::btree_iterator::TreeIndexIterator;
use crate::storage::index::comparator::{i64_key, KeyComparator};
use crate::storage::index::root_directory::RootDirectory;
use crate::storage::page::{
    BPlusTreeInternalPage, BPlusTreeLeafPage, BPlusTreePage, Key, RecordId,
};

/// How a descent intends to use the leaf it lands on. Read modes crab
/// hand-over-hand with read latches; write modes keep the chain of write
/// latches from the lowest unsafe ancestor down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeType {
    Search,
    SearchLeftmost,
    SearchRightmost,
    Insert,
    Delete,
}

/// Latches held by a write descent: the root-id latch plus every ancestor
/// write guard not yet proven safe. Dropping the context releases all of
/// them, on every exit path.
pub struct Context<'a> {
    pub write_set: VecDeque<WritePageGuard>,
    pub root_latch_guard: Option<RwLockWriteGuard<'a, PageId>>,
}

impl<'a> Context<'a> {
    pub fn new() -> Self {
        Self {
            write_set: VecDeque::new(),
            root_latch_guard: None,
        }
    }

    /// A safe child shields everything above it; drop the held chain.
    pub fn release_ancestors(&mut self) {
        self.write_set.clear();
        self.root_latch_guard = None;
    }
}

impl<'a> Default for Context<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// Disk-resident B+tree over opaque byte keys, unique per key.
///
/// The root page id lives behind its own reader/writer latch and is kept
/// in sync with the root directory record named after the index.
#[derive(Debug)]
pub struct BPlusTreeIndex {
    pub name: String,
    pub buffer_pool: Arc<BufferPoolManager>,
    pub root_directory: Arc<RootDirectory>,
    pub comparator: KeyComparator,
    pub leaf_max_size: u32,
    pub internal_max_size: u32,
    root_page_id: RwLock<PageId>,
}

impl BPlusTreeIndex {
    pub fn new(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        root_directory: Arc<RootDirectory>,
        comparator: KeyComparator,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> ChalkDBResult<Self> {
        assert!(leaf_max_size >= 2, "leaf fanout too small");
        assert!(internal_max_size >= 3, "internal fanout too small");
        let name = name.into();
        root_directory.create_index(&name, INVALID_PAGE_ID)?;
        Ok(Self {
            name,
            buffer_pool,
            root_directory,
            comparator,
            leaf_max_size,
            internal_max_size,
            root_page_id: RwLock::new(INVALID_PAGE_ID),
        })
    }

    /// Reattach to an index previously registered in the root directory.
    pub fn open(
        name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        root_directory: Arc<RootDirectory>,
        comparator: KeyComparator,
        leaf_max_size: u32,
        internal_max_size: u32,
    ) -> ChalkDBResult<Self> {
        let name = name.into();
        let root_page_id = root_directory
            .lookup(&name)?
            .ok_or_else(|| ChalkDBError::Storage(format!("index {} not found", name)))?;
        Ok(Self {
            name,
            buffer_pool,
            root_directory,
            comparator,
            leaf_max_size,
            internal_max_size,
            root_page_id: RwLock::new(root_page_id),
        })
    }

    pub fn get_root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    pub fn is_empty(&self) -> bool {
        self.get_root_page_id() == INVALID_PAGE_ID
    }

    /// Point lookup. Returns None for a missing key.
    pub fn get_value(&self, key: &[u8]) -> ChalkDBResult<Option<RecordId>> {
        let Some(guard) = self.find_leaf_read(ModeType::Search, key)? else {
            return Ok(None);
        };
        let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data(), self.comparator)?;
        Ok(leaf.look_up(key))
    }

    /// Insert a key/value pair; false if the key is already present.
    pub fn insert(&self, key: &[u8], rid: RecordId) -> ChalkDBResult<bool> {
        let mut root_latch = self.root_page_id.write();
        if *root_latch == INVALID_PAGE_ID {
            let mut root_guard = self.buffer_pool.new_page()?;
            let root_id = root_guard.page_id();
            let mut leaf = BPlusTreeLeafPage::new(self.leaf_max_size, self.comparator);
            leaf.insert(key.to_vec(), rid);
            root_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
            drop(root_guard);
            *root_latch = root_id;
            self.root_directory.update_root(&self.name, root_id)?;
            debug!("index {}: started new tree at page {}", self.name, root_id);
            return Ok(true);
        }

        let mut context = Context::new();
        context.root_latch_guard = Some(root_latch);
        let mut leaf_guard = self.find_leaf_write(ModeType::Insert, key, &mut context)?;
        let (mut leaf, _) = BPlusTreeLeafPageCodec::decode(leaf_guard.data(), self.comparator)?;

        if !leaf.insert(key.to_vec(), rid) {
            return Ok(false);
        }
        if leaf.header.current_size < leaf.header.max_size {
            leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
            return Ok(true);
        }

        // The leaf filled up: move the upper half to a fresh sibling and
        // hand the risen key to the parent.
        let mut new_guard = self.buffer_pool.new_page()?;
        let new_page_id = new_guard.page_id();
        let mut new_leaf = BPlusTreeLeafPage::new(self.leaf_max_size, self.comparator);
        leaf.move_half_to(&mut new_leaf);
        new_leaf.header.next_page_id = leaf.header.next_page_id;
        leaf.header.next_page_id = new_page_id;
        new_leaf.header.parent_page_id = leaf.header.parent_page_id;
        let risen_key = new_leaf.key_at(0).clone();
        leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));
        new_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&new_leaf));

        self.insert_into_parent(leaf_guard, new_guard, risen_key, &mut context)?;
        Ok(true)
    }

    /// Remove a key; removing an absent key is a no-op.
    pub fn remove(&self, key: &[u8]) -> ChalkDBResult<()> {
        let root_latch = self.root_page_id.write();
        if *root_latch == INVALID_PAGE_ID {
            return Ok(());
        }
        let mut context = Context::new();
        context.root_latch_guard = Some(root_latch);
        let mut leaf_guard = self.find_leaf_write(ModeType::Delete, key, &mut context)?;
        let (mut leaf, _) = BPlusTreeLeafPageCodec::decode(leaf_guard.data(), self.comparator)?;

        if !leaf.remove(key) {
            return Ok(());
        }
        leaf_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&leaf));

        let is_root = context
            .root_latch_guard
            .as_ref()
            .map(|latch| **latch == leaf_guard.page_id())
            .unwrap_or(false);
        if is_root {
            if leaf.header.current_size == 0 {
                return self.adjust_root(leaf_guard, &mut context);
            }
            return Ok(());
        }
        if leaf.header.current_size >= leaf.min_size() {
            return Ok(());
        }
        self.coalesce_or_redistribute(leaf_guard, &mut context)
    }

    /// Iterator over the whole tree, ascending key order.
    pub fn begin(self: &Arc<Self>) -> ChalkDBResult<TreeIndexIterator> {
        let guard = self.find_leaf_read(ModeType::SearchLeftmost, &[])?;
        Ok(TreeIndexIterator::with_position(self.clone(), guard, 0))
    }

    /// Iterator starting at `key`, or at the first larger key if absent.
    pub fn begin_at(self: &Arc<Self>, key: &[u8]) -> ChalkDBResult<TreeIndexIterator> {
        let Some(guard) = self.find_leaf_read(ModeType::Search, key)? else {
            return Ok(self.end());
        };
        let (leaf, _) = BPlusTreeLeafPageCodec::decode(guard.data(), self.comparator)?;
        let (cursor, _) = leaf.find_key_index(key);
        Ok(TreeIndexIterator::with_position(
            self.clone(),
            Some(guard),
            cursor,
        ))
    }

    /// The exhausted iterator.
    pub fn end(self: &Arc<Self>) -> TreeIndexIterator {
        TreeIndexIterator::with_position(self.clone(), None, 0)
    }

    /// Test helper: insert whitespace-separated i64 keys from a file.
    pub fn insert_from_file(&self, path: impl AsRef<Path>) -> ChalkDBResult<()> {
        let contents = std::fs::read_to_string(path)?;
        for token in contents.split_whitespace() {
            let value: i64 = token
                .parse()
                .map_err(|e| ChalkDBError::Internal(format!("bad key {}: {}", token, e)))?;
            self.insert(&i64_key(value), RecordId::new(value as u32, value as u32))?;
        }
        Ok(())
    }

    /// Test helper: remove whitespace-separated i64 keys from a file.
    pub fn remove_from_file(&self, path: impl AsRef<Path>) -> ChalkDBResult<()> {
        let contents = std::fs::read_to_string(path)?;
        for token in contents.split_whitespace() {
            let value: i64 = token
                .parse()
                .map_err(|e| ChalkDBError::Internal(format!("bad key {}: {}", token, e)))?;
            self.remove(&i64_key(value))?;
        }
        Ok(())
    }

    /// Read-mode descent: hand-over-hand crabbing, parent released right
    /// after the child latch is held. Returns None on an empty tree.
    fn find_leaf_read(
        &self,
        mode: ModeType,
        key: &[u8],
    ) -> ChalkDBResult<Option<ReadPageGuard>> {
        debug_assert!(!matches!(mode, ModeType::Insert | ModeType::Delete));
        let root_latch = self.root_page_id.read();
        if *root_latch == INVALID_PAGE_ID {
            return Ok(None);
        }
        let mut guard = self.buffer_pool.fetch_page_read(*root_latch)?;
        drop(root_latch);

        loop {
            let (page, _) = BPlusTreePageCodec::decode(guard.data(), self.comparator)?;
            let internal = match page {
                BPlusTreePage::Leaf(_) => return Ok(Some(guard)),
                BPlusTreePage::Internal(internal) => internal,
            };
            let child_id = match mode {
                ModeType::SearchLeftmost => internal.value_at(0),
                ModeType::SearchRightmost => {
                    internal.value_at(internal.header.current_size as usize - 1)
                }
                _ => internal.look_up(key),
            };
            let child_guard = self.buffer_pool.fetch_page_read(child_id)?;
            guard = child_guard;
        }
    }

    /// Write-mode descent. The root-id latch and every ancestor write
    /// latch stay in `context` until a safe child proves them redundant.
    fn find_leaf_write(
        &self,
        mode: ModeType,
        key: &[u8],
        context: &mut Context<'_>,
    ) -> ChalkDBResult<WritePageGuard> {
        let root_id = **context
            .root_latch_guard
            .as_ref()
            .expect("write descent must hold the root latch");
        let mut guard = self.buffer_pool.fetch_page_write(root_id)?;
        let (mut page, _) = BPlusTreePageCodec::decode(guard.data(), self.comparator)?;
        if self.is_safe(&page, mode, true) {
            context.release_ancestors();
        }

        loop {
            let internal = match &page {
                BPlusTreePage::Leaf(_) => return Ok(guard),
                BPlusTreePage::Internal(internal) => internal,
            };
            let child_id = internal.look_up(key);
            let child_guard = self.buffer_pool.fetch_page_write(child_id)?;
            let (child_page, _) = BPlusTreePageCodec::decode(child_guard.data(), self.comparator)?;
            context.write_set.push_back(guard);
            guard = child_guard;
            if self.is_safe(&child_page, mode, false) {
                context.release_ancestors();
            }
            page = child_page;
        }
    }

    /// Can this node absorb one more insert/delete without a structural
    /// change spilling to its parent?
    fn is_safe(&self, page: &BPlusTreePage, mode: ModeType, is_root: bool) -> bool {
        match mode {
            ModeType::Search | ModeType::SearchLeftmost | ModeType::SearchRightmost => true,
            ModeType::Insert => match page {
                BPlusTreePage::Leaf(leaf) => {
                    leaf.header.current_size < leaf.header.max_size - 1
                }
                BPlusTreePage::Internal(internal) => {
                    internal.header.current_size <= internal.header.max_size - 1
                }
            },
            ModeType::Delete => {
                if is_root {
                    match page {
                        BPlusTreePage::Leaf(leaf) => {
                            leaf.header.current_size >= self.leaf_max_size.div_ceil(2) + 1
                        }
                        BPlusTreePage::Internal(internal) => {
                            internal.header.current_size
                                >= (self.internal_max_size + 1).div_ceil(2) + 1
                        }
                    }
                } else {
                    page.size() >= page.min_size() + 1
                }
            }
        }
    }

    /// Propagate a split: link `(risen_key, new_page)` into the parent of
    /// `old_page`, splitting upward as long as parents overflow.
    fn insert_into_parent(
        &self,
        old_guard: WritePageGuard,
        new_guard: WritePageGuard,
        risen_key: Key,
        context: &mut Context<'_>,
    ) -> ChalkDBResult<()> {
        let mut old_guard = old_guard;
        let mut new_guard = new_guard;
        let mut risen_key = risen_key;

        loop {
            let old_id = old_guard.page_id();
            let new_id = new_guard.page_id();

            if context.write_set.is_empty() {
                // The split node was the root: grow the tree by one level.
                let mut root_guard = self.buffer_pool.new_page()?;
                let root_id = root_guard.page_id();
                let mut root =
                    BPlusTreeInternalPage::new(self.internal_max_size, self.comparator);
                root.init_sentinel(old_id);
                root.insert_after(old_id, risen_key, new_id);
                root_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&root));
                drop(root_guard);

                self.set_parent(&mut old_guard, root_id)?;
                self.set_parent(&mut new_guard, root_id)?;
                drop(old_guard);
                drop(new_guard);

                let latch = context
                    .root_latch_guard
                    .as_mut()
                    .expect("root split must hold the root latch");
                **latch = root_id;
                self.root_directory.update_root(&self.name, root_id)?;
                debug!("index {}: new root page {}", self.name, root_id);
                context.release_ancestors();
                return Ok(());
            }

            let mut parent_guard = context.write_set.pop_back().unwrap();
            let parent_id = parent_guard.page_id();
            let (mut parent, _) =
                BPlusTreeInternalPageCodec::decode(parent_guard.data(), self.comparator)?;
            parent.insert_after(old_id, risen_key, new_id);
            self.set_parent(&mut new_guard, parent_id)?;
            drop(old_guard);
            drop(new_guard);

            if parent.header.current_size <= parent.header.max_size {
                parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
                return Ok(());
            }

            // Parent overflowed in turn.
            let mut new_parent_guard = self.buffer_pool.new_page()?;
            let new_parent_id = new_parent_guard.page_id();
            let mut new_parent =
                BPlusTreeInternalPage::new(self.internal_max_size, self.comparator);
            let parent_risen = parent.move_half_to(&mut new_parent);
            new_parent.header.parent_page_id = parent.header.parent_page_id;
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
            new_parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&new_parent));

            let moved: Vec<PageId> = new_parent.values().collect();
            self.reparent_children(&moved, new_parent_id)?;

            old_guard = parent_guard;
            new_guard = new_parent_guard;
            risen_key = parent_risen;
        }
    }

    /// Fix an underflowing non-root node by borrowing from a sibling or
    /// merging with it, recursing into the parent as needed.
    fn coalesce_or_redistribute(
        &self,
        node_guard: WritePageGuard,
        context: &mut Context<'_>,
    ) -> ChalkDBResult<()> {
        let node_is_root = context
            .root_latch_guard
            .as_ref()
            .map(|latch| **latch == node_guard.page_id())
            .unwrap_or(false);
        if node_is_root {
            return self.adjust_root(node_guard, context);
        }

        let mut parent_guard = context
            .write_set
            .pop_back()
            .expect("underflowing node must have a latched parent");
        let (mut parent, _) =
            BPlusTreeInternalPageCodec::decode(parent_guard.data(), self.comparator)?;
        let node_id = node_guard.page_id();
        let index = parent
            .value_index(node_id)
            .expect("node must appear in its parent");
        // Prefer the previous sibling; the leftmost child takes the next.
        let from_prev = index > 0;
        let sibling_index = if from_prev { index - 1 } else { index + 1 };
        let sibling_id = parent.value_at(sibling_index);
        let mut sibling_guard = self.buffer_pool.fetch_page_write(sibling_id)?;

        let (mut node_page, _) = BPlusTreePageCodec::decode(node_guard.data(), self.comparator)?;
        let (mut sibling_page, _) =
            BPlusTreePageCodec::decode(sibling_guard.data(), self.comparator)?;

        if sibling_page.size() > sibling_page.min_size() {
            // Redistribute one entry across and patch the separator.
            match (&mut node_page, &mut sibling_page) {
                (BPlusTreePage::Leaf(node), BPlusTreePage::Leaf(sibling)) => {
                    if from_prev {
                        let separator = node.borrow_last_from(sibling);
                        parent.set_key_at(index, separator);
                    } else {
                        let separator = node.borrow_first_from(sibling);
                        parent.set_key_at(index + 1, separator);
                    }
                }
                (BPlusTreePage::Internal(node), BPlusTreePage::Internal(sibling)) => {
                    let moved_child;
                    if from_prev {
                        let old_separator = parent.key_at(index).clone();
                        let risen = node.borrow_last_from(sibling, old_separator);
                        parent.set_key_at(index, risen);
                        moved_child = node.value_at(0);
                    } else {
                        let old_separator = parent.key_at(index + 1).clone();
                        let risen = node.borrow_first_from(sibling, old_separator);
                        parent.set_key_at(index + 1, risen);
                        moved_child = node.value_at(node.header.current_size as usize - 1);
                    }
                    self.reparent_children(&[moved_child], node_id)?;
                }
                _ => unreachable!("siblings are always the same node kind"),
            }
            let mut node_guard = node_guard;
            node_guard.overwrite(&BPlusTreePageCodec::encode(&node_page));
            sibling_guard.overwrite(&BPlusTreePageCodec::encode(&sibling_page));
            parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
            return Ok(());
        }

        // Merge, always into the left of the pair.
        let (mut left_guard, left_page, mut right_guard, right_page, separator_index) =
            if from_prev {
                (sibling_guard, sibling_page, node_guard, node_page, index)
            } else {
                (node_guard, node_page, sibling_guard, sibling_page, index + 1)
            };
        let separator = parent.key_at(separator_index).clone();
        let left_id = left_guard.page_id();
        let right_id = right_guard.page_id();

        match (left_page, right_page) {
            (BPlusTreePage::Leaf(mut left), BPlusTreePage::Leaf(mut right)) => {
                right.merge_all_into(&mut left);
                left_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&left));
                // Leave an empty husk so a straggling scan that already
                // resolved this page id keeps walking the chain.
                right_guard.overwrite(&BPlusTreeLeafPageCodec::encode(&right));
            }
            (BPlusTreePage::Internal(mut left), BPlusTreePage::Internal(mut right)) => {
                let moved: Vec<PageId> = right.values().collect();
                right.merge_all_into(&mut left, separator);
                left_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&left));
                right_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&right));
                self.reparent_children(&moved, left_id)?;
            }
            _ => unreachable!("siblings are always the same node kind"),
        }

        parent.remove_at(separator_index);
        parent_guard.overwrite(&BPlusTreeInternalPageCodec::encode(&parent));
        drop(left_guard);
        drop(right_guard);
        // Best effort: a concurrent scan may still pin the husk briefly.
        let _ = self.buffer_pool.delete_page(right_id)?;

        let parent_is_root = context
            .root_latch_guard
            .as_ref()
            .map(|latch| **latch == parent_guard.page_id())
            .unwrap_or(false);
        if parent_is_root {
            return self.adjust_root(parent_guard, context);
        }
        if parent.header.current_size < parent.min_size() {
            return self.coalesce_or_redistribute(parent_guard, context);
        }
        Ok(())
    }

    /// Shrink at the top: an empty root leaf empties the tree, a root
    /// internal down to one child hands the root to that child.
    fn adjust_root(
        &self,
        root_guard: WritePageGuard,
        context: &mut Context<'_>,
    ) -> ChalkDBResult<()> {
        let (page, _) = BPlusTreePageCodec::decode(root_guard.data(), self.comparator)?;
        match page {
            BPlusTreePage::Leaf(leaf) => {
                if leaf.header.current_size == 0 {
                    let old_root = root_guard.page_id();
                    {
                        let latch = context
                            .root_latch_guard
                            .as_mut()
                            .expect("root change must hold the root latch");
                        **latch = INVALID_PAGE_ID;
                    }
                    self.root_directory.update_root(&self.name, INVALID_PAGE_ID)?;
                    drop(root_guard);
                    let _ = self.buffer_pool.delete_page(old_root)?;
                    debug!("index {}: tree is now empty", self.name);
                }
            }
            BPlusTreePage::Internal(internal) => {
                if internal.header.current_size == 1 {
                    let old_root = root_guard.page_id();
                    let child_id = internal.value_at(0);
                    {
                        let mut child_guard = self.buffer_pool.fetch_page_write(child_id)?;
                        self.set_parent(&mut child_guard, INVALID_PAGE_ID)?;
                    }
                    {
                        let latch = context
                            .root_latch_guard
                            .as_mut()
                            .expect("root change must hold the root latch");
                        **latch = child_id;
                    }
                    self.root_directory.update_root(&self.name, child_id)?;
                    drop(root_guard);
                    let _ = self.buffer_pool.delete_page(old_root)?;
                    debug!("index {}: root collapsed to page {}", self.name, child_id);
                }
            }
        }
        Ok(())
    }

    fn set_parent(&self, guard: &mut WritePageGuard, parent_id: PageId) -> ChalkDBResult<()> {
        let (mut page, _) = BPlusTreePageCodec::decode(guard.data(), self.comparator)?;
        page.set_parent_page_id(parent_id);
        guard.overwrite(&BPlusTreePageCodec::encode(&page));
        Ok(())
    }

    fn reparent_children(&self, children: &[PageId], parent_id: PageId) -> ChalkDBResult<()> {
        for &child_id in children {
            let mut child_guard = self.buffer_pool.fetch_page_write(child_id)?;
            self.set_parent(&mut child_guard, parent_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use crate::storage::index::comparator::{decode_i64_key, default_comparator};
    use rand::seq::SliceRandom;
    use rand::thread_rng;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn setup_pool(pool_size: usize) -> (TempDir, Arc<BufferPoolManager>, Arc<RootDirectory>) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let bpm = Arc::new(BufferPoolManager::new(pool_size, disk_scheduler));
        let directory = Arc::new(RootDirectory::new(bpm.clone()));
        (temp_dir, bpm, directory)
    }

    fn create_index(
        leaf_max: u32,
        internal_max: u32,
    ) -> (TempDir, Arc<BufferPoolManager>, Arc<RootDirectory>, Arc<BPlusTreeIndex>) {
        let (tmp, bpm, directory) = setup_pool(64);
        let index = Arc::new(
            BPlusTreeIndex::new(
                "test_index",
                bpm.clone(),
                directory.clone(),
                default_comparator,
                leaf_max,
                internal_max,
            )
            .unwrap(),
        );
        (tmp, bpm, directory, index)
    }

    fn rid_for(value: i64) -> RecordId {
        RecordId::new(value as u32, value as u32)
    }

    fn insert_key(index: &BPlusTreeIndex, value: i64) -> bool {
        index.insert(&i64_key(value), rid_for(value)).unwrap()
    }

    fn collect_keys(index: &Arc<BPlusTreeIndex>) -> Vec<i64> {
        let mut iter = index.begin().unwrap();
        let mut out = Vec::new();
        while let Some((key, _)) = iter.next().unwrap() {
            out.push(decode_i64_key(&key).unwrap());
        }
        out
    }

    /// Walk the whole tree checking depth, occupancy, ordering and parent
    /// pointers.
    fn check_tree(index: &Arc<BPlusTreeIndex>) {
        let root_id = index.get_root_page_id();
        if root_id == INVALID_PAGE_ID {
            return;
        }
        let mut leaf_depths = Vec::new();
        visit(index, root_id, INVALID_PAGE_ID, 0, true, &mut leaf_depths);
        assert!(
            leaf_depths.windows(2).all(|w| w[0] == w[1]),
            "leaves at unequal depths: {:?}",
            leaf_depths
        );

        fn visit(
            index: &Arc<BPlusTreeIndex>,
            page_id: PageId,
            expected_parent: PageId,
            depth: usize,
            is_root: bool,
            leaf_depths: &mut Vec<usize>,
        ) {
            let guard = index.buffer_pool.fetch_page_read(page_id).unwrap();
            let (page, _) = BPlusTreePageCodec::decode(guard.data(), index.comparator).unwrap();
            assert_eq!(page.parent_page_id(), expected_parent, "page {}", page_id);
            assert!(page.size() <= page.max_size() , "page {} overfull", page_id);
            if !is_root {
                assert!(
                    page.size() >= page.min_size(),
                    "page {} underfull: {} < {}",
                    page_id,
                    page.size(),
                    page.min_size()
                );
            }
            match page {
                BPlusTreePage::Leaf(leaf) => {
                    for pair in leaf.array.windows(2) {
                        assert!(pair[0].0 < pair[1].0, "leaf {} keys out of order", page_id);
                    }
                    leaf_depths.push(depth);
                }
                BPlusTreePage::Internal(internal) => {
                    if is_root {
                        assert!(internal.header.current_size >= 2, "root internal too small");
                    }
                    for i in 2..internal.header.current_size as usize {
                        assert!(
                            internal.key_at(i - 1) < internal.key_at(i),
                            "internal {} keys out of order",
                            page_id
                        );
                    }
                    drop(guard);
                    for i in 0..internal.header.current_size as usize {
                        visit(
                            index,
                            internal.value_at(i),
                            page_id,
                            depth + 1,
                            false,
                            leaf_depths,
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn insert_and_get_basic() {
        let (_tmp, _bpm, _dir, index) = create_index(4, 4);
        assert!(index.is_empty());
        assert_eq!(index.get_value(&i64_key(1)).unwrap(), None);

        assert!(insert_key(&index, 1));
        assert!(!index.is_empty());
        assert_eq!(index.get_value(&i64_key(1)).unwrap(), Some(rid_for(1)));
        assert_eq!(index.get_value(&i64_key(2)).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_returns_false_without_mutation() {
        let (_tmp, _bpm, _dir, index) = create_index(4, 4);
        assert!(insert_key(&index, 7));
        assert!(!index.insert(&i64_key(7), RecordId::new(99, 99)).unwrap());
        // the original value is untouched
        assert_eq!(index.get_value(&i64_key(7)).unwrap(), Some(rid_for(7)));
        assert_eq!(collect_keys(&index), vec![7]);
    }

    #[test]
    fn fourth_insert_splits_the_root_leaf() {
        let (_tmp, _bpm, dir, index) = create_index(4, 4);
        for v in [10, 20, 30, 40] {
            assert!(insert_key(&index, v));
        }

        let root_id = index.get_root_page_id();
        assert_eq!(dir.lookup("test_index").unwrap(), Some(root_id));

        let root_guard = index.buffer_pool.fetch_page_read(root_id).unwrap();
        let (root, _) =
            BPlusTreeInternalPageCodec::decode(root_guard.data(), default_comparator).unwrap();
        assert_eq!(root.header.current_size, 2);
        assert_eq!(root.key_at(1), &i64_key(30));
        let left_id = root.value_at(0);
        let right_id = root.value_at(1);
        drop(root_guard);

        let left_guard = index.buffer_pool.fetch_page_read(left_id).unwrap();
        let (left, _) =
            BPlusTreeLeafPageCodec::decode(left_guard.data(), default_comparator).unwrap();
        assert_eq!(left.array.len(), 2);
        assert_eq!(left.key_at(0), &i64_key(10));
        assert_eq!(left.key_at(1), &i64_key(20));
        assert_eq!(left.header.next_page_id, right_id);
        drop(left_guard);

        let right_guard = index.buffer_pool.fetch_page_read(right_id).unwrap();
        let (right, _) =
            BPlusTreeLeafPageCodec::decode(right_guard.data(), default_comparator).unwrap();
        assert_eq!(right.array.len(), 2);
        assert_eq!(right.key_at(0), &i64_key(30));
        assert_eq!(right.key_at(1), &i64_key(40));
        assert_eq!(right.header.next_page_id, INVALID_PAGE_ID);
        drop(right_guard);

        assert_eq!(index.get_value(&i64_key(30)).unwrap(), Some(rid_for(30)));
        assert_eq!(collect_keys(&index), vec![10, 20, 30, 40]);
        check_tree(&index);
    }

    #[test]
    fn deletes_merge_back_into_a_single_leaf() {
        let (_tmp, _bpm, dir, index) = create_index(4, 4);
        for v in [10, 20, 30, 40] {
            insert_key(&index, v);
        }
        index.remove(&i64_key(40)).unwrap();
        index.remove(&i64_key(30)).unwrap();

        let root_id = index.get_root_page_id();
        assert_eq!(dir.lookup("test_index").unwrap(), Some(root_id));
        let root_guard = index.buffer_pool.fetch_page_read(root_id).unwrap();
        let (root, _) = BPlusTreePageCodec::decode(root_guard.data(), default_comparator).unwrap();
        match root {
            BPlusTreePage::Leaf(leaf) => {
                assert_eq!(leaf.array.len(), 2);
                assert_eq!(leaf.key_at(0), &i64_key(10));
                assert_eq!(leaf.key_at(1), &i64_key(20));
            }
            BPlusTreePage::Internal(_) => panic!("root should have collapsed to a leaf"),
        }
        drop(root_guard);
        assert_eq!(collect_keys(&index), vec![10, 20]);
    }

    #[test]
    fn removing_every_key_empties_the_tree() {
        let (_tmp, _bpm, dir, index) = create_index(4, 4);
        for v in 0..50 {
            insert_key(&index, v);
        }
        check_tree(&index);
        for v in 0..50 {
            index.remove(&i64_key(v)).unwrap();
        }
        assert!(index.is_empty());
        assert_eq!(dir.lookup("test_index").unwrap(), Some(INVALID_PAGE_ID));
        assert_eq!(collect_keys(&index), Vec::<i64>::new());

        // and the tree is usable again afterwards
        insert_key(&index, 1);
        assert_eq!(index.get_value(&i64_key(1)).unwrap(), Some(rid_for(1)));
    }

    #[test]
    fn reverse_order_inserts_stay_sorted() {
        let (_tmp, _bpm, _dir, index) = create_index(4, 4);
        for v in (0..100).rev() {
            assert!(insert_key(&index, v));
        }
        assert_eq!(collect_keys(&index), (0..100).collect::<Vec<_>>());
        check_tree(&index);
    }

    #[test]
    fn shuffled_inserts_and_deletes() {
        let (_tmp, _bpm, _dir, index) = create_index(4, 5);
        let mut values: Vec<i64> = (0..200).collect();
        values.shuffle(&mut thread_rng());
        for &v in &values {
            assert!(insert_key(&index, v));
        }
        check_tree(&index);

        let (gone, kept) = values.split_at(100);
        let mut gone = gone.to_vec();
        gone.shuffle(&mut thread_rng());
        for &v in &gone {
            index.remove(&i64_key(v)).unwrap();
        }
        check_tree(&index);

        for &v in &gone {
            assert_eq!(index.get_value(&i64_key(v)).unwrap(), None);
        }
        for &v in kept {
            assert_eq!(index.get_value(&i64_key(v)).unwrap(), Some(rid_for(v)));
        }
        let mut expected: Vec<i64> = kept.to_vec();
        expected.sort_unstable();
        assert_eq!(collect_keys(&index), expected);
    }

    #[test]
    fn removing_absent_keys_is_a_no_op() {
        let (_tmp, _bpm, _dir, index) = create_index(4, 4);
        index.remove(&i64_key(5)).unwrap();
        for v in [1, 2, 3] {
            insert_key(&index, v);
        }
        index.remove(&i64_key(5)).unwrap();
        assert_eq!(collect_keys(&index), vec![1, 2, 3]);
    }

    #[test]
    fn iterator_walks_across_leaf_boundaries() {
        let (_tmp, _bpm, _dir, index) = create_index(3, 3);
        for v in 0..30 {
            insert_key(&index, v);
        }
        assert_eq!(collect_keys(&index), (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn begin_at_positions_on_or_after_the_key() {
        let (_tmp, _bpm, _dir, index) = create_index(4, 4);
        for v in [10, 20, 30, 40, 50] {
            insert_key(&index, v);
        }

        let mut iter = index.begin_at(&i64_key(30)).unwrap();
        let (key, rid) = iter.next().unwrap().unwrap();
        assert_eq!(decode_i64_key(&key), Some(30));
        assert_eq!(rid, rid_for(30));

        // missing key starts at the next larger one
        let mut iter = index.begin_at(&i64_key(25)).unwrap();
        let (key, _) = iter.next().unwrap().unwrap();
        assert_eq!(decode_i64_key(&key), Some(30));

        // past the end yields nothing
        let mut iter = index.begin_at(&i64_key(99)).unwrap();
        assert!(iter.next().unwrap().is_none());

        let mut iter = index.end();
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn flush_then_reopen_answers_identically() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db");
        {
            let disk_manager = Arc::new(DiskManager::try_new(&path).unwrap());
            let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
            let bpm = Arc::new(BufferPoolManager::new(64, disk_scheduler));
            let directory = Arc::new(RootDirectory::new(bpm.clone()));
            let index = Arc::new(
                BPlusTreeIndex::new(
                    "pk",
                    bpm.clone(),
                    directory,
                    default_comparator,
                    4,
                    4,
                )
                .unwrap(),
            );
            for v in 0..64 {
                insert_key(&index, v);
            }
            for v in (0..64).step_by(3) {
                index.remove(&i64_key(v)).unwrap();
            }
            bpm.flush_all_pages().unwrap();
        }

        let disk_manager = Arc::new(DiskManager::try_new(&path).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let bpm = Arc::new(BufferPoolManager::new(64, disk_scheduler));
        let directory = Arc::new(RootDirectory::new(bpm.clone()));
        let index = Arc::new(
            BPlusTreeIndex::open("pk", bpm, directory, default_comparator, 4, 4).unwrap(),
        );
        for v in 0..64 {
            let expected = if v % 3 == 0 { None } else { Some(rid_for(v)) };
            assert_eq!(index.get_value(&i64_key(v)).unwrap(), expected, "key {}", v);
        }
        check_tree(&index);
    }

    #[test]
    fn bulk_load_from_files() {
        let (_tmp, _bpm, _dir, index) = create_index(4, 4);
        let dir = TempDir::new().unwrap();
        let insert_path = dir.path().join("insert.txt");
        let remove_path = dir.path().join("remove.txt");
        {
            let mut f = std::fs::File::create(&insert_path).unwrap();
            for v in 0..40 {
                writeln!(f, "{}", v).unwrap();
            }
            let mut f = std::fs::File::create(&remove_path).unwrap();
            writeln!(f, "0 2 4 6 8").unwrap();
        }
        index.insert_from_file(&insert_path).unwrap();
        index.remove_from_file(&remove_path).unwrap();
        let expected: Vec<i64> = (0..40).filter(|v| *v >= 10 || v % 2 == 1).collect();
        assert_eq!(collect_keys(&index), expected);
    }

    #[test]
    fn concurrent_disjoint_inserts() {
        const THREADS: i64 = 4;
        const PER_THREAD: i64 = 100;
        let (_tmp, _bpm, _dir, index) = create_index(4, 4);

        let mut handles = Vec::new();
        for t in 0..THREADS {
            let index = index.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let v = t * PER_THREAD + i;
                    assert!(index.insert(&i64_key(v), rid_for(v)).unwrap());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for v in 0..THREADS * PER_THREAD {
            assert_eq!(index.get_value(&i64_key(v)).unwrap(), Some(rid_for(v)));
        }
        assert_eq!(
            collect_keys(&index),
            (0..THREADS * PER_THREAD).collect::<Vec<_>>()
        );
        check_tree(&index);
    }

    #[test]
    fn concurrent_inserts_and_lookups() {
        const WRITERS: i64 = 3;
        const PER_WRITER: i64 = 80;
        let (_tmp, _bpm, _dir, index) = create_index(4, 4);
        for v in 0..20 {
            insert_key(&index, 10_000 + v);
        }

        let mut handles = Vec::new();
        for t in 0..WRITERS {
            let index = index.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_WRITER {
                    let v = t * PER_WRITER + i;
                    index.insert(&i64_key(v), rid_for(v)).unwrap();
                }
            }));
        }
        for _ in 0..2 {
            let index = index.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    // stable keys stay visible throughout
                    for v in 0..20 {
                        let got = index.get_value(&i64_key(10_000 + v)).unwrap();
                        assert_eq!(got, Some(rid_for(10_000 + v)));
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        check_tree(&index);
    }

    #[test]
    fn concurrent_deletes_leave_survivors_intact() {
        const THREADS: i64 = 4;
        const PER_THREAD: i64 = 50;
        let (_tmp, _bpm, _dir, index) = create_index(4, 4);
        for v in 0..(THREADS * PER_THREAD * 2) {
            insert_key(&index, v);
        }

        let mut handles = Vec::new();
        for t in 0..THREADS {
            let index = index.clone();
            handles.push(std::thread::spawn(move || {
                // each thread deletes a disjoint slice of the even keys
                for i in 0..PER_THREAD {
                    let v = (t * PER_THREAD + i) * 2;
                    index.remove(&i64_key(v)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        for v in 0..(THREADS * PER_THREAD * 2) {
            let expected = if v % 2 == 0 { None } else { Some(rid_for(v)) };
            assert_eq!(index.get_value(&i64_key(v)).unwrap(), expected);
        }
        check_tree(&index);
    }
}
