use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

/// Concurrent extendible hash table, used as the buffer pool's directory
/// from page id to frame id.
///
/// The directory has `2^global_depth` slots. Each slot holds an index into
/// a bucket slab, so several slots may alias one bucket; a bucket's local
/// depth says how many low hash bits all of its entries share. The whole
/// structure sits behind one reader/writer lock: lookups share, mutations
/// are exclusive. It grows without bound and never shrinks.
#[derive(Debug)]
pub struct ExtendibleHashTable<K, V> {
    state: RwLock<Directory<K, V>>,
}

#[derive(Debug)]
struct Directory<K, V> {
    global_depth: u32,
    bucket_size: usize,
    dir: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
}

#[derive(Debug)]
struct Bucket<K, V> {
    local_depth: u32,
    items: Vec<(K, V)>,
}

fn hash_of<K: Hash>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Copy,
{
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        Self {
            state: RwLock::new(Directory {
                global_depth: 0,
                bucket_size,
                dir: vec![0],
                buckets: vec![Bucket {
                    local_depth: 0,
                    items: Vec::new(),
                }],
            }),
        }
    }

    pub fn find(&self, key: &K) -> Option<V> {
        let state = self.state.read();
        let bucket = &state.buckets[state.dir[state.index_of(key)]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    pub fn insert(&self, key: K, value: V) {
        self.state.write().insert(key, value);
    }

    pub fn remove(&self, key: &K) -> bool {
        let mut state = self.state.write();
        let bucket_idx = state.dir[state.index_of(key)];
        let bucket = &mut state.buckets[bucket_idx];
        if let Some(pos) = bucket.items.iter().position(|(k, _)| k == key) {
            bucket.items.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn global_depth(&self) -> u32 {
        self.state.read().global_depth
    }

    pub fn num_buckets(&self) -> usize {
        self.state.read().buckets.len()
    }

    pub fn len(&self) -> usize {
        let state = self.state.read();
        state.buckets.iter().map(|b| b.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Directory<K, V>
where
    K: Hash + Eq + Clone,
    V: Copy,
{
    fn index_of(&self, key: &K) -> usize {
        (hash_of(key) as usize) & ((1usize << self.global_depth) - 1)
    }

    fn insert(&mut self, key: K, value: V) {
        loop {
            let slot = self.index_of(&key);
            let bucket_idx = self.dir[slot];
            let bucket = &mut self.buckets[bucket_idx];

            if let Some(entry) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                entry.1 = value;
                return;
            }
            if bucket.items.len() < self.bucket_size {
                bucket.items.push((key, value));
                return;
            }

            // Target bucket is full: grow the directory if needed, split the
            // bucket, then retry the insert against the new layout.
            let local_depth = bucket.local_depth;
            if local_depth == self.global_depth {
                let len = self.dir.len();
                self.dir.extend_from_within(0..len);
                self.global_depth += 1;
            }

            let new_local = local_depth + 1;
            self.buckets[bucket_idx].local_depth = new_local;
            let sibling_idx = self.buckets.len();
            self.buckets.push(Bucket {
                local_depth: new_local,
                items: Vec::new(),
            });

            // Slots whose newly-significant bit is set now reference the
            // sibling bucket.
            let high_bit = 1usize << local_depth;
            for s in 0..self.dir.len() {
                if self.dir[s] == bucket_idx && (s & high_bit) != 0 {
                    self.dir[s] = sibling_idx;
                }
            }

            let items = std::mem::take(&mut self.buckets[bucket_idx].items);
            for (k, v) in items {
                let target = if (self.index_of(&k) & high_bit) != 0 {
                    sibling_idx
                } else {
                    bucket_idx
                };
                self.buckets[target].items.push((k, v));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_find_remove() {
        let table = ExtendibleHashTable::new(4);
        table.insert(1u32, 10usize);
        table.insert(2, 20);
        assert_eq!(table.find(&1), Some(10));
        assert_eq!(table.find(&2), Some(20));
        assert_eq!(table.find(&3), None);

        table.insert(1, 11);
        assert_eq!(table.find(&1), Some(11));
        assert_eq!(table.len(), 2);

        assert!(table.remove(&1));
        assert!(!table.remove(&1));
        assert_eq!(table.find(&1), None);
    }

    #[test]
    fn directory_doubles_under_load() {
        let table = ExtendibleHashTable::new(2);
        for i in 0u32..64 {
            table.insert(i, i as usize);
        }
        assert!(table.global_depth() > 0);
        assert!(table.num_buckets() > 1);
        for i in 0u32..64 {
            assert_eq!(table.find(&i), Some(i as usize));
        }
    }

    #[test]
    fn survives_growth_and_removal_mix() {
        let table = ExtendibleHashTable::new(2);
        for i in 0u32..128 {
            table.insert(i, i as usize);
        }
        for i in (0u32..128).step_by(2) {
            assert!(table.remove(&i));
        }
        for i in 0u32..128 {
            let expected = if i % 2 == 0 { None } else { Some(i as usize) };
            assert_eq!(table.find(&i), expected);
        }
        assert_eq!(table.len(), 64);
    }

    #[test]
    fn concurrent_inserts_and_lookups() {
        const THREADS: u32 = 8;
        const PER_THREAD: u32 = 200;
        let table = Arc::new(ExtendibleHashTable::new(4));
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    table.insert(key, key as usize);
                    assert_eq!(table.find(&key), Some(key as usize));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(), (THREADS * PER_THREAD) as usize);
    }
}
