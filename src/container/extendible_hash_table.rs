use crate::container::hash_function::HashFunction;
use log::{debug, trace};
use parking_lot::Mutex;
use std::hash::Hash;

/// A bucket: at most `bucket_size` entries, discriminating the low `depth`
/// bits of the hash.
struct Bucket<K, V> {
    depth: usize,
    items: Vec<(K, V)>,
}

/// Directory and bucket arena. `dir` holds indices into `buckets`; several
/// directory slots may share one bucket, which is exactly how a bucket of
/// local depth `d < global_depth` is referenced by `2^(global_depth - d)`
/// slots.
struct HashTableState<K, V> {
    global_depth: usize,
    num_buckets: usize,
    dir: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
}

/// In-memory extendible hash table.
///
/// Buckets split locally when they fill up; the directory doubles only when
/// a bucket at global depth splits, so directory growth is amortized. All
/// operations serialize on a single mutex.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    hash_fn: HashFunction<K>,
    state: Mutex<HashTableState<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Clone + Eq,
    V: Clone,
{
    /// Creates a table with the default hash function.
    pub fn new(bucket_size: usize) -> Self
    where
        K: Hash + 'static,
    {
        Self::with_hash_function(bucket_size, HashFunction::default())
    }

    /// Creates a table hashing through `hash_fn` (injectable for tests).
    pub fn with_hash_function(bucket_size: usize, hash_fn: HashFunction<K>) -> Self {
        assert!(bucket_size > 0, "buckets must hold at least one entry");
        Self {
            bucket_size,
            hash_fn,
            state: Mutex::new(HashTableState {
                global_depth: 0,
                num_buckets: 1,
                dir: vec![0],
                buckets: vec![Bucket {
                    depth: 0,
                    items: Vec::new(),
                }],
            }),
        }
    }

    fn dir_index(state: &HashTableState<K, V>, hash: u64) -> usize {
        (hash as usize) & ((1 << state.global_depth) - 1)
    }

    /// Returns the value bound to `key`, if any.
    pub fn find(&self, key: &K) -> Option<V> {
        let hash = self.hash_fn.get_hash(key);
        let state = self.state.lock();
        let bucket = &state.buckets[state.dir[Self::dir_index(&state, hash)]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Upsert: overwrites the value if the key is present, otherwise adds
    /// the pair, splitting the target bucket (and doubling the directory)
    /// as often as needed to make room.
    pub fn insert(&self, key: K, value: V) {
        let hash = self.hash_fn.get_hash(&key);
        let mut state = self.state.lock();
        loop {
            let bucket_idx = state.dir[Self::dir_index(&state, hash)];
            let bucket = &mut state.buckets[bucket_idx];
            if let Some(entry) = bucket.items.iter_mut().find(|(k, _)| *k == key) {
                entry.1 = value;
                return;
            }
            if bucket.items.len() < self.bucket_size {
                bucket.items.push((key, value));
                return;
            }
            // Skewed hashes can land the key in a full bucket repeatedly;
            // keep splitting until it fits.
            self.split_bucket(&mut state, bucket_idx);
        }
    }

    /// Removes `key`. Returns true iff it was present.
    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hash_fn.get_hash(key);
        let mut state = self.state.lock();
        let bucket_idx = state.dir[Self::dir_index(&state, hash)];
        let bucket = &mut state.buckets[bucket_idx];
        match bucket.items.iter().position(|(k, _)| k == key) {
            Some(pos) => {
                bucket.items.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Splits the bucket in arena slot `target`, doubling the directory
    /// first when the bucket already discriminates every global bit. The
    /// split bucket's slot is reused for the zero-bit half; the one-bit half
    /// gets a fresh slot.
    fn split_bucket(&self, state: &mut HashTableState<K, V>, target: usize) {
        let depth = state.buckets[target].depth;
        if depth == state.global_depth {
            state.dir.extend_from_within(..);
            state.global_depth += 1;
            debug!("directory doubled, global depth {}", state.global_depth);
        }

        let mask = 1u64 << depth;
        let items = std::mem::take(&mut state.buckets[target].items);
        state.buckets[target].depth = depth + 1;
        state.buckets.push(Bucket {
            depth: depth + 1,
            items: Vec::new(),
        });
        let one_idx = state.buckets.len() - 1;

        for (key, value) in items {
            let side = if self.hash_fn.get_hash(&key) & mask != 0 {
                one_idx
            } else {
                target
            };
            state.buckets[side].items.push((key, value));
        }

        for slot in 0..state.dir.len() {
            if state.dir[slot] == target && (slot as u64) & mask != 0 {
                state.dir[slot] = one_idx;
            }
        }
        state.num_buckets += 1;
        trace!(
            "split bucket {target} at depth {depth}, {} buckets now",
            state.num_buckets
        );
    }

    /*****************************************************************
     * Observability
     *****************************************************************/

    pub fn global_depth(&self) -> usize {
        self.state.lock().global_depth
    }

    pub fn local_depth(&self, dir_index: usize) -> usize {
        let state = self.state.lock();
        state.buckets[state.dir[dir_index]].depth
    }

    pub fn num_buckets(&self) -> usize {
        self.state.lock().num_buckets
    }

    pub fn dir_len(&self) -> usize {
        self.state.lock().dir.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::logger::initialize_logger;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn identity_table(bucket_size: usize) -> ExtendibleHashTable<u64, char> {
        initialize_logger();
        ExtendibleHashTable::with_hash_function(bucket_size, HashFunction::new(|key: &u64| *key))
    }

    /// Depth bookkeeping that must hold after any operation: the directory
    /// has `2^global_depth` slots, local depths never exceed the global
    /// depth, every entry hashes into the bucket that holds it, and the
    /// distinct referenced buckets match `num_buckets`.
    fn check_depth_invariants(table: &ExtendibleHashTable<u64, char>) {
        let state = table.state.lock();
        assert_eq!(state.dir.len(), 1 << state.global_depth);
        let mut referenced = HashSet::new();
        for (slot, &bucket_idx) in state.dir.iter().enumerate() {
            let bucket = &state.buckets[bucket_idx];
            assert!(bucket.depth <= state.global_depth);
            // Slots sharing a bucket agree with it on the low `depth` bits.
            let suffix_mask = (1u64 << bucket.depth) - 1;
            for (key, _) in &bucket.items {
                assert_eq!(key & suffix_mask, (slot as u64) & suffix_mask);
            }
            referenced.insert(bucket_idx);
        }
        assert_eq!(referenced.len(), state.num_buckets);
    }

    #[test]
    fn test_bucket_split() {
        // bucket_size 2, identity hash: the third key forces one split.
        let table = identity_table(2);
        table.insert(0, 'a');
        table.insert(1, 'b');
        assert_eq!(table.global_depth(), 0);
        table.insert(2, 'c');

        assert_eq!(table.global_depth(), 1);
        assert_eq!(table.num_buckets(), 2);
        assert_eq!(table.local_depth(0), 1);
        assert_eq!(table.local_depth(1), 1);
        assert_eq!(table.find(&2), Some('c'));
        assert_eq!(table.find(&0), Some('a'));
        assert_eq!(table.find(&1), Some('b'));
        check_depth_invariants(&table);
    }

    #[test]
    fn test_directory_doubling_until_keys_separate() {
        // 0 = 0b0000 and 4 = 0b0100 agree on their low two bits, so a
        // single-entry bucket needs three splits (and three directory
        // doublings) to tell them apart.
        let table = identity_table(1);
        table.insert(0, 'x');
        table.insert(4, 'y');

        assert_eq!(table.global_depth(), 3);
        assert_eq!(table.dir_len(), 8);
        // The chain of splits leaves the two live buckets at depth 3 plus
        // the two empty intermediate buckets at depths 1 and 2.
        assert_eq!(table.num_buckets(), 4);
        assert_eq!(table.local_depth(0), 3);
        assert_eq!(table.local_depth(4), 3);
        assert_eq!(table.find(&0), Some('x'));
        assert_eq!(table.find(&4), Some('y'));
        check_depth_invariants(&table);
    }

    #[test]
    fn test_upsert_overwrites() {
        let table = identity_table(2);
        table.insert(7, 'a');
        table.insert(7, 'b');
        assert_eq!(table.find(&7), Some('b'));
        assert_eq!(table.num_buckets(), 1);
    }

    #[test]
    fn test_upsert_on_full_bucket_does_not_split() {
        let table = identity_table(2);
        table.insert(0, 'a');
        table.insert(1, 'b');
        table.insert(0, 'z');
        assert_eq!(table.global_depth(), 0);
        assert_eq!(table.find(&0), Some('z'));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = identity_table(2);
        table.insert(3, 'c');
        assert!(table.remove(&3));
        assert!(!table.remove(&3));
        assert_eq!(table.find(&3), None);
    }

    #[test]
    fn test_many_keys_default_hash() {
        initialize_logger();
        let table = ExtendibleHashTable::<i64, i64>::new(4);
        for i in 0..512 {
            table.insert(i, i * 10);
        }
        for i in 0..512 {
            assert_eq!(table.find(&i), Some(i * 10), "key {i}");
        }
        for i in (0..512).step_by(2) {
            assert!(table.remove(&i));
        }
        for i in 0..512 {
            let expected = if i % 2 == 0 { None } else { Some(i * 10) };
            assert_eq!(table.find(&i), expected, "key {i}");
        }
    }

    #[test]
    fn test_depth_invariants_under_identity_workload() {
        let table = identity_table(3);
        for key in 0..256 {
            table.insert(key, '#');
            if key % 3 == 0 {
                table.remove(&(key / 2));
            }
        }
        check_depth_invariants(&table);
    }

    #[test]
    fn test_concurrent_mixed_operations() {
        initialize_logger();
        let table = Arc::new(ExtendibleHashTable::<u64, u64>::new(8));
        let mut handles = Vec::new();
        for t in 0..4u64 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                let base = t * 1000;
                for i in 0..1000 {
                    table.insert(base + i, i);
                }
                for i in (0..1000).step_by(2) {
                    assert!(table.remove(&(base + i)));
                }
                for i in 0..1000 {
                    let expected = if i % 2 == 0 { None } else { Some(i) };
                    assert_eq!(table.find(&(base + i)), expected);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
