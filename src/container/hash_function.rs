use std::hash::{Hash, Hasher};
use std::sync::Arc;
use xxhash_rust::xxh3::Xxh3;

/// Hash function for a key type. Defaults to xxh3 over the key's `Hash`
/// implementation; tests inject fixed functions (identity and friends) to
/// steer keys into known buckets.
#[derive(Clone)]
pub struct HashFunction<K> {
    func: Arc<dyn Fn(&K) -> u64 + Send + Sync>,
}

impl<K> HashFunction<K> {
    pub fn new(func: impl Fn(&K) -> u64 + Send + Sync + 'static) -> Self {
        Self {
            func: Arc::new(func),
        }
    }

    pub fn get_hash(&self, key: &K) -> u64 {
        (self.func)(key)
    }
}

impl<K: Hash + 'static> Default for HashFunction<K> {
    fn default() -> Self {
        Self::new(|key: &K| {
            let mut hasher = Xxh3::new();
            key.hash(&mut hasher);
            hasher.finish()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hash_is_deterministic() {
        let hash_fn = HashFunction::<i32>::default();
        assert_eq!(hash_fn.get_hash(&42), hash_fn.get_hash(&42));
        assert_ne!(hash_fn.get_hash(&42), hash_fn.get_hash(&43));
    }

    #[test]
    fn test_injected_hash() {
        let identity = HashFunction::new(|key: &u64| *key);
        assert_eq!(identity.get_hash(&0b1011), 0b1011);
    }
}
