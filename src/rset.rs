//! # Refcounted Multiset
//!
//! `RSet` counts the number of times each distinct element has been added.
//! The count is decremented on removal; an element whose count reaches zero
//! is unlinked and its stored key is handed back to the caller, which owns
//! whatever external resource the key stands for.
//!
//! The table is a power-of-two bucket array with chained collision lists.
//! Unlinked entry nodes are kept on a free list so that churn does not
//! repeatedly allocate.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const INITIAL_BUCKETS: usize = 16;

struct Entry<K> {
    hash: u64,
    refcount: u32,
    /// `Some` while the entry is linked into a chain, `None` on the free list.
    key: Option<K>,
    next: Option<Box<Entry<K>>>,
}

pub struct RSet<K> {
    buckets: Vec<Option<Box<Entry<K>>>>,
    count: usize,
    free: Option<Box<Entry<K>>>,
}

impl<K: Hash + Eq + Clone> RSet<K> {
    pub fn new() -> RSet<K> {
        let mut buckets = Vec::with_capacity(INITIAL_BUCKETS);
        buckets.resize_with(INITIAL_BUCKETS, || None);
        RSet { buckets, count: 0, free: None }
    }

    /// Number of distinct live elements.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn hash_of(key: &K) -> u64 {
        let mut h = DefaultHasher::new();
        key.hash(&mut h);
        h.finish()
    }

    fn mask(&self) -> u64 {
        (self.buckets.len() - 1) as u64
    }

    /// Maximum element count before the bucket array expands.
    fn max(&self) -> usize {
        self.buckets.len() - 1
    }

    /// Insert or find `key` and increment its count. Returns true iff the
    /// count just became 1.
    pub fn add(&mut self, key: K) -> bool {
        let hash = Self::hash_of(&key);
        let idx = (hash & self.mask()) as usize;

        let mut cur = &mut self.buckets[idx];
        loop {
            match cur {
                Some(e) if e.hash == hash && e.key.as_ref() == Some(&key) => {
                    e.refcount += 1;
                    return false;
                }
                Some(e) => cur = &mut e.next,
                None => break,
            }
        }

        // Not present: link a recycled or fresh entry at the chain tail.
        let mut entry = match self.free.take() {
            Some(mut e) => {
                self.free = e.next.take();
                e
            }
            None => Box::new(Entry { hash: 0, refcount: 0, key: None, next: None }),
        };
        entry.hash = hash;
        entry.refcount = 1;
        entry.key = Some(key);
        entry.next = None;
        *cur = Some(entry);
        self.count += 1;

        if self.count > self.max() {
            self.expand();
        }
        true
    }

    /// Decrement the count of `key`. Returns the stored key and the new
    /// count, or `None` if the element is absent. A count of zero means the
    /// entry was unlinked and the returned key is the caller's to release.
    pub fn remove(&mut self, key: &K) -> Option<(K, u32)> {
        let hash = Self::hash_of(key);
        let idx = (hash & self.mask()) as usize;

        let mut cur = &mut self.buckets[idx];
        loop {
            let is_match = match cur.as_deref() {
                Some(e) => e.hash == hash && e.key.as_ref() == Some(key),
                None => return None,
            };
            if !is_match {
                cur = match cur {
                    Some(e) => &mut e.next,
                    None => return None,
                };
                continue;
            }

            let mut entry = cur.take()?;
            entry.refcount -= 1;
            if entry.refcount > 0 {
                let stored = entry.key.clone();
                let rc = entry.refcount;
                *cur = Some(entry);
                return stored.map(|k| (k, rc));
            }

            // Count hit zero: unlink and recycle the node.
            *cur = entry.next.take();
            let stored = entry.key.take();
            entry.hash = 0;
            entry.next = self.free.take();
            self.free = Some(entry);
            self.count -= 1;
            return stored.map(|k| (k, 0));
        }
    }

    /// Current count of `key` (0 if absent).
    pub fn get(&self, key: &K) -> u32 {
        let hash = Self::hash_of(key);
        let idx = (hash & self.mask()) as usize;
        let mut cur = self.buckets[idx].as_deref();
        while let Some(e) = cur {
            if e.hash == hash && e.key.as_ref() == Some(key) {
                return e.refcount;
            }
            cur = e.next.as_deref();
        }
        0
    }

    /// Iterate over each distinct live element and its count.
    pub fn iter(&self) -> impl Iterator<Item = (&K, u32)> {
        self.buckets
            .iter()
            .flat_map(|b| ChainIter { cur: b.as_deref() })
            .filter_map(|e| e.key.as_ref().map(|k| (k, e.refcount)))
    }

    /// Rehash every entry into a bucket array twice the size. The collision
    /// rate stays bounded because expansion triggers at `count > max`.
    fn expand(&mut self) {
        let new_len = self.buckets.len() * 2;
        let mut old = std::mem::replace(&mut self.buckets, {
            let mut v = Vec::with_capacity(new_len);
            v.resize_with(new_len, || None);
            v
        });
        let mask = (new_len - 1) as u64;
        for bucket in &mut old {
            let mut link = bucket.take();
            while let Some(mut e) = link {
                link = e.next.take();
                let idx = (e.hash & mask) as usize;
                e.next = self.buckets[idx].take();
                self.buckets[idx] = Some(e);
            }
        }
    }
}

impl<K: Hash + Eq + Clone> Default for RSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

struct ChainIter<'a, K> {
    cur: Option<&'a Entry<K>>,
}

impl<'a, K> Iterator for ChainIter<'a, K> {
    type Item = &'a Entry<K>;

    fn next(&mut self) -> Option<&'a Entry<K>> {
        let e = self.cur?;
        self.cur = e.next.as_deref();
        Some(e)
    }
}
