//! The public map: an extendible directory of Swiss-table buckets.
//!
//! Every key is hashed once; the top bits of the hash select a bucket
//! through the directory, the rest drives the probe sequence inside
//! it. Buckets grow by doubling until they hit the configured ceiling,
//! after which the directory splits them instead, trading one large
//! copy for bounded-cost splits.

use std::alloc::handle_alloc_error;
use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::mem;
use std::ptr;

use crate::alloc::{BucketAlloc, Global};
use crate::config::MapConfig;
use crate::error::{Result, SplitMapError};
use crate::hint::unlikely;
use crate::raw::bitmask::BitMask;
use crate::raw::group::Group;
use crate::raw::{capacity_for, RawBucket, MIN_BUCKET_CAPACITY};

/// Set FxHash as default as most keys tend to be small
pub type DefaultHashBuilder = fxhash::FxBuildHasher;

/// Upper bound on directory depth. The low 7 hash bits feed the
/// control bytes, so past this point splitting has no fresh bits to
/// route on and a bucket resizes past its ceiling instead.
const MAX_DIR_BITS: u8 = 57;

#[inline]
pub(crate) fn make_hash<K: Hash + ?Sized>(
    hash_builder: &impl BuildHasher,
    seed: u64,
    val: &K,
) -> u64 {
    let mut state = hash_builder.build_hasher();
    state.write_u64(seed);
    val.hash(&mut state);
    state.finish()
}

/// Converts the error of a fallible constructor into the matching
/// fatal outcome, mirroring the infallible entry points.
fn infallible<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(SplitMapError::CapacityOverflow) => panic!("hash table capacity overflow"),
        Err(SplitMapError::Alloc { layout }) => handle_alloc_error(layout),
    }
}

/// Hash map with Swiss-table buckets behind an extendible directory.
///
/// A bucket of local depth `d` owns an aligned block of
/// `2^(dir_bits - d)` directory entries; doubling the directory copies
/// every entry twice and changes no routing. All operations hash a key
/// exactly once.
pub struct SplitMap<K, V, S = DefaultHashBuilder, A = Global>
where
    A: BucketAlloc,
{
    hash_builder: S,
    alloc: A,
    seed: u64,
    /// Number of leading hash bits the directory indexes on.
    dir_bits: u8,
    /// One entry per `2^dir_bits` hash prefix, indexing `buckets`.
    directory: Vec<u32>,
    /// Distinct buckets; never shrinks while the map lives.
    buckets: Vec<RawBucket<K, V>>,
    /// Bucket capacity ceiling; 0 disables splitting.
    max_bucket_capacity: usize,
    len: usize,
}

impl<K, V> SplitMap<K, V>
where
    K: Eq + Hash,
{
    /// Creates an empty map. No storage is allocated until the first
    /// insertion.
    #[inline]
    pub fn new() -> Self {
        Self::with_config(MapConfig::new())
    }

    /// Creates a map pre-sized for at least `capacity` entries.
    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_config(MapConfig::new().with_capacity(capacity))
    }
}

impl<K, V> Default for SplitMap<K, V>
where
    K: Eq + Hash,
{
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S, A> SplitMap<K, V, S, A>
where
    K: Eq + Hash,
    S: BuildHasher,
    A: BucketAlloc,
{
    /// Creates a map from a [`MapConfig`].
    pub fn with_config(config: MapConfig<S, A>) -> Self {
        infallible(Self::try_with_config(config))
    }

    /// Fallible variant of [`with_config`](Self::with_config),
    /// surfacing capacity overflow and allocation failure instead of
    /// aborting.
    pub fn try_with_config(config: MapConfig<S, A>) -> Result<Self> {
        let seed = config.seed.unwrap_or_else(|| fastrand::u64(..));
        let mut map = Self {
            hash_builder: config.hash_builder,
            alloc: config.alloc,
            seed,
            dir_bits: 0,
            directory: Vec::new(),
            buckets: Vec::new(),
            max_bucket_capacity: config.max_bucket_capacity,
            len: 0,
        };
        map.init_storage(config.capacity)?;
        Ok(map)
    }

    /// Sizes the initial bucket layout for `capacity` entries: one
    /// bucket when it fits under the ceiling, otherwise a power-of-two
    /// spread of ceiling-sized buckets addressed by a deeper directory.
    fn init_storage(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            self.buckets.push(RawBucket::new());
            self.directory.push(0);
            return Ok(());
        }

        let single = capacity_for(capacity)?;
        if self.max_bucket_capacity == 0 || single <= self.max_bucket_capacity {
            self.buckets
                .push(RawBucket::with_capacity_in(&self.alloc, single)?);
            self.directory.push(0);
            return Ok(());
        }

        let adjusted = capacity
            .checked_mul(8)
            .ok_or(SplitMapError::CapacityOverflow)?
            / 7;
        let per_bucket = self.max_bucket_capacity;
        let count = ((adjusted + per_bucket - 1) / per_bucket)
            .checked_next_power_of_two()
            .ok_or(SplitMapError::CapacityOverflow)?;
        let dir_bits = count.trailing_zeros() as u8;
        for index in 0..count {
            let mut bucket = RawBucket::with_capacity_in(&self.alloc, per_bucket)?;
            bucket.set_local_depth(dir_bits);
            self.buckets.push(bucket);
            self.directory.push(index as u32);
        }
        self.dir_bits = dir_bits;
        Ok(())
    }

    /// Directory entry for a hash: its top `dir_bits` bits.
    #[inline]
    fn dir_index(&self, hash: u64) -> usize {
        if self.dir_bits == 0 {
            0
        } else {
            (hash >> (64 - self.dir_bits as u32)) as usize
        }
    }

    #[inline]
    fn hash_key<Q: Hash + ?Sized>(&self, key: &Q) -> u64 {
        make_hash(&self.hash_builder, self.seed, key)
    }

    /// Number of entries in the map.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of entries the map can hold without growing any bucket.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buckets.iter().map(RawBucket::budget).sum()
    }

    /// Number of distinct buckets behind the directory.
    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Returns a reference to the map's [`BuildHasher`].
    #[inline]
    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// The seed perturbing this map's hashing and iteration order.
    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    #[inline]
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    #[inline]
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_key_value(key).map(|(_, v)| v)
    }

    #[inline]
    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_key(key);
        let bucket = &self.buckets[self.directory[self.dir_index(hash)] as usize];
        bucket
            .find(hash, |entry| key.eq(entry.0.borrow()))
            .map(|index| unsafe {
                let &(ref k, ref v) = &*bucket.slot(index);
                (k, v)
            })
    }

    #[inline]
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_key(key);
        let bucket_index = self.directory[self.dir_index(hash)] as usize;
        let bucket = &mut self.buckets[bucket_index];
        bucket
            .find(hash, |entry| key.eq(entry.0.borrow()))
            .map(move |index| unsafe { &mut (*bucket.slot(index)).1 })
    }

    /// Inserts a key-value pair, returning the previous value of the
    /// key if it was present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let hash = self.hash_key(&key);
        loop {
            let bucket_index = self.directory[self.dir_index(hash)] as usize;
            let bucket = &mut self.buckets[bucket_index];
            if unlikely(bucket.capacity() == 0) {
                self.grow(hash);
                continue;
            }
            match bucket.find_or_find_insert_slot(hash, |entry| key.eq(&entry.0)) {
                Ok(index) => {
                    let old = unsafe { mem::replace(&mut (*bucket.slot(index)).1, value) };
                    return Some(old);
                }
                Err(slot) => {
                    if unlikely(bucket.growth_left() == 0 && bucket.claims_budget(slot)) {
                        self.grow(hash);
                        continue;
                    }
                    unsafe { bucket.insert_at(slot, hash, (key, value)) };
                    self.len += 1;
                    return None;
                }
            }
        }
    }

    /// Removes a key, returning its value if it was present.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_key(key);
        let bucket_index = self.directory[self.dir_index(hash)] as usize;
        let bucket = &mut self.buckets[bucket_index];
        let index = bucket.find(hash, |entry| key.eq(entry.0.borrow()))?;
        let (_, value) = unsafe { bucket.erase(index) };
        self.len -= 1;
        Some(value)
    }

    /// Destroys every entry. Bucket storage and the directory shape
    /// are kept, so the map's capacity is unchanged.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.len = 0;
    }

    /// Visits every entry, stopping early when the callback returns
    /// `false`.
    ///
    /// The traversal order rotates with the map's seed and is not
    /// otherwise specified; callers must not depend on it.
    #[inline]
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for (k, v) in self.iter() {
            if !f(k, v) {
                return;
            }
        }
    }

    /// Iterator over all entries, in seed-rotated order.
    #[inline]
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(&self.buckets, self.seed, self.len)
    }

    /// Makes room in the bucket the hash routes to, after an insert
    /// found it out of budget: reclaim tombstones in place when they
    /// dominate, double the bucket below its ceiling, and split it at
    /// the ceiling.
    fn grow(&mut self, hash: u64) {
        infallible(self.try_grow(hash));
    }

    fn try_grow(&mut self, hash: u64) -> Result<()> {
        let mut dir_index = self.dir_index(hash);
        let bucket_index = self.directory[dir_index] as usize;
        let hash_builder = &self.hash_builder;
        let seed = self.seed;
        let hasher = move |entry: &(K, V)| make_hash(hash_builder, seed, &entry.0);

        let bucket = &self.buckets[bucket_index];
        let capacity = bucket.capacity();
        if capacity == 0 {
            return self.buckets[bucket_index].resize(&self.alloc, MIN_BUCKET_CAPACITY, hasher);
        }
        if bucket.tombstones() * 4 >= bucket.budget() {
            self.buckets[bucket_index].rehash_in_place(hasher);
            return Ok(());
        }
        let doubled = capacity
            .checked_mul(2)
            .and_then(|c| c.checked_add(1))
            .ok_or(SplitMapError::CapacityOverflow)?;
        if self.max_bucket_capacity == 0
            || capacity < self.max_bucket_capacity
            || self.dir_bits >= MAX_DIR_BITS
        {
            return self.buckets[bucket_index].resize(&self.alloc, doubled, hasher);
        }
        if bucket.local_depth() == self.dir_bits {
            self.double_directory();
            dir_index *= 2;
        }
        self.split(dir_index)
    }

    /// Doubles the directory: every entry is copied twice, all local
    /// depths stay put.
    fn double_directory(&mut self) {
        debug_assert!(self.dir_bits < MAX_DIR_BITS);
        let mut doubled = Vec::with_capacity(self.directory.len() * 2);
        for &entry in &self.directory {
            doubled.push(entry);
            doubled.push(entry);
        }
        self.directory = doubled;
        self.dir_bits += 1;
    }

    /// Splits the bucket behind `dir_index` into two children one
    /// level deeper, routed by the next unclaimed high hash bit.
    ///
    /// The children are sized from an exact pre-count of each half, so
    /// the insert that forced the split always finds room afterwards
    /// even when every entry routes to one side.
    fn split(&mut self, dir_index: usize) -> Result<()> {
        let bucket_index = self.directory[dir_index] as usize;
        let depth = self.buckets[bucket_index].local_depth();
        debug_assert!(depth < self.dir_bits);
        let bit = 63 - depth as u32;

        let hash_builder = &self.hash_builder;
        let seed = self.seed;
        let hash_of = move |entry: &(K, V)| make_hash(hash_builder, seed, &entry.0);

        let parent = &self.buckets[bucket_index];
        let mut right_count = 0usize;
        unsafe {
            for index in parent.full_lanes() {
                right_count += ((hash_of(&*parent.slot(index)) >> bit) & 1) as usize;
            }
        }
        let left_count = parent.used() - right_count;

        let mut left =
            RawBucket::with_capacity_in(&self.alloc, capacity_for(left_count + 1)?)?;
        let mut right =
            RawBucket::with_capacity_in(&self.alloc, capacity_for(right_count + 1)?)?;
        left.set_local_depth(depth + 1);
        right.set_local_depth(depth + 1);

        let mut parent = mem::replace(&mut self.buckets[bucket_index], RawBucket::new());
        unsafe {
            for index in parent.full_lanes() {
                let entry = ptr::read(parent.slot(index));
                let hash = hash_of(&entry);
                if (hash >> bit) & 1 == 0 {
                    left.append(hash, entry);
                } else {
                    right.append(hash, entry);
                }
            }
            // Entries moved into the children; release the arrays only.
            parent.free_arrays(&self.alloc);
        }

        self.buckets[bucket_index] = left;
        let right_index = self.buckets.len() as u32;
        self.buckets.push(right);

        // The parent owned an aligned block of entries; its upper half
        // now routes to the right child.
        let block = 1usize << (self.dir_bits - depth);
        let start = dir_index & !(block - 1);
        for entry in &mut self.directory[start + block / 2..start + block] {
            *entry = right_index;
        }
        Ok(())
    }
}

impl<K, V, S, A> Drop for SplitMap<K, V, S, A>
where
    A: BucketAlloc,
{
    fn drop(&mut self) {
        for bucket in &mut self.buckets {
            bucket.free(&self.alloc);
        }
    }
}

impl<'a, K, V, S, A> IntoIterator for &'a SplitMap<K, V, S, A>
where
    K: Eq + Hash,
    S: BuildHasher,
    A: BucketAlloc,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    #[inline]
    fn into_iter(self) -> Iter<'a, K, V> {
        self.iter()
    }
}

/// Iterator over the entries of a [`SplitMap`].
///
/// Walks the distinct buckets and, within each, the aligned control
/// groups, both starting from a seed-derived rotation so no two maps
/// agree on an order.
pub struct Iter<'a, K, V> {
    buckets: &'a [RawBucket<K, V>],
    /// Rotation offsets applied to bucket and group positions.
    bucket_rot: usize,
    group_rot: usize,
    /// Progress: buckets fully yielded, groups yielded in the current
    /// bucket.
    buckets_done: usize,
    groups_done: usize,
    current: usize,
    group_base: usize,
    mask: BitMask,
    remaining: usize,
}

impl<'a, K, V> Iter<'a, K, V> {
    fn new(buckets: &'a [RawBucket<K, V>], seed: u64, len: usize) -> Self {
        debug_assert!(!buckets.is_empty());
        Self {
            buckets,
            bucket_rot: seed as usize % buckets.len(),
            group_rot: (seed >> 32) as usize,
            buckets_done: 0,
            groups_done: 0,
            current: 0,
            group_base: 0,
            mask: BitMask(0),
            remaining: len,
        }
    }

    /// Loads the next unvisited group's full-lane mask, or returns
    /// false when every bucket is exhausted.
    fn advance_group(&mut self) -> bool {
        while self.buckets_done < self.buckets.len() {
            let index = (self.bucket_rot + self.buckets_done) % self.buckets.len();
            let bucket = &self.buckets[index];
            let num_groups = bucket.num_groups();
            if self.groups_done < num_groups {
                let group = (self.group_rot + self.groups_done) % num_groups;
                self.groups_done += 1;
                self.current = index;
                self.group_base = group * Group::WIDTH;
                self.mask = unsafe { bucket.full_mask_at(group) };
                return true;
            }
            self.buckets_done += 1;
            self.groups_done = 0;
        }
        false
    }
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    #[inline]
    fn next(&mut self) -> Option<(&'a K, &'a V)> {
        loop {
            if let Some(bit) = self.mask.lowest_set_bit() {
                self.mask = self.mask.remove_lowest_bit();
                let entry = unsafe { &*self.buckets[self.current].slot(self.group_base + bit) };
                self.remaining -= 1;
                return Some((&entry.0, &entry.1));
            }
            if !self.advance_group() {
                debug_assert_eq!(self.remaining, 0);
                return None;
            }
        }
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, K, V> ExactSizeIterator for Iter<'a, K, V> {}
