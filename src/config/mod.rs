use crate::alloc::{BucketAlloc, Global};
use crate::map::DefaultHashBuilder;
use crate::raw::MIN_BUCKET_CAPACITY;

/// Ceiling applied to a single bucket before the map prefers splitting
/// it over resizing it, as a power of two minus one.
pub const DEFAULT_MAX_BUCKET_CAPACITY: usize = (1 << 15) - 1;

/// Build-time configuration of a [`SplitMap`](crate::SplitMap).
///
/// ```
/// use splitmap::{MapConfig, SplitMap};
///
/// let map: SplitMap<u64, u64> = SplitMap::with_config(
///     MapConfig::new()
///         .with_capacity(1024)
///         .with_max_bucket_capacity(4095),
/// );
/// ```
pub struct MapConfig<S = DefaultHashBuilder, A = Global> {
    pub(crate) hash_builder: S,
    pub(crate) alloc: A,
    pub(crate) capacity: usize,
    pub(crate) max_bucket_capacity: usize,
    pub(crate) seed: Option<u64>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            hash_builder: DefaultHashBuilder::default(),
            alloc: Global,
            capacity: 0,
            max_bucket_capacity: DEFAULT_MAX_BUCKET_CAPACITY,
            seed: None,
        }
    }
}

impl<S, A> MapConfig<S, A> {
    /// Pre-sizes the map for at least `capacity` entries.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Replaces the hash builder. The builder must hash equal keys
    /// equally for the lifetime of the map.
    pub fn with_hasher<S2>(self, hash_builder: S2) -> MapConfig<S2, A> {
        MapConfig {
            hash_builder,
            alloc: self.alloc,
            capacity: self.capacity,
            max_bucket_capacity: self.max_bucket_capacity,
            seed: self.seed,
        }
    }

    /// Replaces the bucket storage allocator.
    pub fn with_allocator<A2: BucketAlloc>(self, alloc: A2) -> MapConfig<S, A2> {
        MapConfig {
            hash_builder: self.hash_builder,
            alloc,
            capacity: self.capacity,
            max_bucket_capacity: self.max_bucket_capacity,
            seed: self.seed,
        }
    }

    /// Caps how large a single bucket may grow before the map splits
    /// it instead; rounded up to the next power of two minus one.
    ///
    /// Zero disables splitting entirely: the map keeps one bucket and
    /// doubles it, trading bounded-cost growth for the classic single
    /// large copy.
    pub fn with_max_bucket_capacity(mut self, max: usize) -> Self {
        self.max_bucket_capacity = if max == 0 {
            0
        } else {
            let lanes = max
                .checked_add(1)
                .and_then(usize::checked_next_power_of_two)
                .expect("max bucket capacity overflow");
            usize::max(lanes - 1, MIN_BUCKET_CAPACITY)
        };
        self
    }

    /// Pins the seed that perturbs hashing and iteration order.
    /// Mainly useful to make tests reproducible; by default every map
    /// draws a fresh seed.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
