//! An in-memory hash map built from "Swiss table" buckets behind an
//! extendible hash directory.
//!
//! Each bucket is an open-addressing table with one control byte per
//! slot, probed a SIMD-width group at a time with branch-free bit
//! tricks. Buckets double in place until they reach a configured
//! ceiling; past it, the directory splits one bucket at a time, so
//! growing a very large map never copies more than one bucket's worth
//! of entries at once.
//!
//! ```
//! use splitmap::SplitMap;
//!
//! let mut counters: SplitMap<String, u64> = SplitMap::new();
//! counters.insert("hits".to_string(), 1);
//! if let Some(hits) = counters.get_mut("hits") {
//!     *hits += 1;
//! }
//! assert_eq!(counters.get("hits"), Some(&2));
//! assert_eq!(counters.remove("hits"), Some(2));
//! assert!(counters.is_empty());
//! ```

/// Bucket storage allocator contract
pub mod alloc;
/// Map Config
pub mod config;
/// Crate errors
pub mod error;

/// The extendible directory and public map surface
mod map;
/// One Swiss-table bucket: probing, group matching, rehashing
mod raw;

/// Set of compiler hints
mod hint;

pub use crate::config::MapConfig;
pub use crate::error::SplitMapError;
pub use crate::map::{DefaultHashBuilder, Iter, SplitMap};
