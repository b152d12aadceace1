//! A concurrent hash map keyed by `u64`.
//!
//! The map is split into a fixed number of segments, each an open-addressing
//! table with linear probing guarded by its own lock. Deletion shifts later
//! collision-chain entries backwards instead of leaving tombstones, so the first
//! empty slot always ends a lookup and the occupied slot count is exactly the
//! number of live entries.
//!
//! Lookups take no lock. Each segment publishes its table through an
//! epoch-managed pointer; a resize builds a new table and swaps it in, so a
//! reader sees one complete generation or the next, never a mix.
//!
//! ```
//! use long_hash_map::ConcurrentLongHashMap;
//!
//! let map = ConcurrentLongHashMap::builder()
//!     .expected_items(1024)
//!     .concurrency_level(8)
//!     .build()
//!     .unwrap();
//! assert_eq!(map.insert(7, "seven"), None);
//! assert_eq!(map.get(7), Some("seven"));
//! assert_eq!(map.remove(7), Some("seven"));
//! assert!(map.is_empty());
//! ```

mod builder;
mod error;
mod hash;
mod map;
mod segment;

pub use builder::{Builder, Options};
pub use error::ConfigError;
pub use hash::{hash, sign_safe_mod};
pub use map::ConcurrentLongHashMap;

/// Occupancy ratio above which a segment doubles its capacity.
pub const GROWTH_THRESHOLD: f32 = 0.5;
