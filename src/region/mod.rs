//! Key space primitives: keys, hash-by-key regions, region maps

pub mod hash_region;
pub mod key;
pub mod region_map;

pub use hash_region::{cpu_sharding_subspace, Region, CPU_SHARDING_FACTOR, HASH_SPACE};
pub use key::{KeyRange, RightBound, StoreKey};
pub use region_map::RegionMap;
