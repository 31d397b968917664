//! Bounded reflection caches
//!
//! Every memoized lookup in the bridge (type names, compiled accessors,
//! worthiness verdicts, lifecycle hook resolution, member plans) is backed
//! by the same fixed-capacity LRU structure. Capacities come from
//! [`CacheSizes`](crate::config::CacheSizes) and never grow after
//! construction.

mod lru;

pub use lru::{LruCache, SharedLru};
