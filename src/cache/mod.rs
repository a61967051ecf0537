//! Local disk cache for origin objects and rendered image variants.
//!
//! - [`DiskCacheStore`]: one file per [`CacheKey`], atomic replacement,
//!   mtime-derived etags.
//! - [`InFlight`]: coalesces concurrent misses for the same key.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! directory = "./data/cache"
//! coalesce_image_misses = true
//! ```
//!
//! Entries are never evicted; the directory grows with the set of distinct
//! keys requested.

mod flight;
mod keys;
mod store;

pub use flight::{FlightAborted, InFlight};
pub use keys::CacheKey;
pub use store::{CacheLookup, CachePayload, CacheWriteError, DiskCacheStore};

pub(crate) use flight::METRIC_INFLIGHT_COALESCED;
pub(crate) use store::{
    METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_NOT_MODIFIED, METRIC_CACHE_WRITE,
    METRIC_CACHE_WRITE_FAILED,
};
