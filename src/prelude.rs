//! Re-exports for consumers who prefer a single import.
//!
//! ```no_run
//! use tower_response_cache::prelude::*;
//! # use std::time::Duration;
//! let layer = CacheLayer::builder(InMemoryStore::with_capacity(10_000))
//!     .default_lifetime(Duration::from_secs(60))
//!     .build();
//! ```

pub use crate::directives::{Directive, Directives};
pub use crate::error::{CacheError, NotCacheableReason};
pub use crate::freshness::{Acceptability, FreshnessEvaluator};
pub use crate::key::{CacheKey, CacheKeyBuilder, KeySource};
pub use crate::layer::{BoxError, CacheLayer, CacheLayerBuilder, CacheService};
pub use crate::logging::{CacheEvent, CacheEventType, EventLogConfig};
pub use crate::policy::CachePolicy;
pub use crate::store::memory::InMemoryStore;
pub use crate::store::{CacheEntry, CacheStore};
