//! Tower Response Cache
//! ====================
//!
//! `tower-response-cache` is a shared HTTP response cache for Tower-based
//! services. It sits between clients and an origin service, answers repeated
//! GET and POST requests from a [`CacheStore`](store::CacheStore), and honors
//! `Cache-Control`, `Expires` and `Vary` when deciding what to store and what
//! to serve.
//!
//! Keys are derived in two phases. A provisional key over method, path,
//! query and (for POST) body finds every stored variant of a resource; the
//! full key adds the request's values for the headers the response named in
//! `Vary`, so variants never overwrite one another.
//!
//! ```no_run
//! use std::time::Duration;
//! use tower::{Service, ServiceBuilder, ServiceExt};
//! use tower_response_cache::prelude::*;
//!
//! # async fn run() -> Result<(), tower_response_cache::layer::BoxError> {
//! let layer = CacheLayer::builder(InMemoryStore::new())
//!     .default_lifetime(Duration::from_secs(300))
//!     .include_query(false)
//!     .build();
//!
//! let mut svc = ServiceBuilder::new()
//!     .layer(layer)
//!     .service(tower::service_fn(|_req| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(http_body_util::Full::from("ok")))
//!     }));
//!
//! let response = svc
//!     .ready()
//!     .await?
//!     .call(http::Request::new(http_body_util::Full::<bytes::Bytes>::default()))
//!     .await?;
//! # drop(response);
//! # Ok(())
//! # }
//! ```

mod coalesce;
pub mod directives;
pub mod error;
pub mod freshness;
pub mod key;
pub mod layer;
pub mod logging;
pub mod policy;
pub mod prelude;
pub mod store;

pub use error::{CacheError, NotCacheableReason, ParseError};
pub use layer::{CacheLayer, CacheLayerBuilder, CacheService};
pub use logging::{CacheEvent, CacheEventType, EventLogConfig};
