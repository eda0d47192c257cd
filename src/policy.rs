use http::{Method, StatusCode};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::freshness::DEFAULT_LIFETIME;
use crate::logging::EventLogConfig;

/// Type alias for the method predicate function
type MethodPredicateFn = Arc<dyn Fn(&Method) -> bool + Send + Sync>;

/// Statuses cached by default: those HTTP defines as heuristically cacheable.
const HEURISTICALLY_CACHEABLE: [u16; 11] = [200, 203, 204, 300, 301, 308, 404, 405, 410, 414, 501];

/// Runtime cache policy shared by the layer and its services.
///
/// Policies decide which requests are looked up, which responses are
/// captured, and how keys and lifetimes are derived. Policies are cheap to
/// clone and are immutable; the `with_*` helpers return new copies with the
/// requested change.
#[derive(Clone)]
pub struct CachePolicy {
    default_lifetime: Duration,
    include_query: bool,
    key_request_body: bool,
    method_predicate: Option<MethodPredicateFn>,
    cache_statuses: HashSet<u16>,
    max_body_size: Option<usize>,
    respect_request_directives: bool,
    background_store: bool,
    coalesce_misses: bool,
    events: EventLogConfig,
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("default_lifetime", &self.default_lifetime)
            .field("include_query", &self.include_query)
            .field("key_request_body", &self.key_request_body)
            .field("custom_method_predicate", &self.method_predicate.is_some())
            .field("cache_statuses", &self.cache_statuses)
            .field("max_body_size", &self.max_body_size)
            .field("respect_request_directives", &self.respect_request_directives)
            .field("background_store", &self.background_store)
            .field("coalesce_misses", &self.coalesce_misses)
            .field("events", &self.events)
            .finish()
    }
}

impl CachePolicy {
    /// Determines whether requests with this method are looked up and captured.
    ///
    /// GET and POST are eligible unless a custom predicate is installed.
    pub fn should_cache_method(&self, method: &Method) -> bool {
        if let Some(predicate) = &self.method_predicate {
            predicate(method)
        } else {
            matches!(method, &Method::GET | &Method::POST)
        }
    }

    pub fn should_cache_status(&self, status: StatusCode) -> bool {
        self.cache_statuses.contains(&status.as_u16())
    }

    /// Whether a request with this method has its body folded into the key.
    pub fn keys_body_of(&self, method: &Method) -> bool {
        self.key_request_body && method == Method::POST
    }

    pub fn default_lifetime(&self) -> Duration {
        self.default_lifetime
    }

    pub fn include_query(&self) -> bool {
        self.include_query
    }

    pub fn key_request_body(&self) -> bool {
        self.key_request_body
    }

    pub fn max_body_size(&self) -> Option<usize> {
        self.max_body_size
    }

    /// Returns whether request `Cache-Control`/`Pragma` headers are honored.
    pub fn respect_request_directives(&self) -> bool {
        self.respect_request_directives
    }

    pub fn background_store(&self) -> bool {
        self.background_store
    }

    pub fn coalesce_misses(&self) -> bool {
        self.coalesce_misses
    }

    pub fn events(&self) -> &EventLogConfig {
        &self.events
    }

    pub fn with_default_lifetime(mut self, lifetime: Duration) -> Self {
        self.default_lifetime = lifetime;
        self
    }

    pub fn with_include_query(mut self, include: bool) -> Self {
        self.include_query = include;
        self
    }

    pub fn with_key_request_body(mut self, enabled: bool) -> Self {
        self.key_request_body = enabled;
        self
    }

    pub fn with_method_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Method) -> bool + Send + Sync + 'static,
    {
        self.method_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.cache_statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_max_body_size(mut self, size: Option<usize>) -> Self {
        self.max_body_size = size;
        self
    }

    pub fn with_respect_request_directives(mut self, enabled: bool) -> Self {
        self.respect_request_directives = enabled;
        self
    }

    pub fn with_background_store(mut self, enabled: bool) -> Self {
        self.background_store = enabled;
        self
    }

    pub fn with_coalesce_misses(mut self, enabled: bool) -> Self {
        self.coalesce_misses = enabled;
        self
    }

    pub fn with_events(mut self, config: EventLogConfig) -> Self {
        self.events = config;
        self
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            default_lifetime: DEFAULT_LIFETIME,
            include_query: true,
            key_request_body: true,
            method_predicate: None,
            cache_statuses: HashSet::from(HEURISTICALLY_CACHEABLE),
            max_body_size: None,
            respect_request_directives: true,
            background_store: true,
            coalesce_misses: false,
            events: EventLogConfig::default(),
        }
    }
}
