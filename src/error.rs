use thiserror::Error;

use crate::directives::Directive;

/// Errors that can occur while interacting with a cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("entry is not cacheable: {0}")]
    NotCacheable(NotCacheableReason),

    #[error("cache key is invalid (all-zero digest)")]
    InvalidKey,

    /// The store's lock was poisoned by a panicking writer, so atomic publish
    /// can no longer be guaranteed.
    #[error("cache store lock poisoned")]
    Poisoned,

    #[error("backend error: {0}")]
    Backend(String),
}

/// Why a captured response was refused by [`CacheStore::store`](crate::store::CacheStore::store).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NotCacheableReason {
    #[error("response carries `{0}`")]
    Directive(Directive),

    #[error("response expired before it could be stored")]
    Expired,

    #[error("`Vary: *` never matches a later request")]
    VaryAny,
}

/// Recoverable parse failures. These never leave the parser: the offending
/// token is dropped or a default is substituted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed cache directive `{0}`")]
    Directive(String),

    #[error("malformed HTTP timestamp `{0}`")]
    Timestamp(String),
}
