//! Cache key derivation.
//!
//! Keys are built in two phases because `Vary` is only known once a response
//! exists, while a request must be checked against the store before that:
//!
//! - the **provisional key** covers the resource identity (method, path,
//!   optionally the raw query, and for keyed POSTs the request body) and
//!   indexes every stored variant of a resource;
//! - the **full key** additionally covers the request's values for every
//!   header named by a response's `Vary`, and is the key entries are stored
//!   under.
//!
//! Fields are fed to SHA-256 in a fixed order, each prefixed with its length
//! as a big-endian `u64` so that no two distinct inputs concatenate to the
//! same byte stream: method, path, query (presence byte, then the field, only
//! when queries are keyed), body (presence byte, then the field), and for full
//! keys the number of vary names followed by each lower-cased name, the number
//! of values the request carries for it, and each value. The digest is
//! truncated to 128 bits.

use std::fmt;

use http::header::VARY;
use http::{HeaderMap, Method, Uri};
use sha2::{Digest, Sha256};

use crate::store::CacheEntry;

/// Fixed-size digest identifying a cached resource variant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; CacheKey::LEN]);

impl CacheKey {
    pub const LEN: usize = 16;

    /// The all-zero digest. Stores reject it as invalid.
    pub const ZERO: Self = Self([0; Self::LEN]);

    pub fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; Self::LEN]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.to_hex())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// The request attributes a key is derived from.
#[derive(Debug, Clone, Copy)]
pub struct KeySource<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub body: Option<&'a [u8]>,
}

impl<'a> KeySource<'a> {
    pub fn new(method: &'a Method, uri: &'a Uri, headers: &'a HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
            body: None,
        }
    }

    /// Includes the request body in the resource identity.
    pub fn with_body(mut self, body: &'a [u8]) -> Self {
        self.body = Some(body);
        self
    }
}

/// Derives provisional and full cache keys.
///
/// Whether the query string is keyed is fixed at construction; a store should
/// only ever be fed keys from builders with the same setting.
#[derive(Debug, Clone, Copy)]
pub struct CacheKeyBuilder {
    include_query: bool,
}

impl Default for CacheKeyBuilder {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CacheKeyBuilder {
    pub fn new(include_query: bool) -> Self {
        Self { include_query }
    }

    pub fn include_query(&self) -> bool {
        self.include_query
    }

    /// Key over the resource identity only, used to find candidate variants.
    pub fn provisional(&self, source: &KeySource<'_>) -> CacheKey {
        self.identity(source).finish()
    }

    /// Key over the resource identity plus the request's values for each
    /// header in `vary`, in the order given.
    pub fn full<S>(&self, source: &KeySource<'_>, vary: &[S]) -> CacheKey
    where
        S: AsRef<str>,
    {
        let mut hasher = self.identity(source);
        hasher.count(vary.len());
        for name in vary {
            let name = name.as_ref().to_ascii_lowercase();
            hasher.field(name.as_bytes());
            let values: Vec<_> = source.headers.get_all(name.as_str()).iter().collect();
            hasher.count(values.len());
            for value in values {
                hasher.field(value.as_bytes());
            }
        }
        hasher.finish()
    }

    /// Whether `entry` is the variant `source` asks for: the entry's own
    /// `Vary` names applied to this request must reproduce its stored key.
    pub fn matches(&self, source: &KeySource<'_>, entry: &CacheEntry) -> bool {
        self.full(source, entry.vary.as_slice()) == entry.key
    }

    fn identity(&self, source: &KeySource<'_>) -> KeyHasher {
        let mut hasher = KeyHasher::default();
        hasher.field(source.method.as_str().as_bytes());
        hasher.field(source.uri.path().as_bytes());
        if self.include_query {
            hasher.optional(source.uri.query().map(str::as_bytes));
        }
        hasher.optional(source.body);
        hasher
    }
}

/// Parses the `Vary` header(s) of a response into an ordered set of
/// lower-cased header names. `*` is kept as-is.
pub fn vary_header_names(headers: &HeaderMap) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in headers
        .get_all(VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
    {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

#[derive(Default)]
struct KeyHasher(Sha256);

impl KeyHasher {
    fn field(&mut self, bytes: &[u8]) {
        self.0.update((bytes.len() as u64).to_be_bytes());
        self.0.update(bytes);
    }

    fn optional(&mut self, bytes: Option<&[u8]>) {
        match bytes {
            Some(bytes) => {
                self.0.update([1]);
                self.field(bytes);
            }
            None => self.0.update([0]),
        }
    }

    fn count(&mut self, count: usize) {
        self.0.update((count as u64).to_be_bytes());
    }

    fn finish(self) -> CacheKey {
        let digest = self.0.finalize();
        let mut key = [0; CacheKey::LEN];
        key.copy_from_slice(&digest[..CacheKey::LEN]);
        CacheKey(key)
    }
}
