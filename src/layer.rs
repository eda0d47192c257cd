use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{Method, Request, Response, StatusCode};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use tower::{Layer, Service, ServiceExt};

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

use crate::coalesce::{wait_for_leader, LeaderGuard, MissCoalescer, Turn};
use crate::directives::{Directive, Directives};
use crate::error::CacheError;
use crate::freshness::{Acceptability, FreshnessEvaluator};
use crate::key::{CacheKey, CacheKeyBuilder, KeySource};
use crate::logging::{CacheEvent, CacheEventType, EventLogConfig};
use crate::policy::CachePolicy;
use crate::store::memory::InMemoryStore;
use crate::store::{CacheEntry, CacheStore};

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Response-caching layer for Tower HTTP services.
///
/// The layer wraps an inner service, answers GET and POST requests from the
/// configured [`CacheStore`] when an acceptable entry exists, and otherwise
/// forwards the request and captures the origin's response. Create instances
/// via [`CacheLayer::builder`] or [`CacheLayer::new`] for the default
/// [`CachePolicy`].
///
/// Cloning a `CacheLayer` is cheap and shares the underlying store and
/// in-flight miss locks.
///
/// # Request bodies
///
/// POST bodies are buffered so they can be keyed and then handed to the inner
/// service again, which needs the request body type to implement
/// `From<Bytes>`. `Full<Bytes>` and axum's `Body` do. hyper's `Incoming` does
/// not; convert it into such a body type (axum's `Body::new`, or collect it
/// into `Full<Bytes>`) in a layer in front of this one.
#[derive(Clone)]
pub struct CacheLayer<St> {
    store: St,
    policy: CachePolicy,
    coalescer: MissCoalescer,
}

/// Builder for configuring [`CacheLayer`] instances.
pub struct CacheLayerBuilder<St> {
    store: St,
    policy: CachePolicy,
}

impl<St> CacheLayerBuilder<St>
where
    St: CacheStore,
{
    pub fn new(store: St) -> Self {
        Self {
            store,
            policy: CachePolicy::default(),
        }
    }

    /// Replaces the cache policy with a pre-built value.
    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the freshness lifetime used when a response carries neither
    /// `max-age`, `s-maxage` nor `Expires`.
    pub fn default_lifetime(mut self, lifetime: Duration) -> Self {
        self.policy = self.policy.with_default_lifetime(lifetime);
        self
    }

    /// Whether the query string is part of the cache key.
    pub fn include_query(mut self, include: bool) -> Self {
        self.policy = self.policy.with_include_query(include);
        self
    }

    pub fn key_request_body(mut self, enabled: bool) -> Self {
        self.policy = self.policy.with_key_request_body(enabled);
        self
    }

    pub fn method_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Method) -> bool + Send + Sync + 'static,
    {
        self.policy = self.policy.with_method_predicate(predicate);
        self
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = u16>) -> Self {
        self.policy = self.policy.with_statuses(statuses);
        self
    }

    pub fn max_body_size(mut self, size: Option<usize>) -> Self {
        self.policy = self.policy.with_max_body_size(size);
        self
    }

    pub fn respect_request_directives(mut self, enabled: bool) -> Self {
        self.policy = self.policy.with_respect_request_directives(enabled);
        self
    }

    /// Writes captured responses to the store on a spawned task instead of
    /// before the response is returned.
    pub fn background_store(mut self, enabled: bool) -> Self {
        self.policy = self.policy.with_background_store(enabled);
        self
    }

    /// Lets only one of several concurrent misses for the same resource reach
    /// the origin while the others wait for its store to land.
    pub fn coalesce_misses(mut self, enabled: bool) -> Self {
        self.policy = self.policy.with_coalesce_misses(enabled);
        self
    }

    pub fn events(mut self, config: EventLogConfig) -> Self {
        self.policy = self.policy.with_events(config);
        self
    }

    pub fn build(self) -> CacheLayer<St> {
        CacheLayer {
            store: self.store,
            policy: self.policy,
            coalescer: MissCoalescer::new(),
        }
    }
}

impl CacheLayer<InMemoryStore> {
    /// Creates a cache layer backed by a fresh, unbounded [`InMemoryStore`].
    pub fn new_in_memory() -> Self {
        CacheLayerBuilder::new(InMemoryStore::new()).build()
    }
}

impl<St> CacheLayer<St>
where
    St: CacheStore,
{
    /// Builds a cache layer with the default [`CachePolicy`].
    pub fn new(store: St) -> Self {
        CacheLayerBuilder::new(store).build()
    }

    /// Returns a builder for fine-grained control over the cache policy.
    pub fn builder(store: St) -> CacheLayerBuilder<St> {
        CacheLayerBuilder::new(store)
    }

    /// The store shared by every service this layer produces.
    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Removes every entry from the store.
    pub async fn purge(&self) -> Result<(), CacheError> {
        self.store.purge().await?;
        #[cfg(feature = "tracing")]
        tracing::debug!("cache purged");
        emit(self.policy.events(), || CacheEvent::new(CacheEventType::Purge));
        Ok(())
    }
}

impl<S, St> Layer<S> for CacheLayer<St>
where
    St: CacheStore,
{
    type Service = CacheService<S, St>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            store: self.store.clone(),
            keys: CacheKeyBuilder::new(self.policy.include_query()),
            freshness: FreshnessEvaluator::new(self.policy.default_lifetime()),
            policy: self.policy.clone(),
            coalescer: self.coalescer.clone(),
        }
    }
}

#[derive(Clone)]
pub struct CacheService<S, St> {
    inner: S,
    store: St,
    policy: CachePolicy,
    keys: CacheKeyBuilder,
    freshness: FreshnessEvaluator,
    coalescer: MissCoalescer,
}

impl<S, St, ReqBody, ResBody> Service<Request<ReqBody>> for CacheService<S, St>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
    ReqBody: Body<Data = Bytes> + From<Bytes> + Send + 'static,
    ReqBody::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError> + Send,
    St: CacheStore,
{
    type Response = Response<Full<Bytes>>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let inner = self.inner.clone();
        let store = self.store.clone();
        let policy = self.policy.clone();
        let keys = self.keys;
        let freshness = self.freshness;
        let coalescer = self.coalescer.clone();

        Box::pin(async move {
            if !policy.should_cache_method(req.method()) {
                #[cfg(feature = "tracing")]
                tracing::debug!(method = %req.method(), uri = %req.uri(), "cache bypass");
                #[cfg(feature = "metrics")]
                counter!("tower_response_cache.bypass").increment(1);
                emit(policy.events(), || {
                    CacheEvent::new(CacheEventType::Bypass).with_request(
                        req.method(),
                        req.uri(),
                        req.headers(),
                    )
                });

                let response = inner.oneshot(req).await.map_err(Into::<BoxError>::into)?;
                return buffer_response(response).await;
            }

            let (parts, body) = req.into_parts();
            let (body, keyed_body) = if policy.keys_body_of(&parts.method) {
                let bytes = body.collect().await.map_err(Into::<BoxError>::into)?.to_bytes();
                (ReqBody::from(bytes.clone()), Some(bytes))
            } else {
                (body, None)
            };

            let method = parts.method.clone();
            let uri = parts.uri.clone();
            let headers = parts.headers.clone();
            let mut source = KeySource::new(&method, &uri, &headers);
            if let Some(bytes) = &keyed_body {
                source = source.with_body(bytes);
            }

            let request_directives = if policy.respect_request_directives() {
                Directives::from_request_headers(&headers)
            } else {
                Directives::default()
            };
            let provisional = keys.provisional(&source);
            let event = |kind: CacheEventType| {
                CacheEvent::new(kind)
                    .with_request(&method, &uri, &headers)
                    .with_key(provisional)
            };

            let lookup = Lookup {
                store: &store,
                keys: &keys,
                freshness: &freshness,
                source: &source,
                provisional,
                request: &request_directives,
            };

            let only_if_cached = request_directives.contains(Directive::OnlyIfCached);
            let mut leader: Option<LeaderGuard> = None;
            if request_directives.contains(Directive::NoCache) {
                #[cfg(feature = "tracing")]
                tracing::debug!(key = %provisional, "request no-cache, skipping lookup");
            } else {
                #[cfg(feature = "tracing")]
                tracing::debug!(method = %method, uri = %uri, key = %provisional, "cache lookup");

                if let Some(response) = lookup.serve(policy.events(), &event).await {
                    return Ok(response);
                }

                if !only_if_cached && policy.coalesce_misses() {
                    match coalescer.acquire(provisional).await {
                        Turn::Leader(guard) => leader = Some(guard),
                        Turn::Follower(lock) => {
                            wait_for_leader(lock).await;
                            if let Some(response) = lookup.serve(policy.events(), &event).await {
                                return Ok(response);
                            }
                        }
                    }
                }
            }

            // Also reached by no-cache requests, which never see a cached answer.
            if only_if_cached {
                #[cfg(feature = "tracing")]
                tracing::debug!(key = %provisional, "only-if-cached miss");
                #[cfg(feature = "metrics")]
                counter!("tower_response_cache.only_if_cached_miss").increment(1);
                emit(policy.events(), || event(CacheEventType::OnlyIfCachedMiss));
                return Ok(gateway_timeout());
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(key = %provisional, "cache miss, forwarding to origin");
            #[cfg(feature = "metrics")]
            counter!("tower_response_cache.miss").increment(1);
            emit(policy.events(), || event(CacheEventType::Miss));

            #[cfg(feature = "metrics")]
            let start = std::time::Instant::now();
            let response = inner
                .oneshot(Request::from_parts(parts, body))
                .await
                .map_err(Into::<BoxError>::into)?;
            #[cfg(feature = "metrics")]
            histogram!("tower_response_cache.origin_latency").record(start.elapsed().as_secs_f64());

            let (parts, body) = response.into_parts();
            let bytes = body.collect().await.map_err(Into::<BoxError>::into)?.to_bytes();

            let discard = if request_directives.contains(Directive::NoStore) {
                Some("request carries no-store")
            } else if !policy.should_cache_status(parts.status) {
                Some("status is not cacheable")
            } else if policy.max_body_size().is_some_and(|max| bytes.len() > max) {
                Some("body exceeds max size")
            } else {
                None
            };

            match discard {
                Some(_reason) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(key = %provisional, reason = _reason, "discarding response");
                    #[cfg(feature = "metrics")]
                    counter!("tower_response_cache.store_rejected").increment(1);
                    emit(policy.events(), || {
                        event(CacheEventType::StoreRejected)
                            .with_status(parts.status)
                            .with_reason(_reason)
                    });
                    drop(leader);
                }
                None => {
                    let entry = CacheEntry::capture(
                        &keys,
                        &freshness,
                        &source,
                        &parts,
                        bytes.clone(),
                        SystemTime::now(),
                    );
                    let template = policy
                        .events()
                        .enabled
                        .then(|| event(CacheEventType::Store));
                    let task = publish(
                        store.clone(),
                        entry,
                        template,
                        policy.events().clone(),
                        leader,
                    );
                    if policy.background_store() {
                        tokio::spawn(task);
                    } else {
                        task.await;
                    }
                }
            }

            Ok(Response::from_parts(parts, Full::from(bytes)))
        })
    }
}

/// Everything a lookup needs, borrowed from the request being served.
struct Lookup<'a, St> {
    store: &'a St,
    keys: &'a CacheKeyBuilder,
    freshness: &'a FreshnessEvaluator,
    source: &'a KeySource<'a>,
    provisional: CacheKey,
    request: &'a Directives,
}

impl<St> Lookup<'_, St>
where
    St: CacheStore,
{
    /// Picks the most recently stored variant that matches this request and is
    /// acceptable under its directives.
    ///
    /// A resource can hold variants stored under different `Vary` lists, so an
    /// unusable match must not hide a usable one.
    async fn find(&self, now: SystemTime) -> Option<(Arc<CacheEntry>, Acceptability)> {
        let candidates = match self.store.variants(&self.provisional).await {
            Ok(candidates) => candidates,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(key = %self.provisional, error = %_err, "cache lookup failed");
                return None;
            }
        };

        candidates
            .into_iter()
            .filter(|entry| self.keys.matches(self.source, entry))
            .filter_map(|entry| {
                let verdict = self.freshness.is_acceptable(&entry, self.request, now);
                verdict.is_acceptable().then_some((entry, verdict))
            })
            .max_by_key(|(entry, _)| entry.stored_at)
    }

    /// Renders a cached response when an acceptable entry exists.
    async fn serve<F>(&self, events: &EventLogConfig, event: &F) -> Option<Response<Full<Bytes>>>
    where
        F: Fn(CacheEventType) -> CacheEvent,
    {
        let now = SystemTime::now();
        let (entry, verdict) = self.find(now).await?;
        let remaining = self.freshness.remaining_freshness(&entry, now);

        let kind = match verdict {
            Acceptability::StaleAcceptable => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    key = %entry.key,
                    staleness = ?self.freshness.staleness(&entry, now),
                    "serving stale entry"
                );
                #[cfg(feature = "metrics")]
                counter!("tower_response_cache.stale_hit").increment(1);
                CacheEventType::StaleHit
            }
            _ => {
                #[cfg(feature = "tracing")]
                tracing::debug!(key = %entry.key, remaining = ?remaining, "cache hit");
                #[cfg(feature = "metrics")]
                counter!("tower_response_cache.hit").increment(1);
                CacheEventType::Hit
            }
        };
        emit(events, || {
            event(kind)
                .with_key(entry.key)
                .with_status(entry.status)
                .with_remaining(remaining)
                .with_size(entry.body.len())
        });

        Some(entry.to_response(self.freshness, now))
    }
}

/// Hands a captured entry to the store, then releases the miss lock (if any)
/// so waiting requests can re-run their lookup.
fn publish<St>(
    store: St,
    entry: CacheEntry,
    event: Option<CacheEvent>,
    events: EventLogConfig,
    leader: Option<LeaderGuard>,
) -> impl Future<Output = ()> + Send + 'static
where
    St: CacheStore,
{
    async move {
        let key = entry.key;
        let size = entry.body.len();
        let status = entry.status;

        match store.store(entry).await {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(key = %key, size, "stored response");
                #[cfg(feature = "metrics")]
                counter!("tower_response_cache.store").increment(1);
                if let Some(event) = event {
                    event.with_key(key).with_status(status).with_size(size).log(&events);
                }
            }
            Err(err @ (CacheError::NotCacheable(_) | CacheError::InvalidKey)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(key = %key, error = %err, "store refused response");
                #[cfg(feature = "metrics")]
                counter!("tower_response_cache.store_rejected").increment(1);
                if let Some(event) = event {
                    let mut event = event
                        .with_key(key)
                        .with_status(status)
                        .with_reason(err.to_string());
                    event.event_type = CacheEventType::StoreRejected;
                    event.log(&events);
                }
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(key = %key, error = %_err, "cache store failed");
                #[cfg(feature = "metrics")]
                counter!("tower_response_cache.store_error").increment(1);
            }
        }

        drop(leader);
    }
}

fn emit(config: &EventLogConfig, build: impl FnOnce() -> CacheEvent) {
    if config.enabled {
        build().log(config);
    }
}

fn gateway_timeout() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::default());
    *response.status_mut() = StatusCode::GATEWAY_TIMEOUT;
    response
}

async fn buffer_response<B>(response: Response<B>) -> Result<Response<Full<Bytes>>, BoxError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.map_err(Into::<BoxError>::into)?.to_bytes();
    Ok(Response::from_parts(parts, Full::from(bytes)))
}
