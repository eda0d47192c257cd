use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{ready, Ready};
use http::header::{AGE, CACHE_CONTROL, ETAG, EXPIRES, PRAGMA, VARY};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use tokio::time::sleep;
use tower::util::ServiceFn;
use tower::{service_fn, Layer, Service, ServiceExt};
use tower_response_cache::prelude::*;

type Reply = Ready<Result<Response<Full<Bytes>>, Infallible>>;

/// Origin that counts its calls and answers through `respond`, which gets the
/// request and the 1-based call number.
fn counting_origin<F>(
    counter: Arc<AtomicUsize>,
    respond: F,
) -> ServiceFn<impl FnMut(Request<Full<Bytes>>) -> Reply + Clone + Send + 'static>
where
    F: Fn(&Request<Full<Bytes>>, usize) -> Response<Full<Bytes>> + Clone + Send + 'static,
{
    service_fn(move |req: Request<Full<Bytes>>| {
        let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
        ready(Ok(respond(&req, call)))
    })
}

fn with_cache_control(value: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .header(CACHE_CONTROL, value)
        .body(Full::from(body.into()))
        .expect("valid response")
}

fn get(uri: &str) -> Request<Full<Bytes>> {
    Request::get(uri).body(Full::default()).expect("valid request")
}

fn get_with(uri: &str, name: &str, value: &str) -> Request<Full<Bytes>> {
    Request::get(uri)
        .header(name, value)
        .body(Full::default())
        .expect("valid request")
}

async fn body_string(response: Response<Full<Bytes>>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collected")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("body utf-8")
}

fn max_age(response: &Response<Full<Bytes>>) -> u64 {
    let value = response.headers()[CACHE_CONTROL]
        .to_str()
        .expect("cache-control is ascii");
    Directives::parse([value])
        .seconds(Directive::MaxAge)
        .expect("max-age present")
}

#[tokio::test]
async fn repeat_get_is_served_from_cache_with_default_lifetime() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::new_in_memory();
    let mut service = layer.layer(counting_origin(counter.clone(), |_req, _call| {
        Response::new(Full::from("hello"))
    }));

    service.ready().await.expect("service ready");
    let first = service.call(get("/foo")).await.expect("first call succeeds");
    assert_eq!(first.status(), StatusCode::OK);
    assert!(!first.headers().contains_key(AGE));
    assert_eq!(body_string(first).await, "hello");

    sleep(Duration::from_secs(1)).await;

    service.ready().await.expect("service ready");
    let second = service.call(get("/foo")).await.expect("second call succeeds");
    let remaining = max_age(&second);
    assert!(
        (86_390..=86_399).contains(&remaining),
        "remaining freshness should be just under a day, got {remaining}"
    );
    let age: u64 = second.headers()[AGE].to_str().unwrap().parse().unwrap();
    assert!((1..=5).contains(&age), "age {age} out of range");
    assert_eq!(body_string(second).await, "hello");
    assert_eq!(counter.load(Ordering::SeqCst), 1, "origin must not be contacted");
}

#[tokio::test]
async fn vary_variants_are_isolated() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let store = layer.store().clone();
    let service = layer.layer(counting_origin(counter.clone(), |req, _call| {
        let body = match req.headers().get("x-lang").map(|v| v.as_bytes()) {
            Some(b"fr") => "salut",
            _ => "hi",
        };
        Response::builder()
            .header(VARY, "X-Lang")
            .body(Full::from(body))
            .unwrap()
    }));

    for (lang, expected) in [("en", "hi"), ("fr", "salut"), ("en", "hi"), ("fr", "salut")] {
        let response = service
            .clone()
            .oneshot(get_with("/bar", "x-lang", lang))
            .await
            .expect("call succeeds");
        assert_eq!(body_string(response).await, expected, "variant {lang}");
    }

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(store.len().await.unwrap(), 2);
}

#[tokio::test]
async fn expired_variant_does_not_shadow_newer_entry() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let store = layer.store().clone();
    // Only the first response varies on the language header.
    let service = layer.layer(counting_origin(counter.clone(), |_req, call| {
        let mut response = with_cache_control("max-age=1", call.to_string());
        if call == 1 {
            response
                .headers_mut()
                .insert(VARY, http::HeaderValue::from_static("X-Lang"));
        }
        response
    }));

    for lang in ["en", "fr"] {
        service
            .clone()
            .oneshot(get_with("/news", "x-lang", lang))
            .await
            .unwrap();
    }
    assert_eq!(store.len().await.unwrap(), 2);

    sleep(Duration::from_millis(1_500)).await;

    for _ in 0..3 {
        let response = service
            .clone()
            .oneshot(get_with("/news", "x-lang", "en"))
            .await
            .unwrap();
        assert_eq!(body_string(response).await, "3");
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn forbidding_response_directives_are_never_served() {
    for directive in ["private", "no-store", "no-cache", "public, no-cache=\"set-cookie\""] {
        let counter = Arc::new(AtomicUsize::new(0));
        let layer = CacheLayer::builder(InMemoryStore::new())
            .background_store(false)
            .build();
        let store = layer.store().clone();
        let service = layer.layer(counting_origin(counter.clone(), move |_req, call| {
            with_cache_control(directive, call.to_string())
        }));

        let first = service.clone().oneshot(get("/secret")).await.unwrap();
        let second = service.clone().oneshot(get("/secret")).await.unwrap();

        assert_eq!(body_string(first).await, "1");
        assert_eq!(body_string(second).await, "2", "{directive} must not be cached");
        assert_eq!(store.len().await.unwrap(), 0);
    }
}

#[tokio::test]
async fn expired_entry_misses_unless_request_allows_stale() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let service = layer.layer(counting_origin(counter.clone(), |_req, call| {
        with_cache_control("max-age=1", call.to_string())
    }));

    let warm = service.clone().oneshot(get("/short")).await.unwrap();
    assert_eq!(body_string(warm).await, "1");

    sleep(Duration::from_millis(1_500)).await;

    let stale = service
        .clone()
        .oneshot(get_with("/short", "cache-control", "max-stale=60"))
        .await
        .unwrap();
    assert_eq!(max_age(&stale), 0);
    assert_eq!(body_string(stale).await, "1");
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    let fresh = service.clone().oneshot(get("/short")).await.unwrap();
    assert_eq!(body_string(fresh).await, "2");
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn must_revalidate_forbids_stale_service() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let service = layer.layer(counting_origin(counter.clone(), |_req, call| {
        with_cache_control("max-age=1, must-revalidate", call.to_string())
    }));

    service.clone().oneshot(get("/strict")).await.unwrap();
    sleep(Duration::from_millis(1_500)).await;

    let response = service
        .clone()
        .oneshot(get_with("/strict", "cache-control", "max-stale"))
        .await
        .unwrap();
    assert_eq!(body_string(response).await, "2");
}

#[tokio::test]
async fn only_if_cached_is_answered_from_cache_or_gateway_timeout() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let service = layer.layer(counting_origin(counter.clone(), |_req, _call| {
        Response::new(Full::from("cached"))
    }));

    let cold = service
        .clone()
        .oneshot(get_with("/offline", "cache-control", "only-if-cached"))
        .await
        .unwrap();
    assert_eq!(cold.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    service.clone().oneshot(get("/offline")).await.unwrap();

    let warm = service
        .clone()
        .oneshot(get_with("/offline", "cache-control", "only-if-cached"))
        .await
        .unwrap();
    assert_eq!(warm.status(), StatusCode::OK);
    assert_eq!(body_string(warm).await, "cached");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn only_if_cached_with_no_cache_never_reaches_origin() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let store = layer.store().clone();
    let service = layer.layer(counting_origin(counter.clone(), |_req, call| {
        Response::new(Full::from(call.to_string()))
    }));

    let cold = service
        .clone()
        .oneshot(get_with("/cold", "cache-control", "no-cache, only-if-cached"))
        .await
        .unwrap();
    assert_eq!(cold.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    service.clone().oneshot(get("/cold")).await.unwrap();
    assert_eq!(store.len().await.unwrap(), 1);

    let warm = service
        .clone()
        .oneshot(get_with("/cold", "cache-control", "no-cache, only-if-cached"))
        .await
        .unwrap();
    assert_eq!(warm.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn request_no_cache_forwards_and_refreshes_entry() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let service = layer.layer(counting_origin(counter.clone(), |_req, call| {
        Response::new(Full::from(call.to_string()))
    }));

    service.clone().oneshot(get("/feed")).await.unwrap();

    let forced = service
        .clone()
        .oneshot(get_with("/feed", "cache-control", "no-cache"))
        .await
        .unwrap();
    assert_eq!(body_string(forced).await, "2");

    let pragma = service
        .clone()
        .oneshot(get_with("/feed", PRAGMA.as_str(), "no-cache"))
        .await
        .unwrap();
    assert_eq!(body_string(pragma).await, "3");

    let cached = service.clone().oneshot(get("/feed")).await.unwrap();
    assert_eq!(body_string(cached).await, "3");
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn request_no_store_skips_storage() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let store = layer.store().clone();
    let service = layer.layer(counting_origin(counter.clone(), |_req, _call| {
        Response::new(Full::from("body"))
    }));

    service
        .clone()
        .oneshot(get_with("/private", "cache-control", "no-store"))
        .await
        .unwrap();

    assert_eq!(store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn ignored_request_directives_do_not_bypass_cache() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .respect_request_directives(false)
        .build();
    let service = layer.layer(counting_origin(counter.clone(), |_req, call| {
        Response::new(Full::from(call.to_string()))
    }));

    service.clone().oneshot(get("/feed")).await.unwrap();
    let response = service
        .clone()
        .oneshot(get_with("/feed", "cache-control", "no-cache"))
        .await
        .unwrap();

    assert_eq!(body_string(response).await, "1");
}

#[tokio::test]
async fn non_cacheable_methods_pass_through() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let store = layer.store().clone();
    let service = layer.layer(counting_origin(counter.clone(), |req, call| {
        assert_eq!(req.method(), Method::PUT);
        Response::new(Full::from(call.to_string()))
    }));

    for expected in ["1", "2"] {
        let request = Request::put("/foo").body(Full::from("payload")).unwrap();
        let response = service.clone().oneshot(request).await.unwrap();
        assert_eq!(body_string(response).await, expected);
    }
    assert_eq!(store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn post_bodies_are_part_of_the_key() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();

    let handler = service_fn({
        let counter = counter.clone();
        move |req: Request<Full<Bytes>>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let body = req.into_body().collect().await?.to_bytes();
                Ok::<_, Infallible>(Response::new(Full::from(body)))
            }
        }
    });
    let service = layer.layer(handler);

    for (payload, expected_calls) in [("alpha", 1), ("alpha", 1), ("beta", 2)] {
        let request = Request::post("/search")
            .body(Full::from(payload))
            .expect("valid request");
        let response = service.clone().oneshot(request).await.unwrap();
        assert_eq!(body_string(response).await, payload, "origin sees the same body");
        assert_eq!(counter.load(Ordering::SeqCst), expected_calls);
    }
}

#[tokio::test]
async fn query_string_toggle_controls_key() {
    for (include_query, expected_calls) in [(true, 2), (false, 1)] {
        let counter = Arc::new(AtomicUsize::new(0));
        let layer = CacheLayer::builder(InMemoryStore::new())
            .background_store(false)
            .include_query(include_query)
            .build();
        let service = layer.layer(counting_origin(counter.clone(), |_req, _call| {
            Response::new(Full::from("list"))
        }));

        service.clone().oneshot(get("/items?page=1")).await.unwrap();
        service.clone().oneshot(get("/items?page=2")).await.unwrap();

        assert_eq!(
            counter.load(Ordering::SeqCst),
            expected_calls,
            "include_query = {include_query}"
        );
    }
}

#[tokio::test]
async fn background_store_publishes_after_response() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::new_in_memory();
    let store = layer.store().clone();
    let service = layer.layer(counting_origin(counter.clone(), |_req, _call| {
        Response::new(Full::from("later"))
    }));

    service.clone().oneshot(get("/async")).await.unwrap();

    let mut stored = false;
    for _ in 0..50 {
        if store.len().await.unwrap() == 1 {
            stored = true;
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(stored, "background store should land");

    service.clone().oneshot(get("/async")).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cached_response_keeps_origin_validators_and_timestamps() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let service = layer.layer(counting_origin(counter.clone(), |_req, _call| {
        Response::builder()
            .header(ETAG, "\"v7\"")
            .header(EXPIRES, "Sat, 06 Nov 2094 08:49:37 GMT")
            .header("content-type", "application/json")
            .body(Full::from("{}"))
            .unwrap()
    }));

    service.clone().oneshot(get("/doc")).await.unwrap();
    let cached = service.clone().oneshot(get("/doc")).await.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(cached.headers()[ETAG], "\"v7\"");
    assert_eq!(cached.headers()[EXPIRES], "Sat, 06 Nov 2094 08:49:37 GMT");
    assert_eq!(cached.headers()["content-type"], "application/json");
    assert!(cached.headers().contains_key(http::header::LAST_MODIFIED));
}

#[tokio::test]
async fn disallowed_statuses_are_forwarded_but_not_stored() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let service = layer.layer(counting_origin(counter.clone(), |_req, _call| {
        let mut response = Response::new(Full::from("boom"));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    }));

    for _ in 0..2 {
        let response = service.clone().oneshot(get("/flaky")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coalesced_misses_reach_origin_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .coalesce_misses(true)
        .build();

    let handler = service_fn({
        let counter = counter.clone();
        move |_req: Request<Full<Bytes>>| {
            let counter = counter.clone();
            async move {
                let value = counter.fetch_add(1, Ordering::SeqCst) + 1;
                sleep(Duration::from_millis(100)).await;
                Ok::<_, Infallible>(Response::new(Full::from(value.to_string())))
            }
        }
    });

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = layer.layer(handler.clone());
            tokio::spawn(async move {
                let response = service.oneshot(get("/hot")).await.expect("call succeeds");
                body_string(response).await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.expect("task joined"), "1");
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn purge_forgets_everything() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = CacheLayer::builder(InMemoryStore::new())
        .background_store(false)
        .build();
    let service = layer.clone().layer(counting_origin(counter.clone(), |_req, _call| {
        Response::new(Full::from("x"))
    }));

    service.clone().oneshot(get("/a")).await.unwrap();
    service.clone().oneshot(get("/b")).await.unwrap();
    assert_eq!(layer.store().len().await.unwrap(), 2);

    layer.purge().await.expect("purge succeeds");
    assert_eq!(layer.store().len().await.unwrap(), 0);

    service.clone().oneshot(get("/a")).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}
