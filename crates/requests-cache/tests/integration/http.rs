use std::time::Duration;

use futures::future::join_all;
use reqwest::{Method, StatusCode};

use requests_cache::caching::CacheError;
use requests_cache::http::HttpError;

use crate::{HitCounter, setup_cache};

#[tokio::test]
async fn test_identical_requests_are_coalesced() {
    let cache = setup_cache(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/delay/100ms/coalesced");

    let responses = join_all((0..10).map(|_| {
        let request = cache.client().get(url.clone()).build().unwrap();
        cache.execute(request)
    }))
    .await;

    for response in responses {
        let response = response.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text(), "GET coalesced");
    }
    assert_eq!(hitcounter.accesses(), 1);

    let stats = cache.cache().stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.coalesced, 9);
}

#[tokio::test]
async fn test_completed_response_is_reused() {
    let cache = setup_cache(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/echo/reused");

    for _ in 0..3 {
        let request = cache.client().get(url.clone()).build().unwrap();
        let response = cache.execute(request).await.unwrap();
        assert_eq!(response.text(), "GET - ");
    }

    assert_eq!(hitcounter.accesses(), 1);
    assert_eq!(cache.cache().stats().hits, 2);
}

#[tokio::test]
async fn test_expired_response_is_refetched() {
    let cache = setup_cache(|config| config.ttl = Duration::from_millis(100));
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/echo/expired");

    let request = cache.client().get(url.clone()).build().unwrap();
    cache.execute(request).await.unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let request = cache.client().get(url).build().unwrap();
    cache.execute(request).await.unwrap();

    assert_eq!(hitcounter.accesses(), 2);
}

#[tokio::test]
async fn test_method_is_part_of_key() {
    let cache = setup_cache(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/delay/50ms/method");

    let get = cache.client().request(Method::GET, url.clone()).build().unwrap();
    let post = cache.client().request(Method::POST, url).build().unwrap();
    let (get, post) = tokio::join!(cache.execute(get), cache.execute(post));

    assert_eq!(get.unwrap().text(), "GET method");
    assert_eq!(post.unwrap().text(), "POST method");
    assert_eq!(hitcounter.accesses(), 2);
}

#[tokio::test]
async fn test_body_is_part_of_key() {
    let cache = setup_cache(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/echo/body");

    let requests = ["one", "two", "one"].map(|body| {
        cache
            .client()
            .post(url.clone())
            .body(body)
            .build()
            .unwrap()
    });
    let responses = join_all(requests.map(|request| cache.execute(request))).await;
    let bodies: Vec<_> = responses
        .into_iter()
        .map(|response| response.unwrap().text().into_owned())
        .collect();

    assert_eq!(bodies, ["POST - one", "POST - two", "POST - one"]);
    assert_eq!(hitcounter.accesses(), 2);
}

#[tokio::test]
async fn test_key_headers() {
    let cache = setup_cache(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/echo/headers");

    let request = |tenant: &str, agent: &str| {
        cache
            .client()
            .get(url.clone())
            .header("x-tenant", tenant)
            .header("user-agent", agent)
            .build()
            .unwrap()
    };

    let first = cache.execute(request("a", "curl")).await.unwrap();
    // headers that are not configured as key headers do not matter
    let second = cache.execute(request("a", "firefox")).await.unwrap();
    let other_tenant = cache.execute(request("b", "curl")).await.unwrap();

    assert_eq!(first.text(), "GET a ");
    assert_eq!(second.text(), "GET a ");
    assert_eq!(other_tenant.text(), "GET b ");
    assert_eq!(hitcounter.accesses(), 2);
}

#[tokio::test]
async fn test_error_status_is_cached() {
    let cache = setup_cache(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/respond_statuscode/500/failing");

    for _ in 0..2 {
        let request = cache.client().get(url.clone()).build().unwrap();
        let response = cache.execute(request).await.unwrap();
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    assert_eq!(hitcounter.accesses(), 1);
}

#[tokio::test]
async fn test_connection_error_is_cached() {
    let cache = setup_cache(|_| {});

    // Bind and immediately close a socket to get a port nobody listens on.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let url = format!("http://127.0.0.1:{port}/refused");

    for _ in 0..2 {
        let request = cache.client().get(&url).build().unwrap();
        let err = cache.execute(request).await.unwrap_err();
        assert!(matches!(err, CacheError::Executor(HttpError::Connect(_))));
    }

    let stats = cache.cache().stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn test_execute_timeout() {
    let cache = setup_cache(|_| {});
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/delay/1h/slow");

    let request = cache.client().get(url).build().unwrap();
    let result = cache
        .execute_timeout(request, Duration::from_millis(100))
        .await;

    assert_eq!(
        result.unwrap_err(),
        CacheError::WaitTimeout(Duration::from_millis(100))
    );
    // without waiters, the upstream request was cancelled
    assert!(cache.cache().is_empty());
}
