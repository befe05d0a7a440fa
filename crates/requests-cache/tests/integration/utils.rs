use requests_cache::caching::CacheConfig;
use requests_cache::http::{HttpCache, HttpConfig};
use requests_cache_test as test;

pub use test::HitCounter;

/// Setup tests and create an [`HttpCache`] keyed on the `x-tenant` header.
///
/// The `update_config` closure can modify the default cache configuration if needed.
pub fn setup_cache(update_config: impl FnOnce(&mut CacheConfig)) -> HttpCache {
    test::setup();

    let mut cache_config = CacheConfig {
        name: "integration".into(),
        ..Default::default()
    };
    update_config(&mut cache_config);

    let http_config = HttpConfig {
        key_headers: vec!["x-tenant".into()],
        ..Default::default()
    };
    HttpCache::from_config(cache_config, &http_config).unwrap()
}
