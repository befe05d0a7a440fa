use std::fs;
use std::time::Duration;

use requests_cache::config::Config;
use requests_cache::http::HttpCache;
use requests_cache_test as test_utils;

#[test]
fn test_config_from_file() {
    let dir = test_utils::tempdir();
    let path = dir.path().join("config.yml");
    fs::write(
        &path,
        r#"
        cache:
          name: upstream
          ttl: 1m
          error_ttl: 5s
          max_entries: 10
        http:
          timeout: 10s
          key_headers: [authorization, x-tenant]
        "#,
    )
    .unwrap();

    let config = Config::get(Some(&path)).unwrap();
    assert_eq!(config.cache.name, "upstream");
    assert_eq!(config.cache.ttl, Duration::from_secs(60));
    assert_eq!(config.cache.error_ttl, Some(Duration::from_secs(5)));
    assert_eq!(config.http.timeout, Duration::from_secs(10));

    let cache = HttpCache::from_config(config.cache, &config.http).unwrap();
    assert_eq!(cache.cache().config().max_entries, 10);
}

#[test]
fn test_missing_file() {
    let dir = test_utils::tempdir();
    let err = Config::get(Some(&dir.path().join("missing.yml"))).unwrap_err();
    assert_eq!(err.to_string(), "failed to open configuration file");
}

#[test]
fn test_invalid_key_header() {
    let dir = test_utils::tempdir();
    let path = dir.path().join("config.yml");
    fs::write(&path, "http:\n  key_headers: ['not a header']\n").unwrap();

    let config = Config::get(Some(&path)).unwrap();
    assert!(HttpCache::from_config(config.cache, &config.http).is_err());
}
