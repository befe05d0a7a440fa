use std::time::Duration;

use serde::Deserialize;

/// Configuration of a single [`CoalescingCache`](super::CoalescingCache).
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the cache, used to tag metrics and logs.
    pub name: String,

    /// How long a completed result is served without calling the executor again.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// How long a failed result is served before the call is retried.
    ///
    /// Falls back to [`ttl`](Self::ttl) when unset.
    #[serde(with = "humantime_serde")]
    pub error_ttl: Option<Duration>,

    /// Upper bound on the number of retained entries.
    ///
    /// In-flight calls are never dropped to satisfy this bound, only completed entries are
    /// evicted. A value of `0` is treated as `1`.
    pub max_entries: usize,

    /// Cadence of the background task removing expired entries.
    ///
    /// Expired entries are always replaced lazily on lookup. The background sweep additionally
    /// frees memory held by keys that are never requested again.
    #[serde(with = "humantime_serde")]
    pub eviction_sweep_interval: Option<Duration>,
}

impl CacheConfig {
    /// The time-to-live for an entry holding the given result.
    pub(crate) fn ttl_for<T, E>(&self, result: &Result<T, E>) -> Duration {
        match result {
            Ok(_) => self.ttl,
            Err(_) => self.error_ttl.unwrap_or(self.ttl),
        }
    }

    pub(crate) fn effective_max_entries(&self) -> usize {
        self.max_entries.max(1)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "requests".into(),
            ttl: Duration::from_secs(5),
            error_ttl: None,
            max_entries: 1000,
            eviction_sweep_interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: CacheConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg, CacheConfig::default());
        assert_eq!(cfg.ttl, Duration::from_secs(5));
        assert_eq!(cfg.max_entries, 1000);
    }

    #[test]
    fn test_humantime_durations() {
        let yaml = r#"
            name: upstream
            ttl: 1m 30s
            error_ttl: 500ms
            max_entries: 10
            eviction_sweep_interval: 1h
        "#;
        let cfg: CacheConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(cfg.name, "upstream");
        assert_eq!(cfg.ttl, Duration::from_secs(90));
        assert_eq!(cfg.error_ttl, Some(Duration::from_millis(500)));
        assert_eq!(cfg.max_entries, 10);
        assert_eq!(cfg.eviction_sweep_interval, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_ttl_for() {
        let cfg = CacheConfig {
            ttl: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(cfg.ttl_for(&Err::<(), _>(())), Duration::from_secs(10));

        let cfg = CacheConfig {
            error_ttl: Some(Duration::from_secs(1)),
            ..cfg
        };
        assert_eq!(cfg.ttl_for(&Ok::<_, ()>(())), Duration::from_secs(10));
        assert_eq!(cfg.ttl_for(&Err::<(), _>(())), Duration::from_secs(1));
    }

    #[test]
    fn test_zero_max_entries() {
        let cfg = CacheConfig {
            max_entries: 0,
            ..Default::default()
        };
        assert_eq!(cfg.effective_max_entries(), 1);
    }
}
