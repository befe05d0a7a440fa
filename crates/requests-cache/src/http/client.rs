use std::time::Duration;

use reqwest::header::HeaderName;
use serde::Deserialize;

/// Controls the HTTP client issuing outbound requests.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Global timeout for one request, including reading the full response body.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Request headers that distinguish otherwise identical requests.
    ///
    /// Requests that only differ in headers not listed here share a single response.
    pub key_headers: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
            key_headers: vec!["authorization".into(), "accept".into()],
        }
    }
}

impl HttpConfig {
    /// Parses the configured [`key_headers`](Self::key_headers).
    pub fn key_header_names(&self) -> anyhow::Result<Vec<HeaderName>> {
        self.key_headers
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| anyhow::anyhow!("invalid key header {name:?}"))
            })
            .collect()
    }
}

/// Creates a [`reqwest::Client`] with the configured timeouts.
pub fn create_client(config: &HttpConfig) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .connect_timeout(config.connect_timeout)
        .timeout(config.timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

#[cfg(test)]
mod tests {
    use reqwest::header::AUTHORIZATION;

    use super::*;

    #[test]
    fn test_key_header_names() {
        let config = HttpConfig {
            key_headers: vec!["Authorization".into(), "x-tenant".into()],
            ..Default::default()
        };
        let names = config.key_header_names().unwrap();
        assert_eq!(names[0], AUTHORIZATION);
        assert_eq!(names[1].as_str(), "x-tenant");
    }

    #[test]
    fn test_invalid_key_header() {
        let config = HttpConfig {
            key_headers: vec!["not a header".into()],
            ..Default::default()
        };
        let err = config.key_header_names().unwrap_err();
        assert_eq!(err.to_string(), r#"invalid key header "not a header""#);
    }

    #[test]
    fn test_humantime_timeouts() {
        let yaml = r#"
            connect_timeout: 1s
            timeout: 2m
        "#;
        let config: HttpConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert_eq!(config.key_headers, HttpConfig::default().key_headers);
    }
}
