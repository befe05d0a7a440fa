use std::collections::BTreeMap;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};

use requests_cache::caching::CacheError;
use requests_cache::http::HttpCache;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

/// A request that is issued over and over again with the given concurrency.
#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".into()
}

/// A validated [`Workload`].
#[derive(Debug, Clone)]
pub struct ParsedPayload {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<String>,
}

pub fn prepare_payload(workload: &Workload) -> Result<ParsedPayload> {
    let method = Method::from_bytes(workload.method.as_bytes())
        .with_context(|| format!("invalid method {:?}", workload.method))?;
    let url = workload
        .url
        .parse()
        .with_context(|| format!("invalid url {:?}", workload.url))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &workload.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name {name:?}"))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header {name}"))?;
        headers.append(name, value);
    }

    Ok(ParsedPayload {
        method,
        url,
        headers,
        body: workload.body.clone(),
    })
}

/// The outcome of a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    HttpError,
    Timeout,
}

pub async fn process_payload(cache: &HttpCache, payload: &ParsedPayload) -> Result<Outcome> {
    let mut request = cache
        .client()
        .request(payload.method.clone(), payload.url.clone())
        .headers(payload.headers.clone());
    if let Some(body) = &payload.body {
        request = request.body(body.clone());
    }
    let request = request.build().context("failed to build request")?;

    let outcome = match cache.execute(request).await {
        Ok(response) if response.status.is_success() => Outcome::Success,
        Ok(response) => {
            tracing::debug!(status = %response.status, url = %response.url, "Unsuccessful response");
            Outcome::HttpError
        }
        Err(CacheError::WaitTimeout(_)) => Outcome::Timeout,
        Err(err) => {
            tracing::debug!(error = &err as &dyn std::error::Error, "Request failed");
            Outcome::HttpError
        }
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_workloads() {
        let yaml = r#"
            workloads:
              - concurrency: 10
                url: http://localhost:8080/a
              - concurrency: 2
                url: http://localhost:8080/b
                method: POST
                headers:
                  x-tenant: one
                body: payload
        "#;
        let config: WorkloadsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workloads.len(), 2);

        let get = prepare_payload(&config.workloads[0]).unwrap();
        assert_eq!(get.method, Method::GET);
        assert!(get.headers.is_empty());
        assert!(get.body.is_none());

        let post = prepare_payload(&config.workloads[1]).unwrap();
        assert_eq!(post.method, Method::POST);
        assert_eq!(post.headers["x-tenant"], "one");
        assert_eq!(post.body.as_deref(), Some("payload"));
    }

    #[test]
    fn test_invalid_workload() {
        let workload = Workload {
            concurrency: 1,
            url: "not a url".into(),
            method: default_method(),
            headers: Default::default(),
            body: None,
        };
        let err = prepare_payload(&workload).unwrap_err();
        assert_eq!(err.to_string(), r#"invalid url "not a url""#);
    }
}
