use std::fmt::{self, Write};
use std::sync::Arc;

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName};
use sha2::{Digest, Sha256};
use url::Url;

/// Identifies outbound requests that may share a single response.
///
/// Two requests map to the same key if they agree in method, URL, body, and the values of all
/// configured key headers. All other headers are ignored.
#[derive(Debug, Clone, Eq)]
pub struct RequestKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.hash {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for RequestKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for RequestKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl RequestKey {
    /// Creates the key for `request`.
    ///
    /// Returns `None` if the request has a streaming body, which cannot be hashed up front.
    pub fn from_request(request: &reqwest::Request, key_headers: &[HeaderName]) -> Option<Self> {
        let mut builder = Self::builder(request.method(), request.url());
        builder.write_headers(request.headers(), key_headers).ok()?;
        match request.body() {
            Some(body) => builder.write_body(body.as_bytes()?).ok()?,
            None => builder.write_body(&[]).ok()?,
        }
        Some(builder.build())
    }

    /// Creates a [`RequestKeyBuilder`] for a request to `url`.
    pub fn builder(method: &Method, url: &Url) -> RequestKeyBuilder {
        RequestKeyBuilder {
            metadata: format!("method: {method}\nurl: {url}\n"),
        }
    }

    /// Returns the human-readable metadata that forms the basis of the [`RequestKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }
}

/// A builder for [`RequestKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and accepts human readable and
/// **stable** input, which is then hashed to form the key.
pub struct RequestKeyBuilder {
    metadata: String,
}

impl RequestKeyBuilder {
    /// Writes the values of `key_headers` present in `headers`.
    ///
    /// Headers are written in the order of `key_headers`, repeated headers in the order they
    /// appear in the request. Values that are not visible ASCII are written hex-encoded.
    pub fn write_headers(
        &mut self,
        headers: &HeaderMap,
        key_headers: &[HeaderName],
    ) -> Result<(), fmt::Error> {
        for name in key_headers {
            for value in headers.get_all(name) {
                match value.to_str() {
                    Ok(value) => writeln!(self.metadata, "header.{name}: {value}")?,
                    Err(_) => {
                        write!(self.metadata, "header.{name}.hex: ")?;
                        for b in value.as_bytes() {
                            write!(self.metadata, "{b:02x}")?;
                        }
                        writeln!(self.metadata)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Writes a digest of the request body.
    pub fn write_body(&mut self, body: &[u8]) -> Result<(), fmt::Error> {
        write!(self.metadata, "body: ")?;
        for b in Sha256::digest(body) {
            write!(self.metadata, "{b:02x}")?;
        }
        writeln!(self.metadata)
    }

    /// Finalize the [`RequestKey`].
    pub fn build(self) -> RequestKey {
        let hash = Sha256::digest(&self.metadata).into();

        RequestKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for RequestKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
