//! HTTP client wrapper with a pluggable response-interceptor chain.
//!
//! The client is a thin layer over `reqwest` providing the pieces the
//! acquisition pipeline needs: connect/read timeouts, custom headers,
//! streaming downloads into a caller-supplied file with cooperative
//! cancellation and progress reporting, and a response-interceptor chain.
//! Interceptors observe a successful response's content type and may
//! consume the response to produce a follow-up request; the bearer-token
//! exchange ([`BearerTokenInterceptor`]) is one such interceptor.
//!
//! Non-2xx responses are not errors at this layer: they come back as a
//! normal [`HttpFetch`] carrying the status code, and callers classify
//! them. Connection-level failures and timeouts are errors.

mod bearer;

pub use bearer::{BearerToken, BearerTokenInterceptor};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::opds::ContentKind;

/// Default connect timeout in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default read timeout in seconds, sized for large book downloads.
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Maximum interceptor indirections followed for a single request.
const MAX_INDIRECTIONS: usize = 5;

/// Errors raised by the HTTP layer.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Connection-level failure: DNS, refused connection, TLS, timeout.
    #[error("connection failed for {url}: {source}")]
    Connection {
        /// The URL that failed.
        url: Url,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The response body stream failed mid-transfer.
    #[error("transfer failed for {url}: {source}")]
    Transfer {
        /// The URL that failed.
        url: Url,
        /// The underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// An interceptor envelope document failed to parse.
    #[error("invalid indirection envelope from {url}: {message}")]
    Envelope {
        /// The URL that served the envelope.
        url: Url,
        /// Description of the problem.
        message: String,
    },

    /// The interceptor chain exceeded the indirection budget.
    #[error("too many indirections fetching {url}")]
    TooManyIndirections {
        /// The originally requested URL.
        url: Url,
    },

    /// Writing the response body to disk failed.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The operation observed its cancellation flag. Not a failure:
    /// callers record no error code for cancellation.
    #[error("request cancelled")]
    Cancelled,
}

/// A request as built by the client or an interceptor.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Target URL.
    pub url: Url,
    /// Extra headers to send, as (name, value) pairs.
    pub headers: Vec<(String, String)>,
    /// Basic credentials, when the caller holds some.
    pub basic_auth: Option<(String, String)>,
}

impl HttpRequest {
    /// Creates a plain GET request with no extra headers.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
            basic_auth: None,
        }
    }

    /// Attaches basic credentials.
    #[must_use]
    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A response after the interceptor chain has settled.
#[derive(Debug)]
pub struct HttpFetch {
    /// The URL that produced this response (the final hop).
    pub url: Url,
    /// HTTP status code.
    pub status: u16,
    /// Parsed Content-Type header, when present.
    pub content_type: Option<ContentKind>,
    /// Content-Length, when declared.
    pub content_length: Option<u64>,
    response: reqwest::Response,
}

impl HttpFetch {
    /// Returns true for 2xx responses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Reads the whole body into memory.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Transfer`] if the body stream fails.
    pub async fn bytes(self) -> Result<Vec<u8>, HttpError> {
        let url = self.url.clone();
        let bytes = self
            .response
            .bytes()
            .await
            .map_err(|source| HttpError::Transfer { url, source })?;
        Ok(bytes.to_vec())
    }

    /// Streams the body into a file, checking the cancellation flag
    /// before each chunk and reporting progress as
    /// `(bytes_received, expected_total)` after each chunk.
    ///
    /// Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Cancelled`] when the flag is observed set,
    /// [`HttpError::Transfer`] if the stream fails, or [`HttpError::Io`]
    /// if the file cannot be written. The partial file is left for the
    /// caller to discard; nothing downstream observes it.
    #[instrument(skip(self, cancelled, on_progress), fields(url = %self.url, path = %path.display()))]
    pub async fn stream_to_file(
        self,
        path: &Path,
        cancelled: &AtomicBool,
        mut on_progress: impl FnMut(u64, Option<u64>),
    ) -> Result<u64, HttpError> {
        let url = self.url.clone();
        let expected = self.content_length;

        let file = File::create(path)
            .await
            .map_err(|source| HttpError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let mut writer = BufWriter::new(file);
        let mut stream = self.response.bytes_stream();
        let mut received: u64 = 0;

        while let Some(chunk) = stream.next().await {
            if cancelled.load(Ordering::SeqCst) {
                debug!("download cancelled mid-stream");
                return Err(HttpError::Cancelled);
            }
            let chunk = chunk.map_err(|source| HttpError::Transfer {
                url: url.clone(),
                source,
            })?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|source| HttpError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            received += chunk.len() as u64;
            on_progress(received, expected);
        }

        writer.flush().await.map_err(|source| HttpError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(bytes = received, "download stream complete");
        Ok(received)
    }
}

/// An interceptor that may consume a successful response and produce a
/// follow-up request.
///
/// Uses `async_trait` so the client can hold a heterogeneous chain of
/// `Arc<dyn HttpInterceptor>`.
#[async_trait]
pub trait HttpInterceptor: Send + Sync {
    /// Returns the interceptor's name for logging.
    fn name(&self) -> &'static str;

    /// Returns true if this interceptor consumes responses of the given
    /// content type.
    fn is_applicable_to(&self, content_type: &ContentKind) -> bool;

    /// Consumes the response and produces the follow-up request.
    async fn intercept(&self, response: HttpFetch) -> Result<HttpRequest, HttpError>;
}

/// HTTP client for the acquisition engine.
///
/// Created once and reused: connection pooling lives in the inner
/// `reqwest::Client`. Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    interceptors: Arc<Vec<Arc<dyn HttpInterceptor>>>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.interceptors.iter().map(|i| i.name()).collect();
        f.debug_struct("HttpClient")
            .field("interceptors", &names)
            .finish_non_exhaustive()
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with default timeouts and the default
    /// interceptor chain (bearer-token exchange).
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with explicit timeout values and the default
    /// interceptor chain.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the
    /// supplied timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .build()
            .expect("failed to build HTTP client with static configuration");

        let interceptors: Vec<Arc<dyn HttpInterceptor>> =
            vec![Arc::new(BearerTokenInterceptor::new())];

        Self {
            client,
            interceptors: Arc::new(interceptors),
        }
    }

    /// Replaces the interceptor chain.
    #[must_use]
    pub fn with_interceptors(mut self, interceptors: Vec<Arc<dyn HttpInterceptor>>) -> Self {
        self.interceptors = Arc::new(interceptors);
        self
    }

    /// Issues a GET request and runs the interceptor chain to
    /// completion.
    ///
    /// Successful responses whose content type matches an interceptor
    /// are consumed by it; the follow-up request it produces is issued
    /// next, up to a fixed indirection budget. The settled response is
    /// returned whatever its status code.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Connection`] on connection-level failures or
    /// timeouts, [`HttpError::TooManyIndirections`] if the chain does
    /// not settle, or whatever error an interceptor raises.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpFetch, HttpError> {
        let original_url = request.url.clone();
        let mut request = request;

        for _hop in 0..=MAX_INDIRECTIONS {
            let fetch = self.send(&request).await?;

            if fetch.is_success()
                && let Some(content_type) = fetch.content_type.clone()
                && let Some(interceptor) = self
                    .interceptors
                    .iter()
                    .find(|candidate| candidate.is_applicable_to(&content_type))
            {
                debug!(
                    interceptor = interceptor.name(),
                    content_type = %content_type,
                    "response consumed by interceptor"
                );
                request = interceptor.intercept(fetch).await?;
                continue;
            }

            return Ok(fetch);
        }

        warn!(url = %original_url, "interceptor chain did not settle");
        Err(HttpError::TooManyIndirections { url: original_url })
    }

    async fn send(&self, request: &HttpRequest) -> Result<HttpFetch, HttpError> {
        let mut builder = self.client.get(request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }

        let response = builder
            .send()
            .await
            .map_err(|source| HttpError::Connection {
                url: request.url.clone(),
                source,
            })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ContentKind::new);
        let content_length = response.content_length();

        debug!(status, ?content_type, "response received");

        Ok(HttpFetch {
            url: request.url.clone(),
            status,
            content_type,
            content_length,
            response,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builders_compose() {
        let url = Url::parse("https://example.com/loans").unwrap();
        let request = HttpRequest::get(url)
            .with_basic_auth("abcd", "1234")
            .with_header("Accept", "application/json");

        assert_eq!(
            request.basic_auth,
            Some(("abcd".to_string(), "1234".to_string()))
        );
        assert_eq!(request.headers.len(), 1);
    }

    #[test]
    fn test_default_chain_contains_bearer_interceptor() {
        let client = HttpClient::new();
        assert!(
            client
                .interceptors
                .iter()
                .any(|i| i.name() == "bearer-token")
        );
    }

    #[test]
    fn test_http_error_cancelled_display() {
        assert_eq!(HttpError::Cancelled.to_string(), "request cancelled");
    }
}
