//! Bearer-token indirection.
//!
//! Some catalogs answer an acquisition request with a token envelope
//! instead of content: a short-lived access token and the location the
//! real content must be fetched from. This interceptor parses the
//! envelope and re-issues the request against the envelope's location
//! with an `Authorization: Bearer` header.
//!
//! Credential isolation is deliberate: the follow-up request starts from
//! a clean slate, so the original request's credentials are never sent
//! to the content host, and the bearer header is sent only to it.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{HttpError, HttpFetch, HttpInterceptor, HttpRequest};
use crate::opds::ContentKind;

/// The parsed token envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct BearerToken {
    /// The short-lived access token.
    pub access_token: String,
    /// Token lifetime in seconds, as declared by the server.
    pub expires_in: u64,
    /// Location the content must be fetched from.
    pub location: Url,
}

/// Interceptor implementing the bearer-token exchange.
#[derive(Debug, Default)]
pub struct BearerTokenInterceptor;

impl BearerTokenInterceptor {
    /// Creates the interceptor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Parses a token envelope document.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Envelope`] if the document is malformed.
    pub fn parse_envelope(url: &Url, bytes: &[u8]) -> Result<BearerToken, HttpError> {
        serde_json::from_slice(bytes).map_err(|error| HttpError::Envelope {
            url: url.clone(),
            message: error.to_string(),
        })
    }
}

#[async_trait]
impl HttpInterceptor for BearerTokenInterceptor {
    fn name(&self) -> &'static str {
        "bearer-token"
    }

    fn is_applicable_to(&self, content_type: &ContentKind) -> bool {
        content_type.is_compatible_with(&ContentKind::bearer_token())
    }

    async fn intercept(&self, response: HttpFetch) -> Result<HttpRequest, HttpError> {
        let envelope_url = response.url.clone();
        let bytes = response.bytes().await?;
        let token = Self::parse_envelope(&envelope_url, &bytes)?;

        debug!(
            location = %token.location,
            expires_in = token.expires_in,
            "following bearer-token indirection"
        );

        Ok(HttpRequest::get(token.location.clone())
            .with_header("Authorization", format!("Bearer {}", token.access_token)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://example.com/book.epub").unwrap()
    }

    #[test]
    fn test_parse_envelope_ok() {
        let bytes = br#"{
            "access_token": "abcd",
            "expires_in": 1000,
            "location": "https://content.example.com/book.epub"
        }"#;
        let token = BearerTokenInterceptor::parse_envelope(&url(), bytes).unwrap();
        assert_eq!(token.access_token, "abcd");
        assert_eq!(token.expires_in, 1000);
        assert_eq!(token.location.host_str(), Some("content.example.com"));
    }

    #[test]
    fn test_parse_envelope_malformed() {
        let result = BearerTokenInterceptor::parse_envelope(&url(), b"{}");
        assert!(matches!(result, Err(HttpError::Envelope { .. })));
    }

    #[test]
    fn test_applicable_only_to_bearer_content_type() {
        let interceptor = BearerTokenInterceptor::new();
        assert!(interceptor.is_applicable_to(&ContentKind::bearer_token()));
        assert!(!interceptor.is_applicable_to(&ContentKind::epub()));
    }
}
