//! Configuration for the rate limiting middleware.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::response::Response;
use http::{Request, StatusCode};

use crate::error::{GatelimitError, Result};
use crate::policy::Decision;
use crate::store::{Clock, CounterStore, InMemoryStore, SystemClock};

/// Derives the identity key a request is counted under.
///
/// Returning `None` signals extraction failure, which the middleware treats
/// like a store failure (fail open or fail closed per configuration).
pub type KeyExtractor = Arc<dyn Fn(&Request<Body>) -> Option<String> + Send + Sync>;

/// Predicate deciding whether a request bypasses rate limiting entirely.
pub type SkipPredicate = Arc<dyn Fn(&Request<Body>) -> bool + Send + Sync>;

/// Hook invoked once for every rejected request.
pub type LimitReachedHook = Arc<dyn Fn(&Request<Body>) + Send + Sync>;

/// Builds the rejection response, overriding the default JSON body.
pub type RejectionHandler = Arc<dyn Fn(&Request<Body>, &Decision) -> Response + Send + Sync>;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_MAX_HITS: u64 = 60;
const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Validated configuration for one rate limiter.
///
/// Built through [`RateLimitConfig::builder`]; validation happens at build
/// time, never at request time. The counter store is owned by the
/// configuration, so several independently configured limiters can coexist
/// in one process.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Length of the fixed counting window.
    pub window: Duration,
    /// Maximum admitted hits per key per window.
    pub max_hits: u64,
    /// Status code of the default rejection response.
    pub status_code: StatusCode,
    /// Message carried by the default rejection body.
    pub message: String,
    /// Whether to attach `X-RateLimit-*` headers to responses.
    pub emit_headers: bool,
    /// Admit requests when the counter store is unreachable.
    pub fail_open_on_store_error: bool,
    pub(crate) store: Arc<dyn CounterStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) key_extractor: KeyExtractor,
    pub(crate) skip: Option<SkipPredicate>,
    pub(crate) on_limit_reached: Option<LimitReachedHook>,
    pub(crate) rejection_handler: Option<RejectionHandler>,
}

impl RateLimitConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }
}

/// Builder for [`RateLimitConfig`].
#[derive(Default)]
pub struct RateLimitConfigBuilder {
    window: Option<Duration>,
    max_hits: Option<u64>,
    status_code: Option<StatusCode>,
    message: Option<String>,
    emit_headers: Option<bool>,
    fail_open_on_store_error: Option<bool>,
    store: Option<Arc<dyn CounterStore>>,
    clock: Option<Arc<dyn Clock>>,
    key_extractor: Option<KeyExtractor>,
    skip: Option<SkipPredicate>,
    on_limit_reached: Option<LimitReachedHook>,
    rejection_handler: Option<RejectionHandler>,
}

impl RateLimitConfigBuilder {
    /// Length of the counting window (default 60 seconds).
    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Maximum admitted hits per key per window (default 60).
    pub fn max_hits(mut self, max_hits: u64) -> Self {
        self.max_hits = Some(max_hits);
        self
    }

    /// Status code for the default rejection response (default 429).
    pub fn status_code(mut self, status_code: StatusCode) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Message for the default rejection body.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Whether responses carry `X-RateLimit-*` headers (default true).
    pub fn emit_headers(mut self, emit_headers: bool) -> Self {
        self.emit_headers = Some(emit_headers);
        self
    }

    /// Admit requests when the store is unreachable (default false:
    /// infrastructure failures reject).
    pub fn fail_open_on_store_error(mut self, fail_open: bool) -> Self {
        self.fail_open_on_store_error = Some(fail_open);
        self
    }

    /// Counter store to count against (default: a fresh [`InMemoryStore`]).
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Clock used when computing retry times. Overridden in tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// How to derive the identity key from a request.
    ///
    /// The default reads the client socket address from the request's
    /// [`ConnectInfo`] extension, which axum populates when the server is
    /// started with `into_make_service_with_connect_info`.
    pub fn key_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Request<Body>) -> Option<String> + Send + Sync + 'static,
    {
        self.key_extractor = Some(Arc::new(extractor));
        self
    }

    /// Requests matching the predicate bypass counting entirely.
    pub fn skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&Request<Body>) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(skip));
        self
    }

    /// Invoked once per rejected request, for alerting or metrics. The hook
    /// cannot change the outcome.
    pub fn on_limit_reached<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request<Body>) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(hook));
        self
    }

    /// Replace the default rejection response entirely.
    pub fn rejection_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Request<Body>, &Decision) -> Response + Send + Sync + 'static,
    {
        self.rejection_handler = Some(Arc::new(handler));
        self
    }

    /// Validate and build the configuration.
    ///
    /// Fails with [`GatelimitError::InvalidConfiguration`] on a zero window
    /// or a zero hit limit. When no store was supplied, a fresh
    /// [`InMemoryStore`] is created here, which requires a running tokio
    /// runtime for its sweep task.
    pub fn build(self) -> Result<RateLimitConfig> {
        let window = self.window.unwrap_or(DEFAULT_WINDOW);
        if window.is_zero() {
            return Err(GatelimitError::InvalidConfiguration(
                "window must be positive".to_string(),
            ));
        }

        let max_hits = self.max_hits.unwrap_or(DEFAULT_MAX_HITS);
        if max_hits == 0 {
            return Err(GatelimitError::InvalidConfiguration(
                "max_hits must be positive".to_string(),
            ));
        }

        Ok(RateLimitConfig {
            window,
            max_hits,
            status_code: self.status_code.unwrap_or(StatusCode::TOO_MANY_REQUESTS),
            message: self.message.unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            emit_headers: self.emit_headers.unwrap_or(true),
            fail_open_on_store_error: self.fail_open_on_store_error.unwrap_or(false),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryStore::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            key_extractor: self
                .key_extractor
                .unwrap_or_else(|| Arc::new(client_address_key)),
            skip: self.skip,
            on_limit_reached: self.on_limit_reached,
            rejection_handler: self.rejection_handler,
        })
    }
}

/// Default key extractor: the client's network address.
fn client_address_key(request: &Request<Body>) -> Option<String> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults() {
        let config = RateLimitConfig::builder().build().unwrap();

        assert_eq!(config.window, Duration::from_secs(60));
        assert_eq!(config.max_hits, 60);
        assert_eq!(config.status_code, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(config.message, DEFAULT_MESSAGE);
        assert!(config.emit_headers);
        assert!(!config.fail_open_on_store_error);
        assert!(config.skip.is_none());
        assert!(config.on_limit_reached.is_none());
        assert!(config.rejection_handler.is_none());
    }

    #[tokio::test]
    async fn test_zero_window_is_rejected_at_build_time() {
        let result = RateLimitConfig::builder()
            .window(Duration::ZERO)
            .build();

        assert!(matches!(
            result,
            Err(GatelimitError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_max_hits_is_rejected_at_build_time() {
        let result = RateLimitConfig::builder().max_hits(0).build();

        assert!(matches!(
            result,
            Err(GatelimitError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_default_key_extractor_reads_connect_info() {
        let mut request = Request::builder()
            .uri("/")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_address_key(&request), None);

        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 1], 4000))));
        assert_eq!(client_address_key(&request), Some("10.0.0.1".to_string()));
    }
}
