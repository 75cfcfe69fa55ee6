//! tower middleware bridging requests to the counter store and policy.
//!
//! This is the only component that touches the transport layer: it derives
//! the identity key, drives the store, evaluates the policy, and turns the
//! verdict into headers plus either a pass-through or a rejection response.
//! Store and extraction failures are absorbed here; they never surface as
//! service errors.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use http::header::RETRY_AFTER;
use http::{HeaderMap, HeaderValue, Request, StatusCode};
use tower::{Layer, Service};
use tracing::{debug, trace, warn};

use crate::config::RateLimitConfig;
use crate::error::GatelimitError;
use crate::policy::{evaluate, Decision};

/// Applies a configured rate limit to every request passing through.
#[derive(Clone)]
pub struct RateLimitLayer {
    config: Arc<RateLimitConfig>,
}

impl RateLimitLayer {
    /// Wrap a validated configuration in a layer.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            config: self.config.clone(),
        }
    }
}

/// The service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    config: Arc<RateLimitConfig>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let config = self.config.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            if let Some(skip) = &config.skip {
                if skip(&request) {
                    trace!(path = %request.uri().path(), "Skipping rate limit");
                    return inner.call(request).await;
                }
            }

            let key = match (config.key_extractor)(&request) {
                Some(key) if !key.is_empty() => key,
                _ => {
                    warn!(
                        path = %request.uri().path(),
                        "Key extraction produced no identity key"
                    );
                    if config.fail_open_on_store_error {
                        return inner.call(request).await;
                    }
                    return Ok(unavailable_response(&GatelimitError::KeyExtraction));
                }
            };

            // The increment runs on its own task: if the client disconnects
            // and this future is dropped mid-await, the hit is still
            // counted. The store's own operation timeout bounds the spawned
            // work, so nothing leaks.
            let store = config.store.clone();
            let window = config.window;
            let increment_key = key.clone();
            let result = match tokio::spawn(
                async move { store.increment(&increment_key, window).await },
            )
            .await
            {
                Ok(result) => result,
                Err(join_error) => Err(GatelimitError::StoreUnavailable(join_error.to_string())),
            };

            let record = match result {
                Ok(record) => record,
                Err(err) => {
                    warn!(key = %key, error = %err, "Counter store increment failed");
                    if config.fail_open_on_store_error {
                        debug!(key = %key, "Admitting request despite store failure");
                        return inner.call(request).await;
                    }
                    return Ok(unavailable_response(&err));
                }
            };

            let decision = evaluate(&record, config.max_hits, config.clock.now_ms());

            if decision.admitted {
                trace!(
                    key = %key,
                    hits = record.hit_count,
                    remaining = decision.remaining,
                    "Request admitted"
                );
                let mut response = inner.call(request).await?;
                if config.emit_headers {
                    apply_rate_limit_headers(response.headers_mut(), &decision);
                }
                Ok(response)
            } else {
                debug!(key = %key, hits = record.hit_count, "Rate limit exceeded");

                if let Some(hook) = &config.on_limit_reached {
                    hook(&request);
                }

                let mut response = match &config.rejection_handler {
                    Some(handler) => handler(&request, &decision),
                    None => default_rejection(&config),
                };
                if config.emit_headers {
                    apply_rate_limit_headers(response.headers_mut(), &decision);
                }
                Ok(response)
            }
        })
    }
}

/// Attach the standard rate limit headers; `Retry-After` only appears on
/// rejections, since the decision carries it only then.
fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_at_secs));
    if let Some(retry_after) = decision.retry_after_secs {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
}

fn default_rejection(config: &RateLimitConfig) -> Response {
    let body = serde_json::json!({
        "success": false,
        "message": config.message,
    });
    (config.status_code, axum::Json(body)).into_response()
}

fn unavailable_response(err: &GatelimitError) -> Response {
    debug!(error = %err, "Rejecting request, limiter unavailable");
    let body = serde_json::json!({
        "success": false,
        "message": "Service temporarily unavailable.",
    });
    (StatusCode::SERVICE_UNAVAILABLE, axum::Json(body)).into_response()
}
