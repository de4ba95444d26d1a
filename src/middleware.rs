//! HTTP middleware that enforces a [`RateLimiter`] in front of a service.
//!
//! Denied requests get `429 Too Many Requests` with the draft
//! `RateLimit-*` headers describing the active policy and when capacity
//! returns.

use std::{
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::{Either, Ready, ready};
use http::{HeaderValue, Request, Response, StatusCode, header::HeaderName};
use tower_layer::Layer;
use tower_service::Service;

use crate::{RateLimitInfo, RateLimiter};

/// Derives the limiter key from an incoming request, e.g. a user id header
/// or the client address.
pub type KeyExtractor<B> = Arc<dyn Fn(&Request<B>) -> String + Send + Sync>;

/// A tower layer that rate limits requests before they reach the inner
/// service.
pub struct RateLimitLayer<B> {
    limiter: Arc<RateLimiter>,
    key_extractor: KeyExtractor<B>,
}

impl<B> RateLimitLayer<B> {
    pub fn new(
        limiter: Arc<RateLimiter>,
        key_extractor: impl Fn(&Request<B>) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            limiter,
            key_extractor: Arc::new(key_extractor),
        }
    }
}

impl<B> Clone for RateLimitLayer<B> {
    fn clone(&self) -> Self {
        Self {
            limiter: Arc::clone(&self.limiter),
            key_extractor: Arc::clone(&self.key_extractor),
        }
    }
}

impl<S, B> Layer<S> for RateLimitLayer<B> {
    type Service = RateLimitService<S, B>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: Arc::clone(&self.limiter),
            key_extractor: Arc::clone(&self.key_extractor),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
pub struct RateLimitService<S, B> {
    inner: S,
    limiter: Arc<RateLimiter>,
    key_extractor: KeyExtractor<B>,
}

impl<S: Clone, B> Clone for RateLimitService<S, B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: Arc::clone(&self.limiter),
            key_extractor: Arc::clone(&self.key_extractor),
        }
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RateLimitService<S, ReqBody>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: Default,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Either<Ready<Result<Self::Response, Self::Error>>, S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let key = (self.key_extractor)(&request);

        let (allowed, info) = self.limiter.try_accept_with_info(&key);

        if allowed {
            Either::Right(self.inner.call(request))
        } else {
            Either::Left(ready(Ok(too_many_requests(&info))))
        }
    }
}

fn too_many_requests<ResBody: Default>(info: &RateLimitInfo) -> Response<ResBody> {
    let mut response = Response::new(ResBody::default());
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

    let headers = response.headers_mut();
    insert_header(headers, "ratelimit-limit", info.limit.to_string());
    insert_header(headers, "ratelimit-remaining", info.remaining.to_string());
    insert_header(headers, "ratelimit-reset", info.reset.as_secs_f64().to_string());
    insert_header(
        headers,
        "ratelimit-policy",
        format!("{};w={}", info.limit, info.window.as_secs_f64()),
    );

    response
}

fn insert_header(headers: &mut http::HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
