//! # Middleware Module
//!
//! Global request rate limiting for the monitoring server, configured by
//! `[server] rate_limit` or `RETE_RATE_LIMIT` (requests per second).
//!
//! Liveness checks and the event stream are never limited. A rejected
//! request gets `429` with a JSON [`ErrorResponse`] and a `Retry-After`
//! header in whole seconds.

use super::types::ErrorResponse;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Fallback when a zero rate reaches the limiter.
const DEFAULT_RPS: NonZeroU32 = match NonZeroU32::new(100) {
    Some(rps) => rps,
    None => NonZeroU32::MIN,
};

/// Paths that bypass the limiter.
pub const UNLIMITED_PATHS: [&str; 2] = ["/health", "/ws"];

// =============================================================================
// RATE LIMITER
// =============================================================================

/// One token bucket shared by every limited route.
#[derive(Clone)]
pub struct GlobalRateLimiter {
    bucket: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    per_second: NonZeroU32,
}

impl GlobalRateLimiter {
    #[must_use]
    pub fn per_second(&self) -> u32 {
        self.per_second.get()
    }

    /// Take one token, or return the whole seconds to wait for the next.
    pub fn acquire(&self) -> Result<(), u64> {
        self.bucket.check().map_err(|not_until| {
            let wait = not_until.wait_time_from(self.bucket.clock().now());
            wait.as_secs_f64().ceil().max(1.0) as u64
        })
    }
}

/// Create a global limiter allowing `requests_per_second`.
pub fn create_rate_limiter(requests_per_second: u32) -> GlobalRateLimiter {
    let per_second = NonZeroU32::new(requests_per_second).unwrap_or(DEFAULT_RPS);
    GlobalRateLimiter {
        bucket: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
        per_second,
    }
}

/// Reject with 429 once the limiter is exhausted.
pub async fn rate_limit_middleware(
    State(limiter): State<GlobalRateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if UNLIMITED_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }
    match limiter.acquire() {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::warn!(
                path = %request.uri().path(),
                retry_after,
                "rate limit exceeded"
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after.to_string())],
                Json(ErrorResponse {
                    error: format!(
                        "Rate limit of {} requests/second exceeded",
                        limiter.per_second()
                    ),
                }),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_request_waits_at_least_a_second() {
        let limiter = create_rate_limiter(1);
        assert!(limiter.acquire().is_ok());
        let wait = limiter.acquire().expect_err("bucket is empty");
        assert!(wait >= 1);
    }

    #[test]
    fn zero_rate_falls_back_to_default() {
        let limiter = create_rate_limiter(0);
        assert_eq!(limiter.per_second(), 100);
        assert!(limiter.acquire().is_ok());
    }
}
