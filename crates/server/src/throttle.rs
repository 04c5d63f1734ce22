//! Process-wide request throttle.
//!
//! One token bucket shared by every client: `per_second` sustained with
//! bursts up to `burst`. Requests over the limit get 429 and a
//! `retry-after` header.

use std::num::NonZeroU32;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::debug;

use crate::api::ErrorResponse;

pub type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Zero values are raised to 1.
pub fn limiter(per_second: u32, burst: u32) -> Arc<Limiter> {
    let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN))
        .allow_burst(NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN));
    Arc::new(RateLimiter::direct(quota))
}

pub struct Throttled {
    retry_after: u64,
}

impl IntoResponse for Throttled {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: "too many requests".to_string(),
        });
        let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        response.headers_mut().insert(
            HeaderName::from_static("retry-after"),
            HeaderValue::from(self.retry_after),
        );
        response
    }
}

pub async fn throttle(
    State(limiter): State<Arc<Limiter>>,
    request: Request,
    next: Next,
) -> Result<Response, Throttled> {
    match limiter.check() {
        Ok(()) => Ok(next.run(request).await),
        Err(not_until) => {
            let retry_after = not_until
                .wait_time_from(DefaultClock::default().now())
                .as_secs()
                .max(1);
            debug!(path = %request.uri().path(), retry_after, "request throttled");
            Err(Throttled { retry_after })
        }
    }
}
