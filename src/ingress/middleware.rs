//! Ingress Middleware
//!
//! Per-IP token-bucket rate limiting over a one-minute window. Limiters
//! are created on demand per client address; every refusal is JSON like
//! the rest of the surface.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde_json::json;
use tracing::warn;

type IpRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Shared limiter table, one bucket per client IP.
pub struct RateLimitState {
    limiters: DashMap<IpAddr, IpRateLimiter>,
    per_minute: NonZeroU32,
}

impl RateLimitState {
    pub fn new(per_minute: u32) -> Self {
        Self {
            limiters: DashMap::new(),
            per_minute: NonZeroU32::new(per_minute.max(1)).unwrap_or(NonZeroU32::MIN),
        }
    }

    fn limiter_for(&self, ip: IpAddr) -> IpRateLimiter {
        if let Some(limiter) = self.limiters.get(&ip) {
            return Arc::clone(&limiter);
        }
        let limiter = Arc::new(RateLimiter::direct(Quota::per_minute(self.per_minute)));
        self.limiters.insert(ip, Arc::clone(&limiter));
        limiter
    }
}

/// Client address from proxy headers, falling back to loopback.
fn extract_client_ip(request: &Request) -> IpAddr {
    if let Some(forwarded_for) = request.headers().get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded_for.to_str() {
            // Rightmost entry is the one appended by the trusted proxy.
            if let Some(last_ip) = forwarded_str.split(',').next_back() {
                if let Ok(ip) = last_ip.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }
    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(real_ip_str) = real_ip.to_str() {
            if let Ok(ip) = real_ip_str.parse::<IpAddr>() {
                return ip;
            }
        }
    }
    "127.0.0.1".parse().unwrap()
}

/// Token-bucket rate limiting middleware. 429s are JSON.
pub async fn rate_limit(
    State(rate): State<Arc<RateLimitState>>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = extract_client_ip(&request);
    let limiter = rate.limiter_for(client_ip);

    match limiter.check() {
        Ok(_) => next.run(request).await,
        Err(_) => {
            warn!(%client_ip, "rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "rate limit exceeded",
                    "details": ["too many requests from this address; retry in a minute"]
                })),
            )
                .into_response()
        }
    }
}
