//! Per-IP token bucket rate limiting for the HTTP surface.
//!
//! One bucket per client IP, refilled lazily at check time. Limits come
//! from [`ServerConfig`](crate::config::ServerConfig) so deployments can
//! tune them per instance; buckets for idle clients are purged by a
//! background task in `main`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug)]
struct Bucket {
    available: f64,
    refreshed_at: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    /// Sustained refill rate, requests per second.
    per_second: f64,
    /// Bucket capacity, i.e. the largest tolerated burst.
    burst: f64,
    buckets: Arc<Mutex<HashMap<IpAddr, Bucket>>>,
}

impl RateLimiter {
    pub fn new(per_second: f64, burst: f64) -> Self {
        Self {
            per_second,
            burst,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Account one request against `ip`. Returns false when the bucket is
    /// exhausted and the request should be rejected.
    pub async fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;

        let bucket = buckets.entry(ip).or_insert_with(|| Bucket {
            available: self.burst,
            refreshed_at: now,
        });

        let elapsed = now.duration_since(bucket.refreshed_at).as_secs_f64();
        bucket.available = (bucket.available + elapsed * self.per_second).min(self.burst);
        bucket.refreshed_at = now;

        if bucket.available < 1.0 {
            return false;
        }
        bucket.available -= 1.0;
        true
    }

    /// Drop buckets that have not been touched for `max_idle`. An evicted
    /// client simply starts over with a full bucket.
    pub async fn purge_stale(&self, max_idle: Duration) {
        let now = Instant::now();
        self.buckets
            .lock()
            .await
            .retain(|_, bucket| now.duration_since(bucket.refreshed_at) < max_idle);
    }

    #[cfg(test)]
    async fn tracked_ips(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(ip) = client_ip(&req) {
        if !limiter.check(ip).await {
            warn!(ip = %ip, "rate limit exceeded");
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
    }

    Ok(next.run(req).await)
}

/// The peer address from `ConnectInfo`, or the first `X-Forwarded-For` hop
/// when running behind a proxy.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .or_else(|| {
            req.headers()
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .and_then(|first| first.trim().parse().ok())
        })
}
