use crate::{error::AppError, rate_limit::SharedLimiter};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, SocketAddr};

/// A limiter plus the number of reverse proxies in front of the service whose
/// `x-forwarded-for` entries can be believed.
#[derive(Clone)]
pub struct IpRateLimit {
    pub limiter: SharedLimiter,
    pub trusted_proxy_hops: usize,
}

impl IpRateLimit {
    pub fn new(limiter: SharedLimiter, trusted_proxy_hops: usize) -> Self {
        Self {
            limiter,
            trusted_proxy_hops,
        }
    }
}

/// Resolve the caller key for rate limiting.
///
/// With no trusted proxies the peer address is the only source. Otherwise each
/// trusted proxy appends one `x-forwarded-for` entry, so the caller is the
/// entry `trusted_proxy_hops` places from the right; anything further left was
/// written by the client.
pub fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxy_hops: usize,
) -> Option<IpAddr> {
    let peer_ip = peer.map(|addr| addr.ip());
    if trusted_proxy_hops == 0 {
        return peer_ip;
    }

    let hops: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if hops.is_empty() {
        return peer_ip;
    }

    let index = hops.len().saturating_sub(trusted_proxy_hops);
    hops[index].parse::<IpAddr>().ok().or(peer_ip)
}

/// Middleware for IP-keyed rate limiting against any configured backend.
pub async fn ip_rate_limit_middleware(
    State(gate): State<IpRateLimit>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let limiter = &gate.limiter;
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let ip = match client_ip(request.headers(), peer, gate.trusted_proxy_hops) {
        Some(ip) => ip,
        None => {
            tracing::warn!(scope = limiter.scope(), "Could not determine IP for rate limiting");
            return Ok(next.run(request).await);
        }
    };

    let decision = limiter.check(&ip.to_string()).await;
    if decision.is_allowed() {
        return Ok(next.run(request).await);
    }

    metrics::counter!("rate_limit_rejections_total", "scope" => limiter.scope().to_string())
        .increment(1);
    tracing::debug!(scope = limiter.scope(), ip = %ip, "Rate limit exceeded");

    Err(AppError::TooManyRequests(
        "Too many requests. Please try again later.".to_string(),
        decision.retry_after_secs(),
    ))
}
