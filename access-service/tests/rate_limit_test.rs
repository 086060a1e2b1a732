mod common;

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, Request, StatusCode},
};
use common::TestApp;
use service_core::rate_limit::RateLimitPolicy;
use std::net::SocketAddr;

fn peer(ip: [u8; 4]) -> SocketAddr {
    SocketAddr::from((ip, 40000))
}

fn refresh_from(peer: SocketAddr, forwarded_for: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri("/auth/refresh");
    if let Some(value) = forwarded_for {
        builder = builder.header("x-forwarded-for", value);
    }
    let mut request = builder.body(Body::empty()).unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

fn roles_from(peer: SocketAddr) -> Request<Body> {
    let mut request = Request::builder()
        .method("GET")
        .uri("/api/roles")
        .header(header::AUTHORIZATION, "Bearer bogus")
        .body(Body::empty())
        .unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    request
}

fn auth_burst_of_three(trusted_proxy_hops: usize) -> TestApp {
    TestApp::build(
        RateLimitPolicy::new(1000, 60, 1000),
        RateLimitPolicy::new(3, 60, 3),
        trusted_proxy_hops,
    )
}

#[tokio::test]
async fn test_burst_passes_then_limited() {
    let app = auth_burst_of_three(0);
    let client = peer([198, 51, 100, 7]);

    for _ in 0..3 {
        let response = app.send(refresh_from(client, None)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = app.send(refresh_from(client, None)).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
}

#[tokio::test]
async fn test_rotating_forwarded_for_does_not_reset_budget() {
    let app = auth_burst_of_three(0);
    let client = peer([198, 51, 100, 7]);

    for n in 1..=3 {
        let spoofed = format!("203.0.113.{}", n);
        let response = app.send(refresh_from(client, Some(&spoofed))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    for n in 4..=8 {
        let spoofed = format!("203.0.113.{}", n);
        let response = app.send(refresh_from(client, Some(&spoofed))).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}

#[tokio::test]
async fn test_distinct_client_is_unaffected() {
    let app = auth_burst_of_three(0);

    for _ in 0..4 {
        app.send(refresh_from(peer([198, 51, 100, 7]), None)).await;
    }

    let response = app.send(refresh_from(peer([203, 0, 113, 20]), None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_scopes_are_limited_independently() {
    let app = auth_burst_of_three(0);
    let client = peer([198, 51, 100, 7]);

    for _ in 0..4 {
        app.send(refresh_from(client, None)).await;
    }

    // The exhausted auth bucket does not spill into the API scope.
    let response = app.send(roles_from(client)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_behind_trusted_proxy_the_proxy_appended_hop_is_the_key() {
    let app = auth_burst_of_three(1);
    let proxy = peer([10, 0, 0, 1]);

    // Client-written prefixes vary; the hop appended by the proxy does not.
    for n in 1..=3 {
        let chain = format!("192.0.2.{}, 198.51.100.7", n);
        let response = app.send(refresh_from(proxy, Some(&chain))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let response = app
        .send(refresh_from(proxy, Some("192.0.2.99, 198.51.100.7")))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    // Another client behind the same proxy keeps its own budget.
    let response = app
        .send(refresh_from(proxy, Some("203.0.113.20")))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
