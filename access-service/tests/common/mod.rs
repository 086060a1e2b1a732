//! Shared setup for access-service integration tests.
//!
//! Everything runs in process: the in-memory directory and session store, the
//! in-memory permission cache and in-memory rate limiters, driven through the
//! real router with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use access_service::{
    build_router,
    context::RequestContext,
    handlers::auth::CookieSettings,
    models::{
        Membership, MembershipAction, MembershipHistoryEntry, Organization, OrganizationType,
        Permission, Role, User,
    },
    services::{Directory, JwtService, MemoryPermissionCache, MemoryStore},
    utils::hash_password,
    AppState, CoreParts, HttpSettings, RateLimiters, ServiceInfo,
};
use axum::{
    body::Body,
    http::{header, Request, Response, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use secrecy::SecretString;
use serde_json::Value;
use service_core::middleware::security_headers::SecurityHeaders;
use service_core::rate_limit::{MemoryRateLimiter, RateLimitPolicy};
use std::{sync::Arc, time::Duration};
use tower::util::ServiceExt;
use uuid::Uuid;

pub const TEST_SECRET: &str = "integration-test-signing-secret-0123456789";
pub const PASSWORD: &str = "correct horse battery staple";

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<MemoryStore>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_limits(
            RateLimitPolicy::new(1000, 60, 1000),
            RateLimitPolicy::new(1000, 60, 1000),
        )
    }

    pub fn with_limits(api: RateLimitPolicy, auth: RateLimitPolicy) -> Self {
        Self::build(api, auth, 0)
    }

    /// Limits plus the number of trusted reverse proxies in front of the router.
    pub fn build(api: RateLimitPolicy, auth: RateLimitPolicy, trusted_proxy_hops: usize) -> Self {
        let store = Arc::new(MemoryStore::new());
        let cleanup = Duration::from_secs(3600);

        let core = CoreParts {
            directory: store.clone(),
            sessions: store.clone(),
            cache: Arc::new(MemoryPermissionCache::new(Duration::from_secs(900))),
            jwt: JwtService::from_secret(&SecretString::new(TEST_SECRET.to_string()), 15, 7),
            store_timeout: Duration::from_secs(5),
        };
        let limiters = RateLimiters {
            api: Arc::new(MemoryRateLimiter::new("api", api, cleanup).unwrap()),
            auth: Arc::new(MemoryRateLimiter::new("auth", auth, cleanup).unwrap()),
            trusted_proxy_hops,
        };
        let http = HttpSettings {
            cookies: CookieSettings {
                path: "/auth".to_string(),
                secure: false,
                max_age_days: 7,
            },
            security: SecurityHeaders {
                strict_transport: false,
            },
            allowed_origins: vec!["http://localhost:3000".to_string()],
            request_timeout: Duration::from_secs(30),
        };
        let service = ServiceInfo {
            name: "access-service".to_string(),
            version: "test".to_string(),
        };

        let state = AppState::new(service, core, limiters, http);
        let router = build_router(state.clone());
        Self {
            router,
            state,
            store,
        }
    }

    // Seeding

    pub async fn permission(&self, name: &str) {
        self.store
            .insert_permission(&Permission::new(name.to_string(), None))
            .await
            .unwrap();
    }

    pub async fn role(
        &self,
        name: &str,
        level: i32,
        org_types: &[OrganizationType],
        permissions: &[&str],
    ) -> Role {
        for p in permissions {
            if self.store.find_permission(p).await.unwrap().is_none() {
                self.permission(p).await;
            }
        }
        let role = Role::new(name.to_string(), level, org_types);
        let grants: Vec<String> = permissions.iter().map(|p| p.to_string()).collect();
        self.store.insert_role(&role, &grants).await.unwrap();
        role
    }

    pub async fn org(
        &self,
        org_type: OrganizationType,
        code: &str,
        parent: Option<&Organization>,
    ) -> Organization {
        let org = Organization::new(
            org_type,
            format!("{} label", code),
            code.to_string(),
            parent.map(|p| p.org_id),
        );
        self.store.insert_organization(&org).await.unwrap();
        org
    }

    pub async fn user(&self, email: &str) -> User {
        let hash = hash_password(PASSWORD).unwrap();
        let user = User::new(email.to_string(), None, Some(hash));
        self.store.insert_user(&user).await.unwrap();
        user
    }

    pub async fn store_user(&self, email: &str) -> User {
        self.store.find_user_by_email(email).await.unwrap().unwrap()
    }

    pub async fn member(&self, user: &User, org: &Organization, role: &Role) -> Membership {
        let membership = Membership::new(user.user_id, org.org_id, role.role_id);
        let entry =
            MembershipHistoryEntry::record(&membership, MembershipAction::Assigned, user.user_id);
        self.store
            .insert_membership(&membership, &entry)
            .await
            .unwrap();
        membership
    }

    /// A context as the auth gate would build it.
    pub fn context(&self, user: &User, role: &Role, org: Option<&Organization>) -> RequestContext {
        RequestContext {
            user_id: user.user_id,
            role_id: role.role_id,
            role_level: role.role_level,
            organization_id: org.map(|o| o.org_id),
            session_id: Uuid::new_v4(),
            request_id: Uuid::new_v4().to_string(),
            deadline: tokio::time::Instant::now() + Duration::from_secs(30),
        }
    }

    // HTTP

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Log in over HTTP; returns the access token and the refresh cookie value.
    pub async fn login(&self, email: &str, org: Option<&Organization>) -> (String, String) {
        let response = self
            .send(json_request(
                "POST",
                "/auth/login",
                serde_json::json!({
                    "email": email,
                    "password": PASSWORD,
                    "organization_id": org.map(|o| o.org_id),
                }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = refresh_cookie(&response).expect("login sets the refresh cookie");
        let body = body_json(response).await;
        let token = body["access_token"].as_str().unwrap().to_string();
        (token, cookie)
    }
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn authed(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub fn with_cookie(method: &str, uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(value) = cookie {
        builder = builder.header(header::COOKIE, format!("refresh_token={}", value));
    }
    builder.body(Body::empty()).unwrap()
}

/// The raw `Set-Cookie` header for the refresh cookie, if any.
pub fn set_cookie_header(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with("refresh_token="))
        .map(|v| v.to_string())
}

/// Value of a refresh cookie being set. `None` when absent or cleared.
pub fn refresh_cookie(response: &Response<Body>) -> Option<String> {
    let header = set_cookie_header(response)?;
    let value = header
        .split(';')
        .next()?
        .trim()
        .strip_prefix("refresh_token=")?;
    (!value.is_empty()).then(|| value.to_string())
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}
