pub mod config;
pub mod context;
pub mod db;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::{
    http::{header, HeaderName, HeaderValue, Method, Request},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post, put},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use service_core::middleware::{
    metrics::metrics_middleware,
    rate_limit::{ip_rate_limit_middleware, IpRateLimit},
    security_headers::{security_headers_middleware, SecurityHeaders},
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use service_core::rate_limit::SharedLimiter;
use std::{sync::Arc, time::Duration};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::handlers::auth::CookieSettings;
use crate::middleware::{auth_middleware, require_permission, PermissionGuard};
use crate::services::{
    AuthorizationChecker, AuthorizationEngine, Directory, JwtService, PermissionCache,
    RedisService, RoleService, SessionStore, TokenService,
};

#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
}

/// Authoritative stores and signing keys the core is built over.
pub struct CoreParts {
    pub directory: Arc<dyn Directory>,
    pub sessions: Arc<dyn SessionStore>,
    pub cache: Arc<dyn PermissionCache>,
    pub jwt: JwtService,
    pub store_timeout: Duration,
}

/// One limiter per scope, keyed by caller IP.
#[derive(Clone)]
pub struct RateLimiters {
    pub api: SharedLimiter,
    pub auth: SharedLimiter,
    pub trusted_proxy_hops: usize,
}

impl RateLimiters {
    fn gate(&self, limiter: &SharedLimiter) -> IpRateLimit {
        IpRateLimit::new(limiter.clone(), self.trusted_proxy_hops)
    }
}

#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub cookies: CookieSettings,
    pub security: SecurityHeaders,
    pub allowed_origins: Vec<String>,
    /// Whole-request deadline, also the budget handed to core calls.
    pub request_timeout: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub service: ServiceInfo,
    pub directory: Arc<dyn Directory>,
    pub authz: AuthorizationEngine,
    pub tokens: TokenService,
    pub roles: RoleService,
    pub limiters: RateLimiters,
    pub redis: Option<RedisService>,
    pub metrics: Option<PrometheusHandle>,
    pub cookies: CookieSettings,
    pub security: SecurityHeaders,
    pub allowed_origins: Vec<String>,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(
        service: ServiceInfo,
        core: CoreParts,
        limiters: RateLimiters,
        http: HttpSettings,
    ) -> Self {
        let authz =
            AuthorizationEngine::new(core.directory.clone(), core.cache, core.store_timeout);
        let tokens = TokenService::new(
            core.directory.clone(),
            core.sessions,
            authz.clone(),
            core.jwt,
            core.store_timeout,
        );
        let roles = RoleService::new(
            core.directory.clone(),
            authz.clone(),
            tokens.clone(),
            core.store_timeout,
        );

        Self {
            service,
            directory: core.directory,
            authz,
            tokens,
            roles,
            limiters,
            redis: None,
            metrics: None,
            cookies: http.cookies,
            security: http.security,
            allowed_origins: http.allowed_origins,
            request_timeout: http.request_timeout,
        }
    }

    pub fn with_redis(mut self, redis: RedisService) -> Self {
        self.redis = Some(redis);
        self
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    fn checker(&self) -> Arc<dyn AuthorizationChecker> {
        Arc::new(self.authz.clone())
    }
}

/// Require `permission` on every route in `routes`.
fn guarded(
    state: &AppState,
    permission: &'static str,
    routes: Router<AppState>,
) -> Router<AppState> {
    routes.route_layer(from_fn_with_state(
        PermissionGuard::new(state.checker(), permission),
        require_permission,
    ))
}

pub fn build_router(state: AppState) -> Router {
    let session_routes = Router::new()
        .route(
            "/auth/switch-organization",
            post(handlers::auth::switch_organization),
        )
        .route("/auth/me", get(handlers::auth::me))
        .route_layer(from_fn_with_state(state.clone(), auth_middleware));

    let auth_routes = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/introspect", post(handlers::auth::introspect))
        .merge(session_routes)
        .layer(from_fn_with_state(
            state.limiters.gate(&state.limiters.auth),
            ip_rate_limit_middleware,
        ));

    let api_routes = Router::new()
        .merge(guarded(
            &state,
            "roles:read",
            Router::new().route("/api/roles", get(handlers::roles::list_roles)),
        ))
        .merge(guarded(
            &state,
            "roles:write",
            Router::new()
                .route("/api/roles", post(handlers::roles::create_role))
                .route("/api/roles/:role_id", delete(handlers::roles::delete_role))
                .route(
                    "/api/roles/:role_id/permissions",
                    put(handlers::roles::update_role_permissions),
                ),
        ))
        .merge(guarded(
            &state,
            "permissions:delete",
            Router::new().route(
                "/api/permissions/:perm_name",
                delete(handlers::roles::delete_permission),
            ),
        ))
        .merge(guarded(
            &state,
            "members:read",
            Router::new()
                .route(
                    "/api/organizations/:org_id/members",
                    get(handlers::members::list_members),
                )
                .route(
                    "/api/memberships/:membership_id/history",
                    get(handlers::members::membership_history),
                ),
        ))
        .merge(guarded(
            &state,
            "members:write",
            Router::new()
                .route(
                    "/api/organizations/:org_id/members",
                    post(handlers::members::assign_member),
                )
                .route(
                    "/api/memberships/:membership_id",
                    delete(handlers::members::deactivate_membership),
                ),
        ))
        .route(
            "/api/organizations/join",
            post(handlers::members::join_organization),
        )
        .route_layer(from_fn_with_state(state.clone(), auth_middleware))
        .layer(from_fn_with_state(
            state.limiters.gate(&state.limiters.api),
            ip_rate_limit_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics))
        .merge(auth_routes)
        .merge(api_routes)
        .with_state(state.clone())
        .layer(from_fn(metrics_middleware))
        .layer(TimeoutLayer::new(state.request_timeout))
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
            let request_id = request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("-");

            tracing::info_span!(
                "http_request",
                request_id = %request_id,
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
            )
        }))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn_with_state(state.security, security_headers_middleware))
        .layer(cors_layer(&state.allowed_origins))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ]);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(AllowOrigin::any());
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                None
            }
        })
        .collect();

    // The refresh cookie needs credentialed requests.
    layer.allow_origin(parsed).allow_credentials(true)
}
