//! Session endpoints under `/auth`.
//!
//! The refresh token never appears in a response body: it travels only in the
//! `refresh_token` cookie, scoped to the auth path prefix.

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::{
    context::RequestContext,
    services::{Introspection, IssuedSession, ServiceError, SwitchedOrganization},
    utils::ValidatedJson,
    AppState,
};

pub const REFRESH_COOKIE: &str = "refresh_token";

/// Attributes of the refresh cookie.
#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub path: String,
    pub secure: bool,
    pub max_age_days: i64,
}

impl CookieSettings {
    fn issue(&self, token: String) -> Cookie<'static> {
        Cookie::build((REFRESH_COOKIE, token))
            .path(self.path.clone())
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .expires(time::OffsetDateTime::now_utc() + time::Duration::days(self.max_age_days))
            .build()
    }

    fn cleared(&self) -> Cookie<'static> {
        Cookie::build((REFRESH_COOKIE, ""))
            .path(self.path.clone())
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .expires(time::OffsetDateTime::UNIX_EPOCH)
            .max_age(time::Duration::ZERO)
            .build()
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 1024))]
    pub password: String,
    pub organization_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchOrganizationRequest {
    pub organization_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct IntrospectRequest {
    #[validate(length(min = 1))]
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub role_level: i32,
    pub organization_id: Option<Uuid>,
    pub permissions: Vec<String>,
}

impl From<IssuedSession> for TokenResponse {
    fn from(issued: IssuedSession) -> Self {
        Self {
            access_token: issued.access_token,
            token_type: "Bearer".to_string(),
            expires_in: issued.expires_in,
            user_id: issued.user_id,
            role_id: issued.role_id,
            role_level: issued.role_level,
            organization_id: issued.organization_id,
            permissions: issued.permissions,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub role_level: i32,
    pub organization_id: Option<Uuid>,
    pub permissions: Vec<String>,
}

fn with_cookie(jar: CookieJar, settings: &CookieSettings, issued: IssuedSession) -> Response {
    let jar = jar.add(settings.issue(issued.refresh_token.clone()));
    (jar, Json(TokenResponse::from(issued))).into_response()
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<Response, AppError> {
    let issued = state
        .tokens
        .login(&req.email, &req.password, req.organization_id)
        .await?;
    Ok(with_cookie(jar, &state.cookies, issued))
}

/// Rotate the refresh cookie. Any failure to rotate clears it.
pub async fn refresh(State(state): State<AppState>, jar: CookieJar) -> Response {
    let Some(token) = jar.get(REFRESH_COOKIE).map(|c| c.value().to_string()) else {
        return AppError::Unauthorized(anyhow::anyhow!("Missing refresh token")).into_response();
    };

    match state.tokens.refresh(&token).await {
        Ok(issued) => with_cookie(jar, &state.cookies, issued),
        Err(e @ ServiceError::Unavailable(_)) | Err(e @ ServiceError::Internal(_)) => {
            tracing::error!(error = %e, "Token refresh failed");
            AppError::from(e).into_response()
        }
        Err(e) => {
            let jar = jar.add(state.cookies.cleared());
            (jar, AppError::from(e)).into_response()
        }
    }
}

/// Idempotent: a missing or already spent cookie is still a successful logout.
pub async fn logout(
    State(state): State<AppState>,
    jar: CookieJar,
) -> Result<(CookieJar, StatusCode), AppError> {
    let token = jar.get(REFRESH_COOKIE).map(|c| c.value().to_string());
    state.tokens.logout(token.as_deref()).await?;
    Ok((jar.add(state.cookies.cleared()), StatusCode::NO_CONTENT))
}

pub async fn switch_organization(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<SwitchOrganizationRequest>,
) -> Result<Json<SwitchedOrganization>, AppError> {
    let switched = state
        .tokens
        .switch_organization(&ctx, req.organization_id)
        .await?;
    Ok(Json(switched))
}

pub async fn introspect(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<IntrospectRequest>,
) -> Result<Json<Introspection>, AppError> {
    Ok(Json(state.tokens.introspect(&req.token).await?))
}

pub async fn me(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<MeResponse>, AppError> {
    let resolved = state.authz.resolve_permissions(ctx.role_id).await?;
    Ok(Json(MeResponse {
        user_id: ctx.user_id,
        role_id: ctx.role_id,
        role_level: resolved.role_level,
        organization_id: ctx.organization_id,
        permissions: resolved.sorted_permissions(),
    }))
}
