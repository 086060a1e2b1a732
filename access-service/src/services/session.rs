//! Session lifecycle: issue, rotate, switch organization, revoke.
//!
//! A session is a lineage of refresh sessions. Each refresh replaces the
//! current row with a successor in one atomic store call, so at most one
//! refresh token per lineage is ever valid. Presenting a rotated-out token
//! revokes the whole lineage.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

use super::{
    authorization::AuthorizationEngine,
    bounded,
    error::ServiceError,
    jwt::{AccessGrant, AccessTokenClaims, JwtService},
    store::{Directory, SessionStore},
};
use crate::{
    context::RequestContext,
    models::{Membership, RefreshSession, User},
    utils::{hash_token, token_matches, verify_password_blocking},
};

/// Tokens and context handed back on login and refresh.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub refresh_expires_at: DateTime<Utc>,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub role_level: i32,
    pub organization_id: Option<Uuid>,
    pub permissions: Vec<String>,
}

/// Result of an organization switch: a new access token only.
#[derive(Debug, Clone, Serialize)]
pub struct SwitchedOrganization {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub organization_id: Uuid,
    pub role_id: Uuid,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Introspection {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// Access-token claims parsed into typed ids.
#[derive(Debug, Clone, Copy)]
pub struct VerifiedAccess {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub role_level: i32,
    pub organization_id: Option<Uuid>,
    pub session_id: Uuid,
}

impl TryFrom<&AccessTokenClaims> for VerifiedAccess {
    type Error = ServiceError;

    fn try_from(claims: &AccessTokenClaims) -> Result<Self, Self::Error> {
        let parse = |raw: &str| {
            Uuid::parse_str(raw)
                .map_err(|_| ServiceError::Unauthorized("Malformed token claims".to_string()))
        };
        Ok(Self {
            user_id: parse(&claims.sub)?,
            role_id: parse(&claims.role_id)?,
            role_level: claims.role_level,
            organization_id: claims.org_id.as_deref().map(parse).transpose()?,
            session_id: parse(&claims.sid)?,
        })
    }
}

#[derive(Clone)]
pub struct TokenService {
    directory: Arc<dyn Directory>,
    sessions: Arc<dyn SessionStore>,
    authz: AuthorizationEngine,
    jwt: JwtService,
    store_timeout: Duration,
}

impl TokenService {
    pub fn new(
        directory: Arc<dyn Directory>,
        sessions: Arc<dyn SessionStore>,
        authz: AuthorizationEngine,
        jwt: JwtService,
        store_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            sessions,
            authz,
            jwt,
            store_timeout,
        }
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }

    /// Password login. Unknown email and wrong password are indistinguishable.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        organization_id: Option<Uuid>,
    ) -> Result<IssuedSession, ServiceError> {
        let invalid = || ServiceError::Unauthorized("Invalid credentials".to_string());

        let user = self.active_user_by_email(email).await?.ok_or_else(invalid)?;
        let stored_hash = user.password_hash.clone().ok_or_else(invalid)?;
        if !verify_password_blocking(password.to_string(), stored_hash).await {
            tracing::debug!(user_id = %user.user_id, "Password verification failed");
            return Err(invalid());
        }

        let issued = self.open_session(&user, organization_id).await?;
        tracing::info!(user_id = %user.user_id, "User logged in");
        Ok(issued)
    }

    /// Exchange an identity vouched for by an external provider for a session.
    pub async fn issue_for_identity(
        &self,
        email: &str,
        organization_id: Option<Uuid>,
    ) -> Result<IssuedSession, ServiceError> {
        let user = self
            .active_user_by_email(email)
            .await?
            .ok_or_else(|| ServiceError::Unauthorized("No account for this identity".to_string()))?;

        let issued = self.open_session(&user, organization_id).await?;
        tracing::info!(user_id = %user.user_id, "Session issued for external identity");
        Ok(issued)
    }

    /// Rotate a refresh token: the presented token is spent and a new pair is
    /// returned, or nothing changes.
    pub async fn refresh(&self, refresh_token: &str) -> Result<IssuedSession, ServiceError> {
        let session = self.presented_session(refresh_token).await?;

        if session.is_revoked() {
            let revoked = self.bounded_revoke_lineage(session.lineage_id).await?;
            tracing::warn!(
                user_id = %session.user_id,
                lineage_id = %session.lineage_id,
                revoked,
                "Rotated-out refresh token presented, lineage revoked"
            );
            return Err(ServiceError::Unauthorized(
                "Refresh token already used".to_string(),
            ));
        }
        if !session.is_valid() {
            return Err(ServiceError::Unauthorized("Refresh token expired".to_string()));
        }

        let user = bounded(
            self.store_timeout,
            "load user",
            self.directory.find_user_by_id(session.user_id),
        )
        .await?
        .filter(|u| u.active_flag);
        let Some(user) = user else {
            self.bounded_revoke(session.session_id).await?;
            return Err(ServiceError::Unauthorized("Account is disabled".to_string()));
        };

        let (membership, org_id) = match self.resolve_context(user.user_id, session.org_id).await {
            Ok(context) => context,
            Err(ServiceError::Forbidden(_)) | Err(ServiceError::NotFound(_)) => {
                self.bounded_revoke(session.session_id).await?;
                return Err(ServiceError::Unauthorized(
                    "Session no longer has an organization context".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };
        let resolved = self.authz.resolve_permissions(membership.role_id).await?;

        let mut next = session.successor(self.jwt.refresh_token_expiry_days());
        next.org_id = Some(org_id);
        let new_refresh = self
            .jwt
            .generate_refresh_token(user.user_id, next.session_id)?;
        next.token_hash_text = hash_token(&new_refresh);

        let grant = AccessGrant {
            user_id: user.user_id,
            role_id: membership.role_id,
            role_level: resolved.role_level,
            org_id: Some(org_id),
            session_id: next.session_id,
        };
        let access_token = self.jwt.generate_access_token(&grant)?;

        let rotated = bounded(
            self.store_timeout,
            "rotate refresh session",
            self.sessions.rotate_session(session.session_id, &next),
        )
        .await?;
        if !rotated {
            return Err(ServiceError::Unauthorized(
                "Refresh token already used".to_string(),
            ));
        }

        tracing::debug!(
            user_id = %user.user_id,
            lineage_id = %next.lineage_id,
            "Refresh token rotated"
        );
        Ok(IssuedSession {
            access_token,
            refresh_token: new_refresh,
            expires_in: self.jwt.access_token_expiry_seconds(),
            refresh_expires_at: next.expiry_utc,
            user_id: user.user_id,
            role_id: membership.role_id,
            role_level: resolved.role_level,
            organization_id: Some(org_id),
            permissions: resolved.sorted_permissions(),
        })
    }

    /// Revoke the presented refresh token. Missing, malformed, unknown or
    /// already revoked tokens are all treated as already logged out.
    pub async fn logout(&self, refresh_token: Option<&str>) -> Result<(), ServiceError> {
        let Some(token) = refresh_token else {
            return Ok(());
        };
        let session = match self.presented_session(token).await {
            Ok(session) => session,
            Err(ServiceError::Unauthorized(reason)) => {
                tracing::debug!(reason = %reason, "Logout with unusable refresh token");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.bounded_revoke(session.session_id).await? {
            tracing::info!(user_id = %session.user_id, "User logged out");
        }
        Ok(())
    }

    /// Re-scope the caller's access token to another organization they can
    /// reach. The refresh lineage stays the same.
    pub async fn switch_organization(
        &self,
        ctx: &RequestContext,
        organization_id: Uuid,
    ) -> Result<SwitchedOrganization, ServiceError> {
        let forbidden =
            || ServiceError::Forbidden("Not an active member of this organization".to_string());

        let allowed = match self
            .authz
            .check_user_organization_access(ctx.user_id, organization_id)
            .await
        {
            Ok(allowed) => allowed,
            Err(ServiceError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        if !allowed {
            tracing::debug!(
                user_id = %ctx.user_id,
                organization_id = %organization_id,
                "Organization switch denied"
            );
            return Err(forbidden());
        }

        let membership = self
            .authz
            .effective_membership(ctx.user_id, organization_id)
            .await?
            .ok_or_else(forbidden)?;
        let resolved = self.authz.resolve_permissions(membership.role_id).await?;

        let moved = bounded(
            ctx.budget(self.store_timeout),
            "update session organization",
            self.sessions
                .set_session_organization(ctx.session_id, Some(organization_id)),
        )
        .await?;
        if !moved {
            return Err(ServiceError::Unauthorized(
                "Session is no longer active".to_string(),
            ));
        }

        let access_token = self.jwt.generate_access_token(&AccessGrant {
            user_id: ctx.user_id,
            role_id: membership.role_id,
            role_level: resolved.role_level,
            org_id: Some(organization_id),
            session_id: ctx.session_id,
        })?;

        tracing::info!(
            user_id = %ctx.user_id,
            organization_id = %organization_id,
            "Organization switched"
        );
        Ok(SwitchedOrganization {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.access_token_expiry_seconds(),
            organization_id,
            role_id: membership.role_id,
            permissions: resolved.sorted_permissions(),
        })
    }

    /// Verify an access token's signature, expiry and claim shape.
    pub fn verify_access_token(&self, token: &str) -> Result<VerifiedAccess, ServiceError> {
        let claims = self.jwt.validate_access_token(token).map_err(|e| {
            tracing::debug!(error = %e, "Access token rejected");
            ServiceError::Unauthorized("Invalid or expired token".to_string())
        })?;
        VerifiedAccess::try_from(&claims)
    }

    /// Token state as seen by this service, including session revocation.
    pub async fn introspect(&self, token: &str) -> Result<Introspection, ServiceError> {
        let Ok(claims) = self.jwt.validate_access_token(token) else {
            return Ok(Introspection::default());
        };
        let Ok(access) = VerifiedAccess::try_from(&claims) else {
            return Ok(Introspection::default());
        };

        let session = bounded(
            self.store_timeout,
            "load refresh session",
            self.sessions.find_session(access.session_id),
        )
        .await?;
        // Rotation revokes the session an access token was minted from but
        // keeps its lineage alive; logout or replay detection ends the lineage.
        let live = match session {
            Some(s) if s.is_valid() => true,
            Some(s) => {
                bounded(
                    self.store_timeout,
                    "load session lineage",
                    self.sessions.is_lineage_active(s.lineage_id),
                )
                .await?
            }
            None => false,
        };
        if !live {
            return Ok(Introspection::default());
        }

        Ok(Introspection {
            active: true,
            sub: Some(claims.sub),
            role_id: Some(claims.role_id),
            organization_id: claims.org_id,
            exp: Some(claims.exp),
            iat: Some(claims.iat),
        })
    }

    /// Revoke every refresh session the user holds.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<u64, ServiceError> {
        let revoked = bounded(
            self.store_timeout,
            "revoke user sessions",
            self.sessions.revoke_user_sessions(user_id),
        )
        .await?;
        tracing::info!(user_id = %user_id, revoked, "Revoked all sessions for user");
        Ok(revoked)
    }

    async fn open_session(
        &self,
        user: &User,
        organization_id: Option<Uuid>,
    ) -> Result<IssuedSession, ServiceError> {
        let (membership, org_id) = self.resolve_context(user.user_id, organization_id).await?;
        let resolved = self.authz.resolve_permissions(membership.role_id).await?;

        let mut session = RefreshSession::new(
            user.user_id,
            Some(org_id),
            self.jwt.refresh_token_expiry_days(),
        );
        let refresh_token = self
            .jwt
            .generate_refresh_token(user.user_id, session.session_id)?;
        session.token_hash_text = hash_token(&refresh_token);

        let access_token = self.jwt.generate_access_token(&AccessGrant {
            user_id: user.user_id,
            role_id: membership.role_id,
            role_level: resolved.role_level,
            org_id: Some(org_id),
            session_id: session.session_id,
        })?;

        bounded(
            self.store_timeout,
            "store refresh session",
            self.sessions.insert_session(&session),
        )
        .await?;

        Ok(IssuedSession {
            access_token,
            refresh_token,
            expires_in: self.jwt.access_token_expiry_seconds(),
            refresh_expires_at: session.expiry_utc,
            user_id: user.user_id,
            role_id: membership.role_id,
            role_level: resolved.role_level,
            organization_id: Some(org_id),
            permissions: resolved.sorted_permissions(),
        })
    }

    /// Pick the membership a session acts through: the one governing the
    /// requested organization, else the user's highest-level membership.
    async fn resolve_context(
        &self,
        user_id: Uuid,
        organization_id: Option<Uuid>,
    ) -> Result<(Membership, Uuid), ServiceError> {
        if let Some(org_id) = organization_id {
            let membership = self
                .authz
                .effective_membership(user_id, org_id)
                .await?
                .ok_or_else(|| {
                    ServiceError::Forbidden("Not an active member of this organization".to_string())
                })?;
            return Ok((membership, org_id));
        }

        let memberships = bounded(
            self.store_timeout,
            "load memberships",
            self.directory.active_memberships_for_user(user_id),
        )
        .await?;

        let mut best: Option<(i32, Membership)> = None;
        for membership in memberships {
            let level = self.authz.resolve_permissions(membership.role_id).await?.role_level;
            if best.as_ref().map_or(true, |(top, _)| level > *top) {
                best = Some((level, membership));
            }
        }

        let (_, membership) = best.ok_or_else(|| {
            ServiceError::Forbidden("User has no active organization membership".to_string())
        })?;
        let org_id = membership.org_id;
        Ok((membership, org_id))
    }

    /// Decode a refresh token and load its session, checking the stored hash.
    async fn presented_session(&self, refresh_token: &str) -> Result<RefreshSession, ServiceError> {
        let unauthorized = || ServiceError::Unauthorized("Invalid refresh token".to_string());

        let claims = self
            .jwt
            .validate_refresh_token(refresh_token)
            .map_err(|_| unauthorized())?;
        let session_id = Uuid::parse_str(&claims.jti).map_err(|_| unauthorized())?;

        let session = bounded(
            self.store_timeout,
            "load refresh session",
            self.sessions.find_session(session_id),
        )
        .await?
        .ok_or_else(unauthorized)?;

        if !token_matches(&session.token_hash_text, refresh_token) {
            return Err(unauthorized());
        }
        Ok(session)
    }

    async fn bounded_revoke(&self, session_id: Uuid) -> Result<bool, ServiceError> {
        bounded(
            self.store_timeout,
            "revoke refresh session",
            self.sessions.revoke_session(session_id),
        )
        .await
    }

    async fn bounded_revoke_lineage(&self, lineage_id: Uuid) -> Result<u64, ServiceError> {
        bounded(
            self.store_timeout,
            "revoke session lineage",
            self.sessions.revoke_lineage(lineage_id),
        )
        .await
    }

    async fn active_user_by_email(&self, email: &str) -> Result<Option<User>, ServiceError> {
        Ok(bounded(
            self.store_timeout,
            "load user",
            self.directory.find_user_by_email(email),
        )
        .await?
        .filter(|u| u.active_flag))
    }
}
