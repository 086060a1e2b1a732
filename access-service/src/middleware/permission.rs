use axum::{
    extract::{RawPathParams, Request, State},
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    context::RequestContext,
    services::{AuthorizationChecker, ServiceError},
};

/// A route's required permission and the checker that answers for it.
#[derive(Clone)]
pub struct PermissionGuard {
    checker: Arc<dyn AuthorizationChecker>,
    permission: &'static str,
}

impl PermissionGuard {
    pub fn new(checker: Arc<dyn AuthorizationChecker>, permission: &'static str) -> Self {
        Self {
            checker,
            permission,
        }
    }
}

/// Where a permission is checked: inside an organization, through the
/// caller's effective membership there, or against the session role alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Organization(Uuid),
    Role,
}

fn parse_id(value: &str) -> Result<Uuid, ServiceError> {
    Uuid::parse_str(value).map_err(|_| ServiceError::InvalidInput(format!("Invalid id: {}", value)))
}

/// The organization a request acts on: the `org_id` path segment, the
/// organization owning the `membership_id` path segment, otherwise the
/// session's organization.
async fn resolve_scope(
    checker: &dyn AuthorizationChecker,
    params: Option<&RawPathParams>,
    ctx: &RequestContext,
) -> Result<Scope, ServiceError> {
    if let Some(params) = params {
        for (name, value) in params.iter() {
            match name {
                "org_id" => return Ok(Scope::Organization(parse_id(value)?)),
                "membership_id" => {
                    let org_id = checker.membership_organization(parse_id(value)?).await?;
                    return Ok(Scope::Organization(org_id));
                }
                _ => {}
            }
        }
    }
    Ok(ctx.organization_id.map_or(Scope::Role, Scope::Organization))
}

/// Reject the request unless the caller holds the guard's permission in the
/// organization the request acts on.
///
/// Fails closed: a role, membership or organization that cannot be resolved
/// is `403`, a checker that cannot answer is `503`. Neither lets the request
/// through.
pub async fn require_permission(
    State(guard): State<PermissionGuard>,
    params: Option<RawPathParams>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Authentication required")))?;

    let checker = guard.checker.as_ref();
    let outcome = match resolve_scope(checker, params.as_ref(), &ctx).await {
        Ok(Scope::Organization(org_id)) => {
            checker
                .check_permission_in_organization(ctx.user_id, org_id, guard.permission)
                .await
        }
        Ok(Scope::Role) => checker.check_permission(ctx.role_id, guard.permission).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(true) => Ok(next.run(req).await),
        Ok(false) | Err(ServiceError::NotFound(_)) => {
            tracing::debug!(
                user_id = %ctx.user_id,
                role_id = %ctx.role_id,
                permission = guard.permission,
                "Permission denied"
            );
            Err(AppError::Forbidden(anyhow::anyhow!(
                "Missing permission: {}",
                guard.permission
            )))
        }
        Err(e @ ServiceError::InvalidInput(_)) => Err(e.into()),
        Err(e) => {
            tracing::error!(
                error = %e,
                request_id = %ctx.request_id,
                role_id = %ctx.role_id,
                permission = guard.permission,
                "Permission check failed"
            );
            Err(e.into())
        }
    }
}
