use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;

use crate::{
    context::RequestContext,
    models::RoleResponse,
    services::NewRole,
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct ReplacePermissionsRequest {
    pub permissions: Vec<String>,
}

pub async fn list_roles(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<Json<Vec<RoleResponse>>, AppError> {
    Ok(Json(state.roles.list_roles(&ctx).await?))
}

pub async fn create_role(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<NewRole>,
) -> Result<(StatusCode, Json<RoleResponse>), AppError> {
    let role = state.roles.create_role(&ctx, req).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

pub async fn update_role_permissions(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(role_id): Path<Uuid>,
    Json(req): Json<ReplacePermissionsRequest>,
) -> Result<Json<RoleResponse>, AppError> {
    let role = state
        .roles
        .update_role_permissions(&ctx, role_id, req.permissions)
        .await?;
    Ok(Json(role))
}

pub async fn delete_role(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(role_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.roles.delete_role(&ctx, role_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_permission(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(perm_name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.roles.delete_permission(&ctx, &perm_name).await?;
    Ok(StatusCode::NO_CONTENT)
}
