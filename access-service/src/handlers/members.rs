use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::{
    context::RequestContext,
    models::{MemberRecord, Membership, MembershipHistoryEntry},
    services::MemberAssignment,
    utils::ValidatedJson,
    AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct MemberListQuery {
    #[serde(default)]
    pub direct_only: bool,
}

#[derive(Debug, Deserialize)]
pub struct AssignMemberRequest {
    pub user_id: Uuid,
    pub role_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
pub struct JoinRequest {
    #[validate(length(min = 1, max = 64))]
    pub org_code: String,
    pub role_id: Uuid,
}

pub async fn list_members(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(org_id): Path<Uuid>,
    Query(query): Query<MemberListQuery>,
) -> Result<Json<Vec<MemberRecord>>, AppError> {
    let members = state
        .roles
        .list_members(&ctx, org_id, query.direct_only)
        .await?;
    Ok(Json(members))
}

pub async fn assign_member(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(org_id): Path<Uuid>,
    Json(req): Json<AssignMemberRequest>,
) -> Result<Json<Membership>, AppError> {
    let membership = state
        .roles
        .assign_member_role(
            &ctx,
            MemberAssignment {
                user_id: req.user_id,
                organization_id: org_id,
                role_id: req.role_id,
            },
        )
        .await?;
    Ok(Json(membership))
}

pub async fn deactivate_membership(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(membership_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.roles.deactivate_membership(&ctx, membership_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn membership_history(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(membership_id): Path<Uuid>,
) -> Result<Json<Vec<MembershipHistoryEntry>>, AppError> {
    Ok(Json(state.roles.membership_history(&ctx, membership_id).await?))
}

pub async fn join_organization(
    State(state): State<AppState>,
    ctx: RequestContext,
    ValidatedJson(req): ValidatedJson<JoinRequest>,
) -> Result<(StatusCode, Json<Membership>), AppError> {
    let membership = state
        .roles
        .join_by_code(&ctx, &req.org_code, req.role_id)
        .await?;
    Ok((StatusCode::CREATED, Json(membership)))
}
