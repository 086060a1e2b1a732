mod common;

use access_service::models::OrganizationType;
use axum::http::StatusCode;
use common::{authed, body_json, TestApp};
use serde_json::json;

#[tokio::test]
async fn test_route_requires_named_permission() {
    let app = TestApp::new();
    let store = app.org(OrganizationType::Store, "STORE-1", None).await;
    let clerk = app
        .role("clerk", 10, &[OrganizationType::Store], &["orders:read"])
        .await;
    let user = app.user("clerk@example.com").await;
    app.member(&user, &store, &clerk).await;

    let (token, _) = app.login("clerk@example.com", None).await;
    let response = app.send(authed("GET", "/api/roles", &token, None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.send(authed("GET", "/api/roles", "bogus", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_super_admin_bypasses_permission_sets() {
    let app = TestApp::new();
    let platform = app.org(OrganizationType::Platform, "PLATFORM", None).await;
    let root = app
        .role("super_admin", 100, &[OrganizationType::Platform], &[])
        .await;
    let user = app.user("root@example.com").await;
    app.member(&user, &platform, &root).await;

    let (token, _) = app.login("root@example.com", None).await;
    let response = app.send(authed("GET", "/api/roles", &token, None)).await;
    assert_eq!(response.status(), StatusCode::OK);

    assert!(app
        .state
        .authz
        .check_permission(root.role_id, "anything:at-all")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_permission_change_is_visible_on_next_request() {
    let app = TestApp::new();
    let holding = app.org(OrganizationType::Holding, "HOLD", None).await;
    let company = app
        .org(OrganizationType::Company, "COMP", Some(&holding))
        .await;

    let admin_role = app
        .role(
            "holding_admin",
            60,
            &[OrganizationType::Holding],
            &["roles:read", "roles:write", "members:read"],
        )
        .await;
    let manager_role = app
        .role(
            "company_manager",
            40,
            &[OrganizationType::Company],
            &["members:read", "orders:read"],
        )
        .await;

    let admin = app.user("admin@example.com").await;
    app.member(&admin, &holding, &admin_role).await;
    let manager = app.user("manager@example.com").await;
    app.member(&manager, &company, &manager_role).await;

    let (admin_token, _) = app.login("admin@example.com", None).await;
    let (manager_token, _) = app.login("manager@example.com", None).await;

    let members_uri = format!("/api/organizations/{}/members", company.org_id);
    let response = app
        .send(authed("GET", &members_uri, &manager_token, None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // The manager's permission set is now cached; replace it.
    let response = app
        .send(authed(
            "PUT",
            &format!("/api/roles/{}/permissions", manager_role.role_id),
            &admin_token,
            Some(json!({"permissions": ["orders:read"]})),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["permissions"], json!(["orders:read"]));

    let response = app
        .send(authed("GET", &members_uri, &manager_token, None))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_cache_hit_matches_fresh_resolution() {
    let app = TestApp::new();
    let role = app
        .role(
            "store_clerk",
            10,
            &[OrganizationType::Store],
            &["orders:read", "orders:write"],
        )
        .await;

    let fresh = app.state.authz.resolve_permissions(role.role_id).await.unwrap();
    let cached = app.state.authz.resolve_permissions(role.role_id).await.unwrap();
    assert_eq!(fresh.sorted_permissions(), cached.sorted_permissions());

    for perm in ["orders:read", "orders:write", "orders:delete"] {
        let expected = fresh.grants(perm);
        assert_eq!(
            app.state.authz.check_permission(role.role_id, perm).await.unwrap(),
            expected
        );
    }
}

#[tokio::test]
async fn test_unknown_role_fails_closed() {
    let app = TestApp::new();
    let result = app
        .state
        .authz
        .check_permission(uuid::Uuid::new_v4(), "roles:read")
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_organization_access_cascades_from_holding() {
    let app = TestApp::new();
    let holding = app.org(OrganizationType::Holding, "H1", None).await;
    let company = app.org(OrganizationType::Company, "C1", Some(&holding)).await;
    let store = app.org(OrganizationType::Store, "S1", Some(&company)).await;
    let sibling = app.org(OrganizationType::Company, "C2", None).await;

    let holding_role = app
        .role("holding_ops", 55, &[OrganizationType::Holding], &[])
        .await;
    let company_role = app
        .role("company_ops", 30, &[OrganizationType::Company], &[])
        .await;

    let h_user = app.user("h@example.com").await;
    app.member(&h_user, &holding, &holding_role).await;
    let c_user = app.user("c@example.com").await;
    app.member(&c_user, &company, &company_role).await;

    let authz = &app.state.authz;
    assert!(authz
        .check_user_organization_access(h_user.user_id, store.org_id)
        .await
        .unwrap());
    assert!(!authz
        .check_user_organization_access(h_user.user_id, sibling.org_id)
        .await
        .unwrap());
    // Company scope does not reach down the tree.
    assert!(!authz
        .check_user_organization_access(c_user.user_id, store.org_id)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_member_routes_check_the_target_organization() {
    let app = TestApp::new();
    let company = app.org(OrganizationType::Company, "COA", None).await;
    let other = app.org(OrganizationType::Company, "COB", None).await;
    let store = app.org(OrganizationType::Store, "STB", Some(&other)).await;

    let admin_role = app
        .role(
            "company_admin",
            40,
            &[OrganizationType::Company],
            &["members:read", "members:write"],
        )
        .await;
    let clerk_role = app
        .role("store_clerk", 5, &[OrganizationType::Store], &["orders:read"])
        .await;
    let manager_role = app
        .role("store_manager", 20, &[OrganizationType::Store], &["orders:read"])
        .await;

    let actor = app.user("actor@example.com").await;
    app.member(&actor, &company, &admin_role).await;
    app.member(&actor, &store, &clerk_role).await;
    let victim = app.user("victim@example.com").await;
    let victim_membership = app.member(&victim, &store, &clerk_role).await;

    // The session is scoped to the organization where the actor is an admin.
    let (token, _) = app.login("actor@example.com", Some(&company)).await;

    let response = app
        .send(authed(
            "GET",
            &format!("/api/organizations/{}/members", company.org_id),
            &token,
            None,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let store_members = format!("/api/organizations/{}/members", store.org_id);
    let response = app.send(authed("GET", &store_members, &token, None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .send(authed(
            "POST",
            &store_members,
            &token,
            Some(json!({"user_id": victim.user_id, "role_id": manager_role.role_id})),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let membership_uri = format!("/api/memberships/{}", victim_membership.membership_id);
    let response = app.send(authed("DELETE", &membership_uri, &token, None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let response = app
        .send(authed("GET", &format!("{}/history", membership_uri), &token, None))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let unknown = format!("/api/memberships/{}", uuid::Uuid::new_v4());
    let response = app.send(authed("DELETE", &unknown, &token, None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .send(authed("GET", "/api/organizations/not-an-id/members", &token, None))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Nothing changed in the store.
    let still = app
        .state
        .authz
        .effective_membership(victim.user_id, store.org_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still.role_id, clerk_role.role_id);
}
