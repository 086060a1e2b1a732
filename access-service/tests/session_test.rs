mod common;

use access_service::models::OrganizationType;
use axum::http::StatusCode;
use common::{
    authed, body_json, json_request, refresh_cookie, set_cookie_header, with_cookie, TestApp,
    PASSWORD,
};
use serde_json::json;

async fn company_member(app: &TestApp, email: &str) -> access_service::models::Organization {
    let company = app.org(OrganizationType::Company, "ACME", None).await;
    let role = app
        .role("company_manager", 40, &[OrganizationType::Company], &["members:read"])
        .await;
    let user = app.user(email).await;
    app.member(&user, &company, &role).await;
    company
}

#[tokio::test]
async fn test_login_refresh_logout_flow() {
    let app = TestApp::new();
    company_member(&app, "alice@example.com").await;

    // Login sets a scoped, HttpOnly refresh cookie and returns only the access token.
    let response = app
        .send(json_request(
            "POST",
            "/auth/login",
            json!({"email": "alice@example.com", "password": PASSWORD}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let issued_header = set_cookie_header(&response).unwrap();
    assert!(issued_header.contains("HttpOnly"));
    assert!(issued_header.contains("Path=/auth"));
    assert!(issued_header.contains("SameSite=Lax"));
    let first = refresh_cookie(&response).unwrap();
    let body = body_json(response).await;
    assert!(body["access_token"].is_string());
    assert_eq!(body["token_type"], "Bearer");
    assert!(body.get("refresh_token").is_none());

    // Refresh rotates the cookie.
    let response = app.send(with_cookie("POST", "/auth/refresh", Some(&first))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let second = refresh_cookie(&response).unwrap();
    assert_ne!(first, second);

    // Logout clears the cookie.
    let response = app.send(with_cookie("POST", "/auth/logout", Some(&second))).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let cleared = set_cookie_header(&response).unwrap();
    assert!(cleared.starts_with("refresh_token=;"));
    assert!(cleared.contains("Max-Age=0"));

    // Neither the rotated-out nor the logged-out token refreshes any more.
    for spent in [&first, &second] {
        let response = app.send(with_cookie("POST", "/auth/refresh", Some(spent))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(refresh_cookie(&response).is_none());
        assert!(set_cookie_header(&response).is_some());
    }
}

#[tokio::test]
async fn test_refresh_token_is_single_use() {
    let app = TestApp::new();
    company_member(&app, "bob@example.com").await;
    let (_, original) = app.login("bob@example.com", None).await;

    let response = app.send(with_cookie("POST", "/auth/refresh", Some(&original))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let successor = refresh_cookie(&response).unwrap();

    // Replaying the spent token fails and takes the whole lineage down with it.
    let replay = app.send(with_cookie("POST", "/auth/refresh", Some(&original))).await;
    assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);

    let response = app.send(with_cookie("POST", "/auth/refresh", Some(&successor))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_credentials_are_indistinguishable() {
    let app = TestApp::new();
    company_member(&app, "carol@example.com").await;

    let wrong_password = app
        .send(json_request(
            "POST",
            "/auth/login",
            json!({"email": "carol@example.com", "password": "not it"}),
        ))
        .await;
    let unknown_email = app
        .send(json_request(
            "POST",
            "/auth/login",
            json!({"email": "nobody@example.com", "password": PASSWORD}),
        ))
        .await;

    assert_eq!(wrong_password.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(unknown_email.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(wrong_password).await, body_json(unknown_email).await);
}

#[tokio::test]
async fn test_logout_without_cookie_succeeds() {
    let app = TestApp::new();

    let response = app.send(with_cookie("POST", "/auth/logout", None)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .send(with_cookie("POST", "/auth/logout", Some("not-a-token")))
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_refresh_with_garbage_clears_cookie() {
    let app = TestApp::new();

    let response = app
        .send(with_cookie("POST", "/auth/refresh", Some("garbage")))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let cleared = set_cookie_header(&response).unwrap();
    assert!(cleared.contains("Max-Age=0"));

    let response = app.send(with_cookie("POST", "/auth/refresh", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_switch_to_foreign_organization_is_forbidden() {
    let app = TestApp::new();
    company_member(&app, "dave@example.com").await;
    let other = app.org(OrganizationType::Company, "OTHER", None).await;
    let (token, _) = app.login("dave@example.com", None).await;

    let response = app
        .send(authed(
            "POST",
            "/auth/switch-organization",
            &token,
            Some(json!({"organization_id": other.org_id})),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert!(body.get("access_token").is_none());

    // Unknown organizations look the same as foreign ones.
    let response = app
        .send(authed(
            "POST",
            "/auth/switch-organization",
            &token,
            Some(json!({"organization_id": uuid::Uuid::new_v4()})),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_switch_organization_reissues_access_token() {
    let app = TestApp::new();
    let first = company_member(&app, "erin@example.com").await;
    let second = app.org(OrganizationType::Company, "SECOND", None).await;
    let user = app.store_user("erin@example.com").await;
    let role = app
        .role("company_viewer", 30, &[OrganizationType::Company], &["roles:read"])
        .await;
    app.member(&user, &second, &role).await;

    let (token, cookie) = app.login("erin@example.com", Some(&first)).await;
    let response = app
        .send(authed(
            "POST",
            "/auth/switch-organization",
            &token,
            Some(json!({"organization_id": second.org_id})),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(refresh_cookie(&response).is_none());
    let body = body_json(response).await;
    assert_eq!(body["organization_id"], json!(second.org_id));
    assert_eq!(body["role_id"], json!(role.role_id));
    let switched = body["access_token"].as_str().unwrap().to_string();

    let me = app.send(authed("GET", "/auth/me", &switched, None)).await;
    assert_eq!(me.status(), StatusCode::OK);
    let me = body_json(me).await;
    assert_eq!(me["organization_id"], json!(second.org_id));
    assert_eq!(me["permissions"], json!(["roles:read"]));

    // The lineage keeps the switched organization across refreshes.
    let response = app.send(with_cookie("POST", "/auth/refresh", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["organization_id"], json!(second.org_id));
}

#[tokio::test]
async fn test_introspection() {
    let app = TestApp::new();
    company_member(&app, "frank@example.com").await;
    let (token, cookie) = app.login("frank@example.com", None).await;

    let response = app
        .send(json_request("POST", "/auth/introspect", json!({"token": token})))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["active"], true);
    assert!(body["sub"].is_string());

    let response = app.send(with_cookie("POST", "/auth/logout", Some(&cookie))).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .send(json_request("POST", "/auth/introspect", json!({"token": token})))
        .await;
    let body = body_json(response).await;
    assert_eq!(body["active"], false);

    let response = app
        .send(json_request("POST", "/auth/introspect", json!({"token": "junk"})))
        .await;
    let body = body_json(response).await;
    assert_eq!(body, json!({"active": false}));
}

#[tokio::test]
async fn test_protected_routes_require_bearer_token() {
    let app = TestApp::new();

    let response = app
        .send(with_cookie("GET", "/auth/me", None))
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.send(authed("GET", "/auth/me", "not.a.jwt", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_external_identity_exchange() {
    let app = TestApp::new();
    let company = company_member(&app, "grace@example.com").await;

    let issued = app
        .state
        .tokens
        .issue_for_identity("Grace@Example.com", None)
        .await
        .unwrap();
    assert_eq!(issued.organization_id, Some(company.org_id));
    assert_eq!(issued.permissions, vec!["members:read".to_string()]);

    let response = app
        .send(authed("GET", "/auth/me", &issued.access_token, None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let err = app
        .state
        .tokens
        .issue_for_identity("stranger@example.com", None)
        .await
        .unwrap_err();
    assert!(matches!(err, access_service::services::ServiceError::Unauthorized(_)));
}

#[tokio::test]
async fn test_revoke_all_ends_every_lineage() {
    let app = TestApp::new();
    company_member(&app, "heidi@example.com").await;
    let (_, laptop) = app.login("heidi@example.com", None).await;
    let (_, phone) = app.login("heidi@example.com", None).await;
    let user = app.store_user("heidi@example.com").await;

    let revoked = app.state.tokens.revoke_all(user.user_id).await.unwrap();
    assert_eq!(revoked, 2);

    for cookie in [&laptop, &phone] {
        let response = app.send(with_cookie("POST", "/auth/refresh", Some(cookie))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
