//! Integration tests for the REST client against a mock backend.

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::json;
use timer_rooms_client::{
    config::AuthSettings,
    dao::token_store::{MemoryTokenStore, TokenStore},
    dto::auth::{LoginForm, RegisterForm},
    error::{ApiError, FormError},
    services::api_client::ApiClient,
    state::{AuthStatus, SessionManager, SessionSignal, SharedSession},
};
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn jwt(claims: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.signature")
}

fn setup(server: &MockServer) -> (ApiClient, SharedSession, MemoryTokenStore) {
    let store = MemoryTokenStore::new();
    let session = SessionManager::new(Arc::new(store.clone()));
    let client = ApiClient::new(server.uri(), session.clone(), &AuthSettings::default()).unwrap();
    (client, session, store)
}

#[tokio::test]
async fn login_posts_form_and_installs_token() {
    let server = MockServer::start().await;
    let token = jwt(json!({ "sub": "7", "exp": 4_102_444_800i64 }));

    Mock::given(method("POST"))
        .and(path("/api/v1/login"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("username=ada%40example.com"))
        .and(body_string_contains("password=hunter22"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": token, "token_type": "bearer" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/user/me/"))
        .and(header("authorization", format!("Bearer {token}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 7,
            "email": "ada@example.com",
            "full_name": "Ada"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, session, store) = setup(&server);
    let profile = client
        .login(&LoginForm {
            email: "ada@example.com".into(),
            password: "hunter22".into(),
        })
        .await
        .unwrap();

    assert_eq!(profile.id, "7");
    assert_eq!(session.auth().status, AuthStatus::Authenticated);
    assert_eq!(session.auth().user.as_deref(), Some("7"));
    assert_eq!(store.load().await.unwrap(), Some(token));
}

#[tokio::test]
async fn invalid_login_form_is_rejected_locally() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/login"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (client, _session, _store) = setup(&server);
    let err = client
        .login(&LoginForm {
            email: "not-an-email".into(),
            password: String::new(),
        })
        .await
        .unwrap_err();

    let FormError::Fields(fields) = err else {
        panic!("expected field errors, got {err:?}");
    };
    assert!(fields.contains_key("email"));
    assert!(fields.contains_key("password"));
}

#[tokio::test]
async fn login_failure_detail_becomes_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/login"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({ "detail": "Incorrect email or password" })),
        )
        .mount(&server)
        .await;

    let (client, session, _store) = setup(&server);
    let err = client
        .login(&LoginForm {
            email: "ada@example.com".into(),
            password: "wrong-password1".into(),
        })
        .await
        .unwrap_err();

    assert_eq!(err, FormError::Message("Incorrect email or password".into()));
    assert!(session.token().await.is_none());
}

#[tokio::test]
async fn register_maps_backend_validation_to_fields() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/user"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "detail": [
                { "loc": ["body", "email"], "msg": "Email already registered", "type": "value_error" }
            ]
        })))
        .mount(&server)
        .await;

    let (client, _session, _store) = setup(&server);
    let err = client
        .register(&RegisterForm {
            email: "ada@example.com".into(),
            password: "hunter22".into(),
            full_name: "Ada Lovelace".into(),
        })
        .await
        .unwrap_err();

    let FormError::Fields(fields) = err else {
        panic!("expected field errors, got {err:?}");
    };
    assert_eq!(fields["email"], vec!["Email already registered".to_string()]);
}

#[tokio::test]
async fn persistent_unauthorized_raises_auth_required() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/user/me/"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "detail": "expired" })))
        .expect(3)
        .mount(&server)
        .await;

    let (client, session, _store) = setup(&server);
    session
        .install_token(jwt(json!({ "sub": "7", "exp": 4_102_444_800i64 })))
        .await
        .unwrap();
    let mut signals = session.signals().subscribe();

    let err = client.me().await.unwrap_err();

    assert!(matches!(err, ApiError::Unauthorized { .. }));
    assert_eq!(signals.recv().await.unwrap(), SessionSignal::AuthRequired);
}

#[tokio::test]
async fn subscription_status_forwards_session_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/subscriptions/status"))
        .and(query_param("session_id", "cs_test_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "active",
            "subscription_id": "sub_1",
            "plan": "team"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _session, _store) = setup(&server);
    let status = client.subscription_status(Some("cs_test_1")).await.unwrap();

    assert!(status.is_active());
    assert_eq!(status.plan.as_deref(), Some("team"));
}

#[tokio::test]
async fn logout_clears_session_even_when_backend_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/logout"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let (client, session, store) = setup(&server);
    session
        .install_token(jwt(json!({ "sub": "7", "exp": 4_102_444_800i64 })))
        .await
        .unwrap();
    session.set_authenticated("7");

    assert!(client.logout().await.is_err());
    assert!(session.token().await.is_none());
    assert!(store.load().await.unwrap().is_none());
    assert_eq!(session.auth().status, AuthStatus::Unauthenticated);
}
