//! End-to-end routing engine tests against a real upstream server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use gitpipe::ingress::{
    ByDomain, ByPath, JwtVerifier, RequestResolver, RouteRecord, Router, UpstreamProxy,
};

#[derive(Clone)]
struct UpstreamState {
    hits: Arc<AtomicUsize>,
}

async fn echo(State(state): State<UpstreamState>, request: Request<Body>) -> String {
    state.hits.fetch_add(1, Ordering::SeqCst);
    format!("{} {}", request.method(), request.uri().path())
}

/// Starts a real HTTP upstream on an ephemeral port.
async fn spawn_upstream() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = axum::Router::new()
        .fallback(echo)
        .with_state(UpstreamState {
            hits: Arc::clone(&hits),
        });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (address, hits)
}

fn router_app(
    resolver: Box<dyn RequestResolver>,
    auth: Option<JwtVerifier>,
    index: bool,
    records: Vec<RouteRecord>,
) -> axum::Router {
    let router = Router::new(
        CancellationToken::new(),
        resolver,
        auth,
        UpstreamProxy::new(None),
        index,
    );
    router.set(records);
    router.into_service()
}

fn record(domain: &str, address: &str, group: &str) -> RouteRecord {
    RouteRecord {
        domain: domain.to_string(),
        addresses: vec![address.to_string()],
        group: group.to_string(),
    }
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_domain_routing_reaches_upstream() {
    let (address, _) = spawn_upstream().await;
    let app = router_app(
        Box::new(ByDomain::new("")),
        None,
        true,
        vec![record("my-app.localhost", &address, "my-app")],
    );

    let request = Request::builder()
        .uri("/hello")
        .header(header::HOST, "my-app.localhost:8080")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "GET /hello");
}

#[tokio::test]
async fn test_path_routing_trims_first_segment() {
    let (address, _) = spawn_upstream().await;
    let app = router_app(
        Box::new(ByPath),
        None,
        true,
        vec![record("app.example.com", &address, "my-app")],
    );

    let request = Request::builder()
        .uri("/app.example.com/some/path")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "GET /some/path");
}

#[derive(Serialize)]
struct TokenClaims {
    aud: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    methods: Option<Vec<String>>,
}

fn sign(secret: &str, claims: &TokenClaims) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_missing_token_is_unauthorized() {
    let (address, hits) = spawn_upstream().await;
    let app = router_app(
        Box::new(ByDomain::new("")),
        Some(JwtVerifier::new("changeme")),
        true,
        vec![record("my-app.localhost", &address, "my-app")],
    );

    let request = Request::builder()
        .uri("/x")
        .header(header::HOST, "my-app.localhost")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_method_restriction_is_forbidden_without_upstream_contact() {
    let (address, hits) = spawn_upstream().await;
    let app = router_app(
        Box::new(ByDomain::new("")),
        Some(JwtVerifier::new("changeme")),
        true,
        vec![record("my-app.localhost", &address, "my-app")],
    );

    let token = sign(
        "changeme",
        &TokenClaims {
            aud: "client1".to_string(),
            sub: None,
            methods: Some(vec!["POST".to_string()]),
        },
    );
    let request = Request::builder()
        .uri("/x")
        .header(header::HOST, "my-app.localhost")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_valid_token_passes_and_sets_user_header() {
    let (address, hits) = spawn_upstream().await;
    let app = router_app(
        Box::new(ByDomain::new("")),
        Some(JwtVerifier::new("changeme")),
        true,
        vec![record("my-app.localhost", &address, "my-app")],
    );

    let token = sign(
        "changeme",
        &TokenClaims {
            aud: "client1".to_string(),
            sub: Some("my-app".to_string()),
            methods: Some(vec!["GET".to_string()]),
        },
    );
    let request = Request::builder()
        .uri("/x?token=".to_string() + &token)
        .header(header::HOST, "my-app.localhost")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_domain_renders_index() {
    let (address, _) = spawn_upstream().await;
    let app = router_app(
        Box::new(ByDomain::new("")),
        None,
        true,
        vec![record("my-app.localhost", &address, "my-app")],
    );

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "other.localhost")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/html"));
    let body = body_text(response).await;
    assert!(body.contains("my-app"));
}

#[tokio::test]
async fn test_unknown_domain_plain_404_without_index() {
    let app = router_app(Box::new(ByDomain::new("")), None, false, Vec::new());

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "other.localhost")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_correlation_id_is_echoed() {
    let (address, _) = spawn_upstream().await;
    let app = router_app(
        Box::new(ByDomain::new("")),
        None,
        true,
        vec![record("my-app.localhost", &address, "my-app")],
    );

    let request = Request::builder()
        .uri("/x")
        .header(header::HOST, "my-app.localhost")
        .header("x-correlation-id", "trace-42")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get("x-correlation-id").unwrap(),
        "trace-42"
    );
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_empty_record_is_bad_gateway() {
    let app = router_app(
        Box::new(ByDomain::new("")),
        None,
        true,
        vec![RouteRecord {
            domain: "my-app.localhost".to_string(),
            addresses: Vec::new(),
            group: "my-app".to_string(),
        }],
    );

    let request = Request::builder()
        .uri("/")
        .header(header::HOST, "my-app.localhost")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}
