//! HTTP API
//!
//! Routes:
//!
//! | Method | Path               | Auth   |
//! |--------|--------------------|--------|
//! | POST   | `/api/login`       | public |
//! | POST   | `/api/logout`      | public |
//! | GET    | `/api/health`      | public |
//! | GET    | `/api/pool_status` | bearer |
//! | POST   | `/api/reconnect`   | bearer |
//!
//! Login runs the lockout check before touching the database, so a locked
//! key costs no query.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::AuthConfig;
use crate::credentials::CredentialVerifier;
use crate::database::{DatabaseManager, PoolStatus};
use crate::error::AppError;
use crate::login::{LoginKey, LoginTracker};
use crate::observability::SecurityEvent;
use crate::session::{Claims, TokenIssuer};

const BODY_LIMIT: usize = 64 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseManager>,
    pub verifier: Arc<CredentialVerifier>,
    pub tracker: LoginTracker,
    pub tokens: Arc<TokenIssuer>,
    /// Honor forwarded-for headers when keying lockouts
    pub trust_proxy: bool,
}

impl AppState {
    pub fn new(db: Arc<DatabaseManager>, auth: &AuthConfig) -> Self {
        Self {
            verifier: Arc::new(CredentialVerifier::new(Arc::clone(&db), auth)),
            tracker: LoginTracker::new(auth.lockout.clone()),
            tokens: Arc::new(TokenIssuer::from_config(auth)),
            trust_proxy: auth.trust_proxy,
            db,
        }
    }
}

/// Build the API router.
pub fn router(state: AppState, enable_tracing: bool) -> Router {
    let protected = Router::new()
        .route("/api/pool_status", get(pool_status))
        .route("/api/reconnect", post(reconnect))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    let router = Router::new()
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/health", get(health))
        .merge(protected)
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT));

    if enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

// =============================================================================
// Client address
// =============================================================================

/// Client address used in lockout keys.
///
/// The socket address of the connection, when the server was started with
/// connect info. With [`AppState::trust_proxy`] set, `X-Forwarded-For`
/// (first hop), `X-Real-IP` and `CF-Connecting-IP` are consulted first.
/// Falls back to `"unknown"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddr(pub String);

impl FromRequestParts<AppState> for ClientAddr {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(Self(client_addr(parts, state.trust_proxy)))
    }
}

fn client_addr(parts: &Parts, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(addr) = forwarded_addr(&parts.headers) {
            return addr;
        }
    }

    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Client address as reported by a reverse proxy. Any client can set these
/// headers, so they are only meaningful behind a proxy that overwrites them.
fn forwarded_addr(headers: &HeaderMap) -> Option<String> {
    let header = move |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    header("x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|first| !first.is_empty())
        .or_else(|| header("x-real-ip"))
        .or_else(|| header("cf-connecting-ip"))
        .map(str::to_string)
}

// =============================================================================
// Login / logout
// =============================================================================

#[derive(Deserialize)]
pub struct LoginRequest {
    pub usuario: String,
    pub senha: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub message: String,
    pub token: String,
    pub name: String,
    pub role: String,
}

async fn login(
    State(state): State<AppState>,
    ClientAddr(client): ClientAddr,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, AppError> {
    let Json(input) = payload
        .map_err(|e| AppError::bad_request("Invalid request body").with_details(e.body_text()))?;

    let key = LoginKey::new(&input.usuario, &client);
    if let Some(lockout) = state.tracker.check_lockout(&key) {
        warn!(
            username = %input.usuario,
            client = %client,
            remaining_secs = lockout.remaining_secs(),
            "Login attempt while locked out"
        );
        return Err(AppError::locked_out(lockout.remaining_secs()));
    }

    let verified = state
        .verifier
        .verify_credentials(&input.usuario, &input.senha)
        .await?;

    let Some(identity) = verified else {
        state.tracker.record_failure(&key);
        return Err(AppError::unauthorized("Invalid username or password."));
    };

    state.tracker.record_success(&key);
    let token = state
        .tokens
        .issue(&input.usuario, &identity)
        .map_err(|e| AppError::internal("Could not create session", e))?;

    crate::security_event!(
        SecurityEvent::SessionCreated,
        username = %input.usuario,
        client = %client,
        "Session token issued"
    );

    Ok(Json(LoginResponse {
        message: "Login successful".to_string(),
        token,
        name: identity.name,
        role: identity.role,
    }))
}

/// Tokens are discarded client-side; a valid token is only used to attribute
/// the event.
async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Json<serde_json::Value> {
    let claims = bearer_token(&headers).and_then(|token| state.tokens.validate(token).ok());
    if let Some(claims) = claims {
        crate::security_event!(SecurityEvent::Logout, username = %claims.sub, "User logged out");
    }
    Json(json!({ "message": "Logged out" }))
}

// =============================================================================
// Health and pool maintenance
// =============================================================================

async fn health(State(state): State<AppState>) -> Response {
    match state.db.try_execute("SELECT 1", &[]).await {
        Ok(_) => Json(json!({ "status": "ok", "database": "connected" })).into_response(),
        Err(e) => {
            warn!(error = %e, "Health endpoint could not reach the database");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "error",
                    "database": "disconnected",
                    "error": e.to_string(),
                })),
            )
                .into_response()
        }
    }
}

async fn pool_status(State(state): State<AppState>) -> Json<PoolStatus> {
    Json(state.db.status().await)
}

async fn reconnect(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<PoolStatus>, AppError> {
    info!(requested_by = %claims.sub, "Manual database reconnect");
    state.db.reconnect().await?;
    Ok(Json(state.db.status().await))
}

// =============================================================================
// Bearer authentication
// =============================================================================

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Middleware that requires a valid session token
async fn require_token(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let Some(token) = bearer_token(request.headers()) else {
        crate::security_event!(
            SecurityEvent::AccessDenied,
            path = %request.uri().path(),
            reason = "missing_token",
            "Request without bearer token"
        );
        return Err(AppError::unauthorized("Authorization header required"));
    };

    let claims = match state.tokens.validate(token) {
        Ok(claims) => claims,
        Err(e) => {
            crate::security_event!(
                SecurityEvent::AccessDenied,
                path = %request.uri().path(),
                reason = %e,
                "Rejected bearer token"
            );
            return Err(AppError::unauthorized("Invalid or expired token"));
        }
    };

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::crypto::sha256_hex;
    use crate::testing::MemoryDatabase;
    use axum::body::Body;
    use axum::http::header::RETRY_AFTER;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(db: &MemoryDatabase) -> Router {
        app_with_proxy(db, false)
    }

    fn app_with_proxy(db: &MemoryDatabase, trust_proxy: bool) -> Router {
        let config = DatabaseConfig::builder()
            .pool_size(1, 4)
            .retry(1, Duration::from_millis(10))
            .build();
        let manager = Arc::new(DatabaseManager::new(config, Arc::new(db.clone())).unwrap());
        let auth = AuthConfig {
            token_secret: "api-test-secret".into(),
            trust_proxy,
            ..AuthConfig::default()
        };
        router(AppState::new(manager, &auth), false)
    }

    fn users() -> MemoryDatabase {
        MemoryDatabase::new().with_user("ana", "Ana Souza", "tecnico", &sha256_hex("s3nh@"))
    }

    fn socket(client: &str) -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::new(client.parse().unwrap(), 40_000))
    }

    fn login_request(user: &str, secret: &str, client: &str) -> Request<Body> {
        Request::post("/api/login")
            .header("content-type", "application/json")
            .extension(socket(client))
            .body(Body::from(json!({ "usuario": user, "senha": secret }).to_string()))
            .unwrap()
    }

    fn forwarded_login_request(user: &str, secret: &str, forwarded_for: &str) -> Request<Body> {
        let mut request = login_request(user, secret, "192.0.2.50");
        request
            .headers_mut()
            .insert("x-forwarded-for", forwarded_for.parse().unwrap());
        request
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn token_for(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(login_request("ana", "s3nh@", "10.0.0.1"))
            .await
            .unwrap();
        let body: LoginResponse = serde_json::from_value(body_json(response).await).unwrap();
        body.token
    }

    #[tokio::test]
    async fn test_login_success_returns_token() {
        let app = app(&users());
        let response = app
            .oneshot(login_request("ana", "s3nh@", "10.0.0.1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["name"], "Ana Souza");
        assert_eq!(body["role"], "tecnico");
        assert!(body["token"].as_str().is_some_and(|t| !t.is_empty()));
    }

    #[tokio::test]
    async fn test_login_failure_is_generic() {
        let app = app(&users());

        let wrong = app
            .clone()
            .oneshot(login_request("ana", "nope", "10.0.0.1"))
            .await
            .unwrap();
        let unknown = app
            .oneshot(login_request("ghost", "s3nh@", "10.0.0.1"))
            .await
            .unwrap();

        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(wrong).await, body_json(unknown).await);
    }

    #[tokio::test]
    async fn test_lockout_after_three_failures() {
        let app = app(&users());

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(login_request("ana", "nope", "10.0.0.7"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        // Even the right secret is refused while locked
        let locked = app
            .clone()
            .oneshot(login_request("ana", "s3nh@", "10.0.0.7"))
            .await
            .unwrap();
        assert_eq!(locked.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = locked.headers()[RETRY_AFTER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after > 0 && retry_after <= 300);
        let body = body_json(locked).await;
        assert_eq!(body["error"], "too_many_attempts");

        // Another origin is not penalized
        let elsewhere = app
            .oneshot(login_request("ana", "s3nh@", "10.0.0.8"))
            .await
            .unwrap();
        assert_eq!(elsewhere.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockout_expires_after_window() {
        let app = app(&users());

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(login_request("ana", "nope", "10.0.0.9"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        tokio::time::advance(Duration::from_secs(299)).await;
        let still_locked = app
            .clone()
            .oneshot(login_request("ana", "s3nh@", "10.0.0.9"))
            .await
            .unwrap();
        assert_eq!(still_locked.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(still_locked.headers()[RETRY_AFTER], "1");

        tokio::time::advance(Duration::from_secs(1)).await;
        let response = app
            .oneshot(login_request("ana", "s3nh@", "10.0.0.9"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_with_database_down_is_unavailable() {
        let db = users();
        db.set_reachable(false);
        let response = app(&db)
            .oneshot(login_request("ana", "s3nh@", "10.0.0.1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"], "service_unavailable");
    }

    #[tokio::test]
    async fn test_login_rejects_malformed_body() {
        let request = Request::post("/api/login")
            .header("content-type", "application/json")
            .body(Body::from("{\"usuario\": 1"))
            .unwrap();
        let response = app(&users()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_connected() {
        let response = app(&users())
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({ "status": "ok", "database": "connected" })
        );
    }

    #[tokio::test]
    async fn test_health_reports_disconnected() {
        let response = app(&MemoryDatabase::unreachable())
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["database"], "disconnected");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_pool_status_requires_token() {
        let response = app(&users())
            .oneshot(Request::get("/api/pool_status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_pool_status_with_token() {
        let app = app(&users());
        let token = token_for(&app).await;

        let response = app
            .oneshot(
                Request::get("/api/pool_status")
                    .header(AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "active");
        assert_eq!(body["max_size"], 4);
        assert_eq!(body["closed"], false);
    }

    #[tokio::test]
    async fn test_reconnect_with_forged_token_is_rejected() {
        let response = app(&users())
            .oneshot(
                Request::post("/api/reconnect")
                    .header(AUTHORIZATION, "Bearer not.a.token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_reconnect_rebuilds_pool() {
        let db = users();
        let app = app(&db);
        let token = token_for(&app).await;
        let before = db.sessions_opened();

        let response = app
            .oneshot(
                Request::post("/api/reconnect")
                    .header(AUTHORIZATION, format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(db.sessions_opened() > before);
        assert_eq!(body_json(response).await["status"], "active");
    }

    #[tokio::test]
    async fn test_logout_acknowledges() {
        let response = app(&users())
            .oneshot(Request::post("/api/logout").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_forwarded_header_does_not_reset_lockout() {
        let app = app(&users());

        for attempt in 0..3 {
            let response = app
                .clone()
                .oneshot(forwarded_login_request("ana", "nope", &format!("198.51.100.{}", attempt)))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let fourth = app
            .oneshot(forwarded_login_request("ana", "nope", "198.51.100.99"))
            .await
            .unwrap();
        assert_eq!(fourth.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_trusted_proxy_keys_on_forwarded_address() {
        let app = app_with_proxy(&users(), true);

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(forwarded_login_request("ana", "nope", "198.51.100.1"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        // Same proxy socket, different end client
        let other = app
            .oneshot(forwarded_login_request("ana", "s3nh@", "198.51.100.2"))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[test]
    fn test_client_addr_ignores_headers_by_default() {
        let (mut parts, _) = Request::get("/")
            .header("x-forwarded-for", "203.0.113.9")
            .header("x-real-ip", "198.51.100.2")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(client_addr(&parts, false), "unknown");

        parts.extensions.insert(socket("192.0.2.4"));
        assert_eq!(client_addr(&parts, false), "192.0.2.4");
    }

    #[test]
    fn test_client_addr_precedence_behind_proxy() {
        let (mut parts, _) = Request::get("/")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .header("x-real-ip", "198.51.100.2")
            .body(())
            .unwrap()
            .into_parts();
        parts.extensions.insert(socket("192.0.2.4"));
        assert_eq!(client_addr(&parts, true), "203.0.113.9");

        parts.headers.remove("x-forwarded-for");
        assert_eq!(client_addr(&parts, true), "198.51.100.2");

        parts.headers.remove("x-real-ip");
        assert_eq!(client_addr(&parts, true), "192.0.2.4");
    }
}
