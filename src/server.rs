//! Loopback HTTP surface: EHR launch entry point, OAuth redirect target and a
//! small JSON API for the UI. Secrets never leave through this surface.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::callback::CallbackParams;
use crate::error::SmartError;
use crate::session::SmartSession;

#[derive(Debug, Deserialize)]
pub struct LaunchParams {
    pub iss: Option<String>,
    pub launch: Option<String>,
}

pub fn router(session: Arc<SmartSession>) -> Router {
    Router::new()
        .route("/launch", get(launch_handler))
        .route("/callback", get(callback_handler))
        .route("/api/session", get(session_handler))
        .route("/api/refresh", post(refresh_handler))
        .route("/api/audit", get(audit_handler))
        .route("/health", get(health_endpoint))
        .with_state(session)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Serve until the process receives Ctrl-C
pub async fn serve(session: Arc<SmartSession>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Launch server listening on {}", listener.local_addr()?);
    axum::serve(listener, router(session))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;
    Ok(())
}

fn status_for(err: &SmartError) -> StatusCode {
    match err {
        SmartError::Discovery { issuer, .. } if issuer.is_empty() => StatusCode::BAD_REQUEST,
        SmartError::RefreshTooSoon | SmartError::VendorRateLimit { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        SmartError::NotAuthenticated | SmartError::NoRefreshToken => StatusCode::UNAUTHORIZED,
        SmartError::StateMismatch
        | SmartError::MissingFlowState
        | SmartError::ExpiredFlowState { .. }
        | SmartError::AuthorizationDenied { .. }
        | SmartError::UnsupportedVendor(_)
        | SmartError::Validation(_)
        | SmartError::UnsupportedWrite { .. } => StatusCode::BAD_REQUEST,
        SmartError::VersionConflict { .. } => StatusCode::CONFLICT,
        SmartError::Discovery { .. }
        | SmartError::TokenExchange(_)
        | SmartError::RefreshFailed(_)
        | SmartError::TokenRefreshFailed(_)
        | SmartError::Network(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct ApiError(SmartError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = json!({
            "error": self.0.to_string(),
            "relaunchRequired": self.0.requires_relaunch(),
        });
        (status, Json(body)).into_response()
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{title}</title></head>\
         <body><h1>{title}</h1>{body}</body></html>",
        title = escape_html(title),
        body = body
    ))
}

/// Full-page error; launch and session errors tell the user to relaunch
fn error_page(err: &SmartError) -> Response {
    let action = if err.requires_relaunch() {
        "<p>Return to your EHR and launch the app again.</p>"
    } else {
        "<p>Please try again.</p>"
    };
    let body = format!("<p>{}</p>{}", escape_html(&err.to_string()), action);
    (status_for(err), page("Authorization failed", &body)).into_response()
}

async fn launch_handler(
    State(session): State<Arc<SmartSession>>,
    Query(params): Query<LaunchParams>,
) -> Response {
    let issuer = params.iss.unwrap_or_default();
    match session
        .begin_authorization(&issuer, params.launch.as_deref())
        .await
    {
        Ok(redirect) => (
            StatusCode::FOUND,
            [(header::LOCATION, redirect.url.to_string())],
        )
            .into_response(),
        Err(e) => error_page(&e),
    }
}

async fn callback_handler(
    State(session): State<Arc<SmartSession>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    match session.handle_callback(&params).await {
        Ok(outcome) => {
            let body = format!(
                "<p>Connected to {}.</p><p>You can close this window.</p>",
                escape_html(outcome.vendor.vendor.display_name())
            );
            page("Authorized", &body).into_response()
        }
        Err(e) => error_page(&e),
    }
}

async fn session_handler(State(session): State<Arc<SmartSession>>) -> Json<Value> {
    let Some(token) = session.current_token() else {
        return Json(json!({ "authenticated": false }));
    };
    let vendor = session.vendor_context();
    Json(json!({
        "authenticated": true,
        "vendor": vendor.as_ref().map(|v| v.vendor),
        "vendorName": vendor.as_ref().map(|v| v.vendor.display_name()),
        "issuer": vendor.as_ref().map(|v| v.issuer.clone()),
        "tenant": vendor.as_ref().and_then(|v| v.tenant.clone()),
        "practiceId": vendor.as_ref().and_then(|v| v.practice_id.clone()),
        "patient": token.patient,
        "encounter": token.encounter,
        "fhirUser": token.fhir_user,
        "scope": token.scope,
        "smartStyleUrl": token.smart_style_url,
        "expiry": session.expiry_info(),
    }))
}

async fn refresh_handler(State(session): State<Arc<SmartSession>>) -> Result<Json<Value>, ApiError> {
    session.refresh().await.map_err(ApiError)?;
    Ok(Json(json!({ "refreshed": true, "expiry": session.expiry_info() })))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    patient: Option<String>,
    user: Option<String>,
}

async fn audit_handler(
    State(session): State<Arc<SmartSession>>,
    Query(query): Query<AuditQuery>,
) -> Json<Value> {
    let Some(trail) = session.audit_trail() else {
        return Json(json!([]));
    };
    let entries = match (query.patient, query.user) {
        (Some(patient), _) => trail.for_patient(&patient),
        (None, Some(user)) => trail.for_user(&user),
        (None, None) => trail.writes(),
    };
    Json(json!(entries))
}

async fn health_endpoint(State(session): State<Arc<SmartSession>>) -> Json<Value> {
    Json(json!({
        "healthy": true,
        "authenticated": session.current_token().is_some(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SmartConfig;
    use crate::storage::MemoryStore;
    use crate::write::MemoryAuditSink;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn spawn(session: Arc<SmartSession>) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(session)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn session() -> Arc<SmartSession> {
        Arc::new(
            SmartSession::new(
                SmartConfig {
                    client_id: "client-1".into(),
                    ..Default::default()
                },
                Arc::new(MemoryStore::new()),
                Arc::new(ManualClock::default()),
                Arc::new(MemoryAuditSink::default()),
            )
            .unwrap(),
        )
    }

    fn no_redirects() -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap()
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<b>\"x\" & 'y'</b>"),
            "&lt;b&gt;&quot;x&quot; &amp; &#39;y&#39;&lt;/b&gt;"
        );
    }

    #[tokio::test]
    async fn test_launch_redirects_to_ehr() {
        let ehr = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fhir/.well-known/smart-configuration"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "authorization_endpoint": format!("{}/authorize", ehr.uri()),
                "token_endpoint": format!("{}/token", ehr.uri())
            })))
            .mount(&ehr)
            .await;

        let base = spawn(session()).await;
        let response = no_redirects()
            .get(format!("{}/launch", base))
            .query(&[("iss", format!("{}/fhir", ehr.uri())), ("launch", "abc".into())])
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::FOUND);
        let location = response.headers()[reqwest::header::LOCATION].to_str().unwrap();
        assert!(location.starts_with(&format!("{}/authorize?", ehr.uri())));
        assert!(location.contains("launch=abc"));
    }

    #[tokio::test]
    async fn test_launch_without_issuer_shows_error_page() {
        let base = spawn(session()).await;
        let response = no_redirects().get(format!("{}/launch", base)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body = response.text().await.unwrap();
        assert!(body.contains("launch the app again"));
    }

    #[tokio::test]
    async fn test_callback_without_attempt_is_rejected() {
        let base = spawn(session()).await;
        let response = no_redirects()
            .get(format!("{}/callback?code=abc&state=xyz", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_session_and_refresh_when_signed_out() {
        let base = spawn(session()).await;
        let client = no_redirects();

        let body: Value = client
            .get(format!("{}/api/session", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["authenticated"], false);

        let response = client.post(format!("{}/api/refresh", base)).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["relaunchRequired"], true);

        let health: Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["healthy"], true);
    }
}
