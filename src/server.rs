use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{
        HeaderMap, Method, StatusCode,
        header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{ChatProxy, ProxyError};

const MSG_MISSING_AUTH: &str = "Missing authorization header";
const MSG_UNAUTHORIZED: &str = "Unauthorized";
const MSG_USAGE_LIMIT: &str = "Usage limit exceeded";
const MSG_RATE_LIMITED: &str = "Rate limit exceeded. Please try again later.";
const MSG_PAYMENT_REQUIRED: &str = "Payment required. Please add credits to continue.";
const MSG_GATEWAY: &str = "AI gateway error";
const MSG_NOT_CONFIGURED: &str = "AI provider is not configured";
const MSG_INTERNAL: &str = "Internal server error";

// Stands in for a header whose bytes are not visible ASCII; the auth gate rejects it.
const UNREADABLE_CREDENTIAL: &str = "unreadable";

#[derive(Clone)]
struct AppState {
    proxy: ChatProxy,
}

/// Error as the client sees it: a status and a `{ "error": ... }` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        let (status, message) = match err {
            ProxyError::MissingAuthorization => (StatusCode::UNAUTHORIZED, MSG_MISSING_AUTH.into()),
            ProxyError::Unauthorized => (StatusCode::UNAUTHORIZED, MSG_UNAUTHORIZED.into()),
            ProxyError::QuotaExceeded { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, MSG_USAGE_LIMIT.into())
            }
            ProxyError::Validation(message) => (StatusCode::BAD_REQUEST, message),
            ProxyError::UpstreamRateLimited => {
                (StatusCode::TOO_MANY_REQUESTS, MSG_RATE_LIMITED.into())
            }
            ProxyError::UpstreamPaymentRequired => {
                (StatusCode::PAYMENT_REQUIRED, MSG_PAYMENT_REQUIRED.into())
            }
            ProxyError::UpstreamGateway { status } => {
                let status = if status.is_client_error() || status.is_server_error() {
                    status
                } else {
                    StatusCode::BAD_GATEWAY
                };
                (status, MSG_GATEWAY.into())
            }
            ProxyError::StreamingUnavailable => {
                tracing::error!("streaming endpoint called without a direct AI provider");
                (StatusCode::INTERNAL_SERVER_ERROR, MSG_NOT_CONFIGURED.into())
            }
            other => {
                tracing::error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, MSG_INTERNAL.into())
            }
        };
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

async fn health_check() -> &'static str {
    "ok"
}

// OPTIONS is normally answered by the CORS layer before routing.
async fn preflight() -> StatusCode {
    StatusCode::OK
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .map(|value| value.to_str().unwrap_or(UNREADABLE_CREDENTIAL))
}

async fn brand_consultant(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let reply = state.proxy.consult(authorization(&headers), &body).await?;
    Ok(Json(reply.into_body()).into_response())
}

async fn video_script_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let stream = state
        .proxy
        .stream_script_chat(authorization(&headers), &body)
        .await?;

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(Any)
}

pub fn router(proxy: ChatProxy) -> Router {
    let state = Arc::new(AppState { proxy });

    Router::new()
        .route("/health", get(health_check))
        .route(
            "/api/brand-consultant",
            post(brand_consultant).options(preflight),
        )
        .route(
            "/api/video-script-chat",
            post(video_script_chat).options(preflight),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, proxy: ChatProxy) -> Result<(), Box<dyn std::error::Error>> {
    let limits = proxy.limits();
    let app = router(proxy);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    tracing::info!(
        %bound_addr,
        brand_consultant_limit = limits.brand_consultant,
        video_script_chat_limit = limits.video_script_chat,
        "chat proxy listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(err: ProxyError) -> ApiError {
        ApiError::from(err)
    }

    #[test]
    fn auth_and_quota_errors_map_to_distinct_statuses() {
        let missing = api(ProxyError::MissingAuthorization);
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(missing.message(), "Missing authorization header");

        let bad = api(ProxyError::Unauthorized);
        assert_eq!(bad.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(bad.message(), "Unauthorized");

        let quota = api(ProxyError::QuotaExceeded { used: 2, limit: 2 });
        assert_eq!(quota.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(quota.message(), "Usage limit exceeded");
    }

    #[test]
    fn upstream_errors_keep_their_class() {
        let rate = api(ProxyError::UpstreamRateLimited);
        assert_eq!(rate.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rate.message(), "Rate limit exceeded. Please try again later.");

        let payment = api(ProxyError::UpstreamPaymentRequired);
        assert_eq!(payment.status(), StatusCode::PAYMENT_REQUIRED);

        let gateway = api(ProxyError::UpstreamGateway {
            status: StatusCode::SERVICE_UNAVAILABLE,
        });
        assert_eq!(gateway.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(gateway.message(), "AI gateway error");

        let odd = api(ProxyError::UpstreamGateway {
            status: StatusCode::MOVED_PERMANENTLY,
        });
        assert_eq!(odd.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn unreadable_authorization_header_is_not_treated_as_absent() {
        let mut headers = HeaderMap::new();
        assert_eq!(authorization(&headers), None);

        headers.insert(
            AUTHORIZATION,
            axum::http::HeaderValue::from_bytes(b"Bearer \xff\xfe").unwrap(),
        );
        let header = authorization(&headers);
        assert!(header.is_some());
        assert!(matches!(
            crate::auth::bearer_token(header),
            Err(ProxyError::Unauthorized)
        ));
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = api(ProxyError::MissingCompletion);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), "Internal server error");

        let validation = api(ProxyError::Validation("Message cannot be empty".into()));
        assert_eq!(validation.status(), StatusCode::BAD_REQUEST);
        assert_eq!(validation.message(), "Message cannot be empty");
    }
}
