use std::net::SocketAddr;

use anyhow::{Context, Result};
use askama::Template;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::Instrument;
use uuid::Uuid;

use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::models::{ChatReply, ChatRequest, SessionResetRequest, SessionResetResponse};
use crate::openai::CompletionTimeout;

const AUTH_HEADER: &str = "x-auth";

#[derive(Clone)]
struct AppState {
    chat: ChatService,
    max_images: usize,
    debug: bool,
}

pub fn router(config: &AppConfig, chat_service: ChatService) -> Router {
    let state = AppState {
        chat: chat_service,
        max_images: config.limits.max_images,
        debug: config.debug,
    };

    Router::new()
        .route("/", get(index_page))
        .route("/health", get(health))
        .route("/chat", post(chat_handler))
        .route("/api/session/reset", post(reset_session))
        .layer(DefaultBodyLimit::max(config.limits.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: AppConfig, chat_service: ChatService) -> Result<()> {
    let app = router(&config, chat_service);

    let addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr))?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_page() -> Result<Html<String>, ApiError> {
    let body = IndexTemplate {
        title: "MathMate Pro",
    }
    .render()?;
    Ok(Html(body))
}

async fn health() -> &'static str {
    "ok"
}

async fn chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatReply>, ApiError> {
    request
        .validate(state.max_images)
        .map_err(ApiError::bad_request)?;

    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("chat", %request_id);
    let auth = auth_token(&headers);

    match state.chat.answer(request, &auth).instrument(span).await {
        Ok(reply) => Ok(Json(reply)),
        Err(err) => {
            tracing::error!(%request_id, "chat request failed: {err:#}");
            Err(ApiError::from_service(err, state.debug))
        }
    }
}

async fn reset_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SessionResetRequest>,
) -> Result<Json<SessionResetResponse>, ApiError> {
    let auth = auth_token(&headers);
    if !state.chat.is_authorized(&auth) {
        return Err(ApiError {
            status: StatusCode::UNAUTHORIZED,
            message: "Please type the access password first".to_string(),
        });
    }

    state
        .chat
        .reset_session(request, &auth)
        .await
        .map(Json)
        .map_err(|err| ApiError::from_service(err, state.debug))
}

fn auth_token(headers: &HeaderMap) -> String {
    headers
        .get(AUTH_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    title: &'static str,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn from_service(err: anyhow::Error, debug: bool) -> Self {
        if err.downcast_ref::<CompletionTimeout>().is_some() {
            return Self {
                status: StatusCode::GATEWAY_TIMEOUT,
                message: "The tutor took too long to answer. Please try again.".to_string(),
            };
        }

        let message = if debug {
            format!("Server error: {err:#}")
        } else {
            "Server error".to_string()
        };
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        }
    }
}

impl From<askama::Error> for ApiError {
    fn from(value: askama::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}
