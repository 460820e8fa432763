use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing::{get, post}};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};

use crate::error::RelayError;
use crate::navigation::{NavigationSynchronizer, address_for};
use crate::registry::SessionSummary;
use crate::router::{ConversationRouter, Exchange};
use crate::session::{ChatSession, SessionId};

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<NavigationSynchronizer>,
    pub router: Arc<ConversationRouter>,
    pub metrics: Option<PrometheusHandle>,
}

pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::UnknownSession(_) | RelayError::NoActiveSession => StatusCode::NOT_FOUND,
            RelayError::EmptyMessage => StatusCode::BAD_REQUEST,
            RelayError::Busy(_) => StatusCode::CONFLICT,
            RelayError::Storage(err) => {
                tracing::error!(error = %format!("{err:#}"), "storage failure while handling request");
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

fn parse_id(raw: &str) -> Result<SessionId, StatusCode> {
    SessionId::parse(raw).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionSummary>,
    pub active: Option<SessionId>,
}

async fn list_sessions(State(state): State<AppState>) -> Json<ListSessionsResponse> {
    let registry = state.sync.registry();
    Json(ListSessionsResponse {
        sessions: registry.list_sessions().await,
        active: registry.active_session_id().await,
    })
}

async fn create_session(State(state): State<AppState>) -> Result<(StatusCode, Json<ChatSession>), ApiError> {
    let id = state.sync.new_chat().await?;
    let session = state
        .sync
        .registry()
        .get_session(&id)
        .await
        .ok_or(RelayError::UnknownSession(id))?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChatSession>, StatusCode> {
    let id = parse_id(&id)?;
    state.sync.registry().get_session(&id).await.map(Json).ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
pub struct ActiveResponse {
    pub active: Option<SessionId>,
    pub address: Option<String>,
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActiveResponse>, Response> {
    let id = parse_id(&id).map_err(IntoResponse::into_response)?;
    let active = state.sync.delete(&id).await.map_err(|e| ApiError(e).into_response())?;
    Ok(Json(ActiveResponse { address: Some(address_for(&active)), active: Some(active) }))
}

async fn select_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ActiveResponse>, Response> {
    let id = parse_id(&id).map_err(IntoResponse::into_response)?;
    state.sync.select(&id).await.map_err(|e| ApiError(e).into_response())?;
    Ok(Json(navigation_snapshot(&state).await))
}

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    pub text: String,
}

async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<Exchange>, ApiError> {
    Ok(Json(state.router.send(&body.text).await?))
}

async fn navigation_snapshot(state: &AppState) -> ActiveResponse {
    ActiveResponse {
        active: state.sync.registry().active_session_id().await,
        address: state.sync.current_address(),
    }
}

async fn get_navigation(State(state): State<AppState>) -> Json<ActiveResponse> {
    Json(navigation_snapshot(&state).await)
}

#[derive(Debug, Deserialize)]
pub struct NavigateBody {
    pub address: String,
}

async fn navigate(
    State(state): State<AppState>,
    Json(body): Json<NavigateBody>,
) -> Result<Json<ActiveResponse>, ApiError> {
    state.sync.on_navigate(&body.address).await?;
    Ok(Json(navigation_snapshot(&state).await))
}

async fn navigate_back(State(state): State<AppState>) -> Result<Json<ActiveResponse>, ApiError> {
    state.sync.back().await?;
    Ok(Json(navigation_snapshot(&state).await))
}

async fn navigate_forward(State(state): State<AppState>) -> Result<Json<ActiveResponse>, ApiError> {
    state.sync.forward().await?;
    Ok(Json(navigation_snapshot(&state).await))
}

async fn render_metrics(State(state): State<AppState>) -> Result<String, StatusCode> {
    state.metrics.as_ref().map(PrometheusHandle::render).ok_or(StatusCode::NOT_FOUND)
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions", post(create_session).get(list_sessions))
        .route("/v1/sessions/:id", get(get_session).delete(delete_session))
        .route("/v1/sessions/:id/select", post(select_session))
        .route("/v1/messages", post(send_message))
        .route("/v1/navigation", get(get_navigation).post(navigate))
        .route("/v1/navigation/back", post(navigate_back))
        .route("/v1/navigation/forward", post(navigate_forward))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}
