use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine};
use case_qa_core::{
    clamp_top_k, transient_from_request, AgentConfig, ChatError, Citation, Embedder,
    IngestionOptions, LanguageModel, ReasoningAgent, SessionStore, UploadCache, VectorIndex,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub index: Arc<VectorIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub model: Arc<dyn LanguageModel>,
    pub sessions: Arc<SessionStore>,
    pub uploads: Arc<UploadCache>,
    pub options: IngestionOptions,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    user_doc_text: Option<String>,
    #[serde(default)]
    user_pdf_base64: Option<String>,
    #[serde(default)]
    user_pdf_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    session_id: String,
    answer: String,
    citations: Vec<Citation>,
    incomplete: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: String,
    message: String,
}

/// Every user-visible failure carries a machine-distinguishable kind; raw
/// internals never leak into a response.
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                kind: self.kind.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<ChatError> for ApiError {
    fn from(error: ChatError) -> Self {
        let (status, kind) = match &error {
            ChatError::EmptyMessage => (StatusCode::BAD_REQUEST, "empty_message"),
            ChatError::UnsupportedUpload(_) => (StatusCode::BAD_REQUEST, "unsupported_upload"),
            ChatError::ConflictingContextInputs => {
                (StatusCode::BAD_REQUEST, "conflicting_context_inputs")
            }
            ChatError::ModelUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "model_unavailable"),
            ChatError::Retrieval(_) => (StatusCode::INTERNAL_SERVER_ERROR, "retrieval_failed"),
        };

        Self {
            status,
            kind,
            message: error.to_string(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(chat))
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "passages": state.index.passage_count(),
    }))
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let message = request.message.trim().to_string();
    if message.is_empty() {
        return Err(ChatError::EmptyMessage.into());
    }

    let raw_text = request
        .user_doc_text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty());
    let encoded_upload = request
        .user_pdf_base64
        .as_deref()
        .map(str::trim)
        .filter(|encoded| !encoded.is_empty());

    // Mutually exclusive context inputs are rejected before any decoding.
    if raw_text.is_some() && encoded_upload.is_some() {
        return Err(ChatError::ConflictingContextInputs.into());
    }

    let upload_bytes = match encoded_upload {
        Some(encoded) => Some(STANDARD.decode(encoded).map_err(|error| {
            ApiError::from(ChatError::UnsupportedUpload(format!(
                "upload is not valid base64: {error}"
            )))
        })?),
        None => None,
    };
    let upload_name = request.user_pdf_name.as_deref().unwrap_or("uploaded.pdf");
    let upload = upload_bytes
        .as_deref()
        .map(|bytes| (upload_name, bytes));

    let transient = transient_from_request(
        upload,
        raw_text,
        &state.uploads,
        state.embedder.as_ref(),
        &state.options,
    )?;

    let (session_id, session_handle) = state.sessions.resolve(request.session_id.as_deref());
    let mut session = session_handle.lock().await;

    let config = AgentConfig::with_top_k(clamp_top_k(request.top_k));
    let agent = ReasoningAgent::new(
        state.model.as_ref(),
        state.index.as_ref(),
        state.embedder.as_ref(),
        config,
    );
    let outcome = agent.answer(&mut session, &message, transient.as_ref()).await?;

    info!(
        session = %session_id,
        citations = outcome.citations.len(),
        incomplete = outcome.incomplete,
        "chat turn answered"
    );

    Ok(Json(ChatResponse {
        session_id,
        answer: outcome.answer,
        citations: outcome.citations,
        incomplete: outcome.incomplete,
    }))
}
