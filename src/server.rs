//! JSON HTTP API over the query pipeline.
//!
//! # Endpoints
//!
//! | Method   | Path                        | Description |
//! |----------|-----------------------------|-------------|
//! | `POST`   | `/query`                    | Answer a question with full step trace |
//! | `GET`    | `/documents`                | List stored documents |
//! | `POST`   | `/documents`                | Add a document (title + body) |
//! | `DELETE` | `/documents/{id}`           | Delete a document and its chunks |
//! | `GET`    | `/settings`                 | Current runtime settings |
//! | `PUT`    | `/settings`                 | Replace runtime settings (validated) |
//! | `GET`    | `/settings/presets`         | List the built-in presets |
//! | `POST`   | `/settings/presets/{name}`  | Apply a preset |
//! | `POST`   | `/settings/models`          | List models a candidate provider can serve |
//! | `POST`   | `/settings/profiles/{name}` | Save the active provider as a profile |
//! | `PUT`    | `/settings/profiles/{name}` | Activate a saved profile |
//! | `GET`    | `/providers/local`          | Probe local runtimes |
//! | `GET`    | `/traces`                   | Recent traces, newest first |
//! | `GET`    | `/traces/{id}`              | One trace by id |
//! | `POST`   | `/evaluation`               | Run a question set, aggregate metrics |
//! | `GET`    | `/health`                   | Health check (returns version) |
//!
//! # Error Contract
//!
//! Every error response carries the same envelope:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `provider_error`
//! (502), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use std::time::Duration;

use crate::config::Config;
use crate::pipeline::Pipeline;
use crate::provider::{build_client, discover_local_providers};
use crate::settings::{all_presets, ProviderConfig, Settings, SettingsStore};
use crate::store::SqliteStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    store: Arc<SqliteStore>,
    settings: Arc<SettingsStore>,
    pipeline: Arc<Pipeline>,
}

/// Starts the HTTP server on `[server].bind` and serves until the process
/// is terminated.
pub async fn run_server(
    config: &Config,
    store: Arc<SqliteStore>,
    settings: Arc<SettingsStore>,
    pipeline: Arc<Pipeline>,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState {
        config: Arc::new(config.clone()),
        store,
        settings,
        pipeline,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/query", post(handle_query))
        .route("/documents", get(handle_list_documents))
        .route("/documents", post(handle_add_document))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/settings", get(handle_get_settings))
        .route("/settings", put(handle_put_settings))
        .route("/settings/presets", get(handle_list_presets))
        .route("/settings/presets/{name}", post(handle_apply_preset))
        .route("/settings/models", post(handle_list_provider_models))
        .route("/settings/profiles/{name}", post(handle_save_profile))
        .route("/settings/profiles/{name}", put(handle_activate_profile))
        .route("/providers/local", get(handle_local_providers))
        .route("/traces", get(handle_list_traces))
        .route("/traces/{id}", get(handle_get_trace))
        .route("/evaluation", post(handle_evaluation))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!("listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

/// Map a pipeline or store error onto the closest HTTP status. Validation
/// errors are worded with "must" or "Unknown" by the layers that raise
/// them, which keeps this mapping a string check rather than a shared
/// error enum across every module.
fn classify_error(err: anyhow::Error) -> AppError {
    let msg = err.to_string();
    if msg.contains("not found") {
        not_found(msg)
    } else if msg.contains("must") || msg.contains("Unknown") || msg.contains("invalid") {
        bad_request(msg)
    } else {
        internal(msg)
    }
}

// ============ Query ============

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }
    let result = state
        .pipeline
        .ask(&req.question)
        .await
        .map_err(classify_error)?;
    Ok(Json(serde_json::to_value(result).map_err(|e| internal(e.to_string()))?))
}

// ============ Documents ============

#[derive(Deserialize)]
struct AddDocumentRequest {
    title: String,
    text: String,
}

#[derive(Serialize)]
struct DocumentSummary {
    id: String,
    title: String,
    chunk_count: i64,
}

async fn handle_add_document(
    State(state): State<AppState>,
    Json(req): Json<AddDocumentRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.title.trim().is_empty() {
        return Err(bad_request("title must not be empty"));
    }
    if req.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    let (id, chunk_count) = state
        .store
        .add_document(&req.title, &req.text, state.config.chunking.max_tokens)
        .await
        .map_err(classify_error)?;
    Ok(Json(serde_json::json!({ "id": id, "chunk_count": chunk_count })))
}

async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<Vec<DocumentSummary>>, AppError> {
    let docs = state.store.list_documents().await.map_err(classify_error)?;
    Ok(Json(
        docs.into_iter()
            .map(|(id, title, chunk_count)| DocumentSummary {
                id,
                title,
                chunk_count,
            })
            .collect(),
    ))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .store
        .delete_document(&id)
        .await
        .map_err(classify_error)?;
    Ok(Json(serde_json::json!({ "deleted": id })))
}

// ============ Settings ============

async fn handle_get_settings(State(state): State<AppState>) -> Json<Settings> {
    Json(state.settings.snapshot())
}

async fn handle_put_settings(
    State(state): State<AppState>,
    Json(settings): Json<Settings>,
) -> Result<Json<Settings>, AppError> {
    let applied = state.settings.replace(settings).map_err(classify_error)?;
    Ok(Json(applied))
}

async fn handle_list_presets(State(_): State<AppState>) -> Json<serde_json::Value> {
    let presets: serde_json::Map<String, serde_json::Value> = all_presets()
        .into_iter()
        .filter_map(|(name, cfg)| {
            serde_json::to_value(cfg).ok().map(|v| (name.to_string(), v))
        })
        .collect();
    Json(serde_json::Value::Object(presets))
}

async fn handle_apply_preset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Settings>, AppError> {
    if crate::settings::preset(&name).is_none() {
        return Err(not_found(format!("Unknown preset '{}'", name)));
    }
    let applied = state.settings.apply_preset(&name).map_err(classify_error)?;
    Ok(Json(applied))
}

/// Probe a candidate provider configuration: returns the model ids the
/// backend can serve without changing the active settings. Clients call
/// this before saving a provider via `PUT /settings`.
async fn handle_list_provider_models(
    State(state): State<AppState>,
    Json(provider): Json<ProviderConfig>,
) -> Result<Json<serde_json::Value>, AppError> {
    let client = build_client(
        &provider,
        Duration::from_secs(state.config.providers.probe_timeout_secs),
    );
    let models = client.list_models().await.map_err(|e| AppError {
        status: StatusCode::BAD_GATEWAY,
        code: "provider_error".to_string(),
        message: e.to_string(),
    })?;
    Ok(Json(serde_json::json!({ "models": models })))
}

async fn handle_save_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Settings>, AppError> {
    let Some(provider) = state.settings.snapshot().provider else {
        return Err(bad_request("no active provider to save"));
    };
    let applied = state
        .settings
        .save_profile(&name, provider)
        .map_err(classify_error)?;
    Ok(Json(applied))
}

async fn handle_activate_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Settings>, AppError> {
    let applied = state
        .settings
        .activate_profile(&name)
        .map_err(classify_error)?;
    Ok(Json(applied))
}

// ============ Providers ============

async fn handle_local_providers(State(state): State<AppState>) -> Json<serde_json::Value> {
    let infos = discover_local_providers(&state.config.providers).await;
    Json(serde_json::json!({ "providers": infos }))
}

// ============ Traces ============

#[derive(Deserialize)]
struct TraceListParams {
    #[serde(default = "default_trace_limit")]
    limit: usize,
}

fn default_trace_limit() -> usize {
    50
}

async fn handle_list_traces(
    State(state): State<AppState>,
    Query(params): Query<TraceListParams>,
) -> Result<Json<serde_json::Value>, AppError> {
    let traces = state
        .pipeline
        .traces()
        .list(params.limit)
        .await
        .map_err(classify_error)?;
    Ok(Json(serde_json::json!({ "traces": traces })))
}

async fn handle_get_trace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let trace = state
        .pipeline
        .traces()
        .get(&id)
        .await
        .map_err(classify_error)?
        .ok_or_else(|| not_found(format!("trace not found: {}", id)))?;
    Ok(Json(serde_json::to_value(trace).map_err(|e| internal(e.to_string()))?))
}

// ============ Evaluation ============

#[derive(Deserialize)]
struct EvaluationRequest {
    name: String,
    questions: Vec<String>,
}

async fn handle_evaluation(
    State(state): State<AppState>,
    Json(req): Json<EvaluationRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    if req.questions.is_empty() {
        return Err(bad_request("questions must not be empty"));
    }
    let report = state
        .pipeline
        .evaluate(&req.name, &req.questions)
        .await
        .map_err(classify_error)?;
    Ok(Json(serde_json::to_value(report).map_err(|e| internal(e.to_string()))?))
}

// ============ Health ============

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
