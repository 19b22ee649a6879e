//! JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `PUT`  | `/submissions/{id}` | Register `{owner, repo, revision}` for a submission |
//! | `POST` | `/submissions/{id}/index` | Start indexing in the background |
//! | `GET`  | `/submissions/{id}/index` | Current status record |
//! | `POST` | `/submissions/{id}/search` | Retrieve chunks for a query |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `POST /submissions/{id}/index` answers immediately: `202` with the
//! `indexing` status when a run was started or is already in flight, `200`
//! with cached counts when the index is ready.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "index_not_ready", "message": "index for submission s1 is not ready (status: indexing)" } }
//! ```
//!
//! Codes come from [`IndexError::code`]; `internal` errors carry a generic
//! message and are logged server-side.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::error::IndexError;
use crate::models::{IndexOutcome, IndexStatusRecord, RepoReference, SearchOptions, SearchResponse};
use crate::pipeline::{Claim, Engine};

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Engine::from_config(config).await?;
    let app = router(engine);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "server listening");
    println!("Listening on http://{}", config.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
}

/// All routes over a shared [`Engine`].
pub fn router(engine: Engine) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/submissions/{id}", put(handle_register))
        .route(
            "/submissions/{id}/index",
            post(handle_start_indexing).get(handle_get_status),
        )
        .route("/submissions/{id}/search", post(handle_search))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(engine)
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

struct AppError(IndexError);

impl From<IndexError> for AppError {
    fn from(err: IndexError) -> Self {
        AppError(err)
    }
}

fn status_for(err: &IndexError) -> StatusCode {
    match err {
        IndexError::UnknownSubmission(_) | IndexError::NoIndex(_) | IndexError::NotFound(_) => {
            StatusCode::NOT_FOUND
        }
        IndexError::IndexNotReady { .. } | IndexError::IndexFailed(_) => StatusCode::CONFLICT,
        IndexError::EmptyQuery | IndexError::InvalidReference(_) => StatusCode::BAD_REQUEST,
        IndexError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        IndexError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        IndexError::PathSecurity { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let message = if code == "internal" {
            error!(error = %self.0.chain(), "request failed");
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };
        (status_for(&self.0), Json(body)).into_response()
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ PUT /submissions/{id} ============

#[derive(Deserialize)]
struct RegisterRequest {
    owner: String,
    repo: String,
    revision: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    submission_id: String,
    repo: RepoReference,
}

async fn handle_register(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    let repo = RepoReference::new(&req.owner, &req.repo, &req.revision)?;
    engine.indexer.register(&id, &repo).await?;
    Ok(Json(RegisterResponse {
        submission_id: id,
        repo,
    }))
}

// ============ POST /submissions/{id}/index ============

async fn handle_start_indexing(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<IndexOutcome>), AppError> {
    match engine.indexer.begin(&id).await? {
        Claim::Cached(record) => Ok((StatusCode::OK, Json(IndexOutcome::from(&record)))),
        Claim::InFlight(record) => Ok((StatusCode::ACCEPTED, Json(IndexOutcome::from(&record)))),
        Claim::Started(run) => {
            let indexer = engine.indexer.clone();
            tokio::spawn(async move {
                let submission_id = run.submission_id.clone();
                if let Err(e) = indexer.execute(run).await {
                    error!(%submission_id, error = %e.chain(), "could not record indexing result");
                }
            });
            let record = engine.indexer.get_index_status(&id).await?;
            Ok((StatusCode::ACCEPTED, Json(IndexOutcome::from(&record))))
        }
    }
}

// ============ GET /submissions/{id}/index ============

async fn handle_get_status(
    State(engine): State<Engine>,
    Path(id): Path<String>,
) -> Result<Json<IndexStatusRecord>, AppError> {
    Ok(Json(engine.indexer.get_index_status(&id).await?))
}

// ============ POST /submissions/{id}/search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(flatten)]
    options: SearchOptions,
}

async fn handle_search(
    State(engine): State<Engine>,
    Path(id): Path<String>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let response = engine
        .retriever
        .search(&id, &req.query, &req.options)
        .await?;
    Ok(Json(response))
}
