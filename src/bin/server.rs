//! storynarrator-server: HTTP front end for the narration pipeline.
//!
//! | Method | Path                             | Purpose                         |
//! |--------|----------------------------------|---------------------------------|
//! | POST   | `/api/v1/narrations`             | submit a story → `202 {job_id}` |
//! | GET    | `/api/v1/narrations/{job_id}`    | live state or final output      |
//! | DELETE | `/api/v1/narrations/{job_id}`    | cancel                          |
//! | GET    | `/api/v1/audio/{name}`           | download a finished artifact    |
//! | GET    | `/api/v1/styles`                 | narration styles and voices     |
//! | GET    | `/health`                        | liveness                        |
//!
//! ```text
//! storynarrator-server --config narrator.json --port 3000
//! RUST_LOG=storynarrator=debug storynarrator-server
//! ```

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use clap::Parser;
use serde_json::{json, Value};
use storynarrator::{store::is_valid_name, JobOutcome, JobState, NarrationRequest, Narrator, NarratorConfig};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "storynarrator-server", version, about = "Story narration HTTP server")]
struct Args {
    /// JSON config file; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Overrides `output_dir` from the config.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Overrides `primary.base_url` from the config.
    #[arg(long)]
    primary_url: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

struct JobEntry {
    state: watch::Receiver<JobState>,
    cancel: CancellationToken,
    outcome: Option<JobOutcome>,
    finished_at: Option<Instant>,
}

struct AppState {
    narrator: Narrator,
    jobs: RwLock<HashMap<String, JobEntry>>,
    retention: Duration,
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => {
                warn!("Bad request: {msg}");
                (StatusCode::BAD_REQUEST, msg)
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => {
                tracing::error!("Internal server error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };
        (status, Json(json!({ "error": message, "status": status.as_u16() }))).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn styles(State(app): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "styles": app.narrator.styles() }))
}

async fn submit(
    State(app): State<Arc<AppState>>,
    Json(request): Json<NarrationRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if let Some(options) = &request.job_options {
        options.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }

    let handle = app.narrator.spawn(request);
    let job_id = handle.job_id.clone();
    let entry = JobEntry {
        state: handle.subscribe(),
        cancel: handle.cancellation_token(),
        outcome: None,
        finished_at: None,
    };
    app.jobs.write().await.insert(job_id.clone(), entry);

    let registry = Arc::clone(&app);
    let id = job_id.clone();
    tokio::spawn(async move {
        let outcome = handle.wait().await;
        if let Some(entry) = registry.jobs.write().await.get_mut(&id) {
            entry.outcome = Some(outcome);
            entry.finished_at = Some(Instant::now());
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id, "state": JobState::Pending }))))
}

async fn status(
    State(app): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let jobs = app.jobs.read().await;
    let entry = jobs.get(&job_id).ok_or_else(|| ApiError::NotFound(format!("no job '{job_id}'")))?;
    let body = match &entry.outcome {
        Some(Ok(success)) => json!({ "job_id": job_id, "state": JobState::Complete, "result": success }),
        Some(Err(failure)) => json!({ "job_id": job_id, "state": JobState::Failed, "error": failure }),
        None => json!({ "job_id": job_id, "state": *entry.state.borrow() }),
    };
    Ok(Json(body))
}

async fn cancel(
    State(app): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let jobs = app.jobs.read().await;
    let entry = jobs.get(&job_id).ok_or_else(|| ApiError::NotFound(format!("no job '{job_id}'")))?;
    entry.cancel.cancel();
    info!(job_id = %job_id, "cancellation requested");
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job_id, "state": *entry.state.borrow() }))))
}

async fn download(
    State(app): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let store = app
        .narrator
        .store()
        .ok_or_else(|| ApiError::NotFound("artifact storage is disabled".into()))?;
    if !is_valid_name(&name) {
        return Err(ApiError::BadRequest(format!("invalid artifact name '{name}'")));
    }
    match store.fetch(&name).await {
        Ok(Some((bytes, mime))) => Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response()),
        Ok(None) => Err(ApiError::NotFound(format!("no artifact '{name}'"))),
        Err(e) => Err(ApiError::Internal(e.to_string())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Housekeeping
// ─────────────────────────────────────────────────────────────────────────────

async fn sweep_loop(app: Arc<AppState>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        if let Some(store) = app.narrator.store() {
            if let Err(e) = store.sweep_expired(app.retention).await {
                warn!(error = %e, "artifact sweep failed");
            }
        }
        let mut jobs = app.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| entry.finished_at.map_or(true, |t| t.elapsed() < app.retention));
        if jobs.len() < before {
            info!(dropped = before - jobs.len(), "pruned finished job records");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn router(app: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/narrations", axum::routing::post(submit))
        .route("/v1/narrations/{job_id}", get(status).delete(cancel))
        .route("/v1/audio/{name}", get(download))
        .route("/v1/styles", get(styles));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(app)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storynarrator=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => NarratorConfig::from_json_file(path)?,
        None => NarratorConfig::default(),
    };
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(url) = args.primary_url {
        config.primary.base_url = url;
    }

    let narrator = Narrator::from_config(&config).await?;
    let app = Arc::new(AppState {
        narrator,
        jobs: RwLock::new(HashMap::new()),
        retention: Duration::from_secs(config.retention_secs),
    });
    tokio::spawn(sweep_loop(Arc::clone(&app)));

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", args.host, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Cannot bind {addr}"))?;
    info!(%addr, "storynarrator-server listening");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    Ok(())
}
