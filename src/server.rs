use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use ::time::{format_description::well_known::Rfc3339, OffsetDateTime};
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::{
    config::{PathScanRequest, PortScanRequest, WordlistSource},
    error::ScanError,
    probe::http::FoundPolicy,
    results::{PathSortKey, ScanRecord, SortOrder},
    session::{Engine, Session},
    types::{PathResult, PortResult, ProgressSnapshot, ScanEvent, ScanStatus},
};

#[derive(Clone)]
pub struct AppState {
    engine: Engine,
    inner: Arc<RwLock<ServerState>>, // most recent session per kind
    next_seq: Arc<AtomicU64>,
}

#[derive(Default)]
struct ServerState {
    ports: Option<Latest<PortResult>>,
    paths: Option<Latest<PathResult>>,
}

/// A published session tagged with the order its scan request arrived in.
struct Latest<R: ScanRecord> {
    seq: u64,
    session: Arc<Session<R>>,
}

fn ports_slot(s: &mut ServerState) -> &mut Option<Latest<PortResult>> {
    &mut s.ports
}

fn paths_slot(s: &mut ServerState) -> &mut Option<Latest<PathResult>> {
    &mut s.paths
}

impl AppState {
    async fn ports(&self) -> Option<Arc<Session<PortResult>>> {
        self.inner.read().await.ports.as_ref().map(|l| l.session.clone())
    }

    async fn paths(&self) -> Option<Arc<Session<PathResult>>> {
        self.inner.read().await.paths.as_ref().map(|l| l.session.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortScanBody {
    pub target: String,
    #[serde(default = "default_start_port")]
    pub start_port: u32,
    #[serde(default = "default_end_port")]
    pub end_port: u32,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub fingerprint: Option<bool>,
}

fn default_start_port() -> u32 {
    1
}

fn default_end_port() -> u32 {
    1024
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathScanBody {
    pub base_url: String,
    #[serde(default)]
    pub wordlist: Option<Vec<String>>,
    #[serde(default)]
    pub wordlist_path: Option<PathBuf>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// e.g. `"200,301,!404"`
    #[serde(default)]
    pub status_codes: Option<String>,
}

impl PortScanBody {
    fn into_request(self) -> PortScanRequest {
        let mut req = PortScanRequest::new(self.target, self.start_port, self.end_port);
        if let Some(c) = self.concurrency {
            req = req.with_concurrency(c);
        }
        if let Some(ms) = self.timeout_ms {
            req = req.with_timeout(Duration::from_millis(ms));
        }
        if let Some(f) = self.fingerprint {
            req = req.with_fingerprint(f);
        }
        req
    }
}

impl PathScanBody {
    fn into_request(self) -> Result<PathScanRequest, ScanError> {
        let source = match (self.wordlist, self.wordlist_path) {
            (Some(words), _) if !words.is_empty() => WordlistSource::Inline(words),
            (_, Some(path)) => WordlistSource::File(path),
            _ => return Err(ScanError::EmptyWordlist),
        };
        let mut req = PathScanRequest::new(self.base_url, source);
        if let Some(c) = self.concurrency {
            req = req.with_concurrency(c);
        }
        if let Some(ms) = self.timeout_ms {
            req = req.with_timeout(Duration::from_millis(ms));
        }
        if let Some(codes) = self.status_codes.as_deref() {
            req = req.with_policy(FoundPolicy::from_codes(codes)?);
        }
        Ok(req)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    #[serde(flatten)]
    pub progress: ProgressSnapshot,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBody<R> {
    pub timestamp: String,
    pub total_scanned: u64,
    pub results: Vec<R>,
}

#[derive(Debug, Deserialize)]
pub struct SortQuery {
    pub sort: Option<PathSortKey>,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(e: &ScanError) -> Response {
    let code = match e {
        ScanError::Busy(_) | ScanError::InvalidState { .. } => StatusCode::CONFLICT,
        ScanError::Resolve { .. } => StatusCode::BAD_REQUEST,
        e if e.is_config() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(ErrorBody { error: e.to_string() })).into_response()
}

fn status_of<R: ScanRecord>(session: Option<&Arc<Session<R>>>) -> StatusBody {
    match session {
        Some(s) => StatusBody {
            progress: s.progress(),
            error: s.error(),
        },
        None => StatusBody {
            progress: ProgressSnapshot::new(0, 0, 0, ScanStatus::Idle, 0.0),
            error: None,
        },
    }
}

/// Build the API router. Split from [`spawn_server`] so it can be driven in-process.
pub fn router(engine: Engine) -> Router {
    let state = AppState {
        engine,
        inner: Arc::new(RwLock::new(ServerState::default())),
        next_seq: Arc::default(),
    };

    let ports = Router::new()
        .route("/scan", post(post_port_scan))
        .route("/cancel", post(post_port_cancel))
        .route("/status", get(get_port_status))
        .route("/results", get(get_port_results))
        .route("/export", get(get_port_export));

    let paths = Router::new()
        .route("/scan", post(post_path_scan))
        .route("/cancel", post(post_path_cancel))
        .route("/status", get(get_path_status))
        .route("/results", get(get_path_results))
        .route("/export", get(get_path_export));

    Router::new()
        .nest("/api/ports", ports)
        .nest("/api/paths", paths)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, engine: Engine) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "serving API");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

/// Drain a session's events into the log so the unbounded channel never grows.
fn forward_events<R>(mut rx: mpsc::UnboundedReceiver<ScanEvent<R>>, label: &'static str)
where
    R: Serialize + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            match ev {
                ScanEvent::Progress(p) => {
                    debug!(scan = label, scanned = p.scanned, total = p.total, rate = p.rate, "progress")
                }
                ScanEvent::Found(r) => {
                    debug!(scan = label, result = %serde_json::to_string(&r).unwrap_or_default(), "found")
                }
                ScanEvent::Finished { status, error } => {
                    info!(scan = label, %status, error = error.as_deref().unwrap_or(""), "finished");
                    break;
                }
            }
        }
    });
}

fn export<R: ScanRecord>(session: Option<&Arc<Session<R>>>) -> ExportBody<R> {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    match session {
        Some(s) => ExportBody {
            timestamp,
            total_scanned: s.progress().scanned,
            results: s.results(),
        },
        None => ExportBody { timestamp, total_scanned: 0, results: Vec::new() },
    }
}

/// Start `session` without holding the state lock, then publish it.
///
/// The engine slot rejects a concurrent start of the same kind with `Busy`; a rejected
/// session is never published. A later request never gets replaced by an earlier one.
async fn launch<R>(
    app: &AppState,
    session: Session<R>,
    label: &'static str,
    slot: fn(&mut ServerState) -> &mut Option<Latest<R>>,
) -> Response
where
    R: ScanRecord + Serialize,
{
    let seq = app.next_seq.fetch_add(1, Ordering::Relaxed);
    let session = Arc::new(session);
    if let Some(rx) = session.events() {
        forward_events(rx, label);
    }
    let started = session.start().await;
    if let Err(e @ ScanError::Busy(_)) = &started {
        return error_response(e);
    }
    {
        let mut s = app.inner.write().await;
        let current = slot(&mut s);
        if current.as_ref().map_or(true, |l| l.seq < seq) {
            *current = Some(Latest { seq, session: session.clone() });
        }
    }
    match started {
        Ok(()) => (StatusCode::ACCEPTED, Json(status_of(Some(&session)))).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn post_port_scan(State(app): State<AppState>, Json(body): Json<PortScanBody>) -> Response {
    let session = app.engine.port_scan(body.into_request());
    launch(&app, session, "ports", ports_slot).await
}

async fn post_path_scan(State(app): State<AppState>, Json(body): Json<PathScanBody>) -> Response {
    let req = match body.into_request() {
        Ok(r) => r,
        Err(e) => return error_response(&e),
    };
    let session = app.engine.path_scan(req);
    launch(&app, session, "paths", paths_slot).await
}

async fn post_port_cancel(State(app): State<AppState>) -> impl IntoResponse {
    let session = app.ports().await;
    if let Some(s) = &session {
        s.cancel().await;
    }
    Json(status_of(session.as_ref()))
}

async fn post_path_cancel(State(app): State<AppState>) -> impl IntoResponse {
    let session = app.paths().await;
    if let Some(s) = &session {
        s.cancel().await;
    }
    Json(status_of(session.as_ref()))
}

async fn get_port_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(status_of(app.ports().await.as_ref()))
}

async fn get_path_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(status_of(app.paths().await.as_ref()))
}

async fn get_port_results(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.ports().await.map(|p| p.results()).unwrap_or_default())
}

async fn get_path_results(State(app): State<AppState>, Query(q): Query<SortQuery>) -> impl IntoResponse {
    let results = match (app.paths().await, q.sort) {
        (Some(p), Some(key)) => p.sorted_results(key, q.order),
        (Some(p), None) => p.results(),
        (None, _) => Vec::new(),
    };
    Json(results)
}

async fn get_port_export(State(app): State<AppState>) -> impl IntoResponse {
    Json(export(app.ports().await.as_ref()))
}

async fn get_path_export(State(app): State<AppState>) -> impl IntoResponse {
    Json(export(app.paths().await.as_ref()))
}
