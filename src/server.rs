//! HTTP surface
//!
//! JSON API consumed by the web UI and operators. Handlers never block the
//! dispatcher: runs, updates, and resolver passes happen on spawned tasks,
//! so a stuck download cannot stall `/api/status`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;

use crate::config::{
    load_config, load_config_value, validate_config, validate_schedule, write_config_atomic,
    Config, SchedulePatch,
};
use crate::db::{HistoryQuery, HistorySort};
use crate::models::DeliveryMode;
use crate::paths::{ensure_dir, resolve_config_path};
use crate::run::{RunManager, RunOptions};
use crate::scheduler::Scheduler;
use crate::search::{RequestStatus, SearchRequestPayload, SearchResolutionService};
use crate::status::StopEvent;
use crate::tools::{runtime_info, ToolUpdater};

pub const STATUS_SCHEMA_VERSION: u32 = 1;
pub const METRICS_SCHEMA_VERSION: u32 = 1;
pub const SCHEDULE_SCHEMA_VERSION: u32 = 1;

pub const ENV_HOST: &str = "MEDIAVAULT_HOST";
pub const ENV_PORT: &str = "MEDIAVAULT_PORT";
pub const ENV_BASIC_AUTH_USER: &str = "MEDIAVAULT_BASIC_AUTH_USER";
pub const ENV_BASIC_AUTH_PASS: &str = "MEDIAVAULT_BASIC_AUTH_PASS";
pub const ENV_TRUST_PROXY: &str = "MEDIAVAULT_TRUST_PROXY";

/// Shared server context.
pub struct ServerCtx {
    pub manager: Arc<RunManager>,
    pub scheduler: Arc<Scheduler>,
    pub search: Arc<SearchResolutionService>,
    pub updater: ToolUpdater,
    pub stop: StopEvent,
    config_path: Mutex<PathBuf>,
    log_path: PathBuf,
    basic_auth: Option<(String, String)>,
}

impl ServerCtx {
    pub fn new(
        manager: Arc<RunManager>,
        scheduler: Arc<Scheduler>,
        search: Arc<SearchResolutionService>,
        updater: ToolUpdater,
        stop: StopEvent,
        config_path: PathBuf,
        log_path: PathBuf,
    ) -> Arc<Self> {
        let basic_auth = match (
            std::env::var(ENV_BASIC_AUTH_USER).ok().filter(|v| !v.is_empty()),
            std::env::var(ENV_BASIC_AUTH_PASS).ok().filter(|v| !v.is_empty()),
        ) {
            (Some(user), Some(pass)) => Some((user, pass)),
            _ => None,
        };
        Arc::new(Self {
            manager,
            scheduler,
            search,
            updater,
            stop,
            config_path: Mutex::new(config_path),
            log_path,
            basic_auth,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_path.lock().expect("config path lock").clone()
    }

    pub fn set_config_path(&self, path: PathBuf) {
        *self.config_path.lock().expect("config path lock") = path;
    }

    /// Load and validate the active config, mapping failures to an API error.
    pub fn load_valid_config(&self) -> Result<Config, ApiFailure> {
        let path = self.config_path();
        if !path.exists() {
            return Err(ApiFailure::new(
                StatusCode::NOT_FOUND,
                format!("Config not found: {}", path.display()),
            ));
        }
        let config = load_config(&path)
            .map_err(|e| ApiFailure::new(StatusCode::BAD_REQUEST, format!("{e:#}")))?;
        let errors = validate_config(&config);
        if !errors.is_empty() {
            return Err(ApiFailure::errors(errors));
        }
        Ok(config)
    }
}

/// Uniform JSON error shape.
#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    body: Value,
}

impl ApiFailure {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({"detail": detail.into()}),
        }
    }

    fn errors(errors: Vec<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({"detail": {"errors": errors}}),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        log::error!("Request failed: {err:#}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Constant-time equality; both operands are hashed-length-agnostic byte
/// comparisons that never short-circuit.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = (a.len() ^ b.len()) as u8;
    let longest = a.len().max(b.len());
    for i in 0..longest {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

fn check_basic_auth(header_value: Option<&str>, user: &str, pass: &str) -> bool {
    let Some(value) = header_value else {
        return false;
    };
    let Some(token) = value.strip_prefix("Basic ") else {
        return false;
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(token.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((got_user, got_pass)) = decoded.split_once(':') else {
        return false;
    };
    constant_time_eq(got_user.as_bytes(), user.as_bytes())
        & constant_time_eq(got_pass.as_bytes(), pass.as_bytes())
}

async fn basic_auth_middleware(
    State(ctx): State<Arc<ServerCtx>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let Some((user, pass)) = &ctx.basic_auth else {
        return next.run(request).await;
    };
    if request.method() == axum::http::Method::OPTIONS {
        return next.run(request).await;
    }
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if check_basic_auth(authorization, user, pass) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic")],
            "Unauthorized",
        )
            .into_response()
    }
}

pub fn router(ctx: Arc<ServerCtx>) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/schedule", get(api_get_schedule).post(api_update_schedule))
        .route("/api/metrics", get(api_metrics))
        .route("/api/version", get(api_version))
        .route("/api/run", post(api_run))
        .route("/api/logs", get(api_logs))
        .route("/api/config", get(api_get_config).put(api_put_config))
        .route("/api/config/path", get(api_get_config_path).put(api_put_config_path))
        .route("/api/history", get(api_history))
        .route("/api/files", get(api_files))
        .route("/api/files/:id/download", get(api_file_download))
        .route("/api/delivery/:id", get(api_delivery_pickup))
        .route("/api/cleanup", post(api_cleanup))
        .route("/api/browse", get(api_browse))
        .route("/api/yt-dlp/update", post(api_ytdlp_update))
        .route("/api/search", post(api_search_create).get(api_search_list))
        .route("/api/search/:id", get(api_search_get))
        .route("/api/search/:id/cancel", post(api_search_cancel))
        .route("/api/search/:id/items", get(api_search_items))
        .route("/api/search/items/:item_id/candidates", get(api_search_candidates))
        .layer(middleware::from_fn_with_state(Arc::clone(&ctx), basic_auth_middleware))
        .with_state(ctx)
}

/// Bind address from the environment, defaulting to localhost:8080.
pub fn bind_addr() -> SocketAddr {
    let host = std::env::var(ENV_HOST).unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var(ENV_PORT)
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    format!("{host}:{port}")
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], port)))
}

pub async fn serve(ctx: Arc<ServerCtx>) -> Result<()> {
    if std::env::var(ENV_TRUST_PROXY)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
    {
        log::info!("Proxy-header trust enabled");
    }
    let addr = bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    log::info!("HTTP API listening on {addr}");

    let stop = ctx.stop.clone();
    axum::serve(listener, router(ctx))
        .with_graceful_shutdown(async move { stop.wait().await })
        .await
        .context("http server")?;
    Ok(())
}

// --- status / schedule -------------------------------------------------

fn file_id_for(path: &str, library_root: &Path) -> Option<String> {
    let full = Path::new(path);
    let rel = full.strip_prefix(library_root).ok()?;
    Some(URL_SAFE_NO_PAD.encode(rel.to_string_lossy().as_bytes()))
}

async fn api_status(State(ctx): State<Arc<ServerCtx>>) -> Json<Value> {
    let run = ctx.manager.snapshot();
    let status = ctx.manager.status.snapshot();
    let last_completed_file_id = status
        .last_completed
        .path
        .as_deref()
        .and_then(|p| file_id_for(p, &ctx.manager.roots.downloads));

    Json(json!({
        "schema_version": STATUS_SCHEMA_VERSION,
        "server_time": Utc::now().to_rfc3339(),
        "state": run.state,
        "running": run.running,
        "run_id": run.run_id,
        "started_at": run.started_at,
        "finished_at": run.finished_at,
        "last_error": run.last_error,
        "status": status,
        "last_completed_file_id": last_completed_file_id,
    }))
}

fn schedule_response(ctx: &ServerCtx, schedule: &crate::config::ScheduleConfig) -> Value {
    let (last_run, next_run) = ctx.scheduler.state();
    json!({
        "schema_version": SCHEDULE_SCHEMA_VERSION,
        "server_time": Utc::now().to_rfc3339(),
        "schedule": schedule,
        "enabled": schedule.enabled,
        "last_run": last_run,
        "next_run": next_run,
    })
}

async fn api_get_schedule(State(ctx): State<Arc<ServerCtx>>) -> Result<Json<Value>, ApiFailure> {
    let schedule = ctx
        .load_valid_config()
        .map(|c| c.schedule_or_default())
        .unwrap_or_default();
    Ok(Json(schedule_response(&ctx, &schedule)))
}

async fn api_update_schedule(
    State(ctx): State<Arc<ServerCtx>>,
    Json(patch): Json<SchedulePatch>,
) -> Result<Json<Value>, ApiFailure> {
    let path = ctx.config_path();
    let mut document = if path.exists() {
        load_config_value(&path).map_err(ApiFailure::internal)?
    } else {
        json!({})
    };

    if !document.is_object() {
        return Err(ApiFailure::new(
            StatusCode::BAD_REQUEST,
            "config must be a JSON object",
        ));
    }
    let current: Config = serde_json::from_value(document.clone())
        .map_err(|e| ApiFailure::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let merged = current.schedule_or_default().merged_with(&patch);
    let errors = validate_schedule(&merged);
    if !errors.is_empty() {
        return Err(ApiFailure::errors(errors));
    }

    document["schedule"] =
        serde_json::to_value(&merged).map_err(|e| ApiFailure::internal(e.into()))?;
    write_config_atomic(&path, &document).map_err(ApiFailure::internal)?;

    apply_schedule(&ctx, &merged);
    Ok(Json(schedule_response(&ctx, &merged)))
}

/// Reapply the interval job with a tick handler that starts a scheduled run
/// when none is active.
pub fn apply_schedule(ctx: &Arc<ServerCtx>, schedule: &crate::config::ScheduleConfig) {
    let tick_ctx = Arc::clone(ctx);
    ctx.scheduler.apply(
        schedule,
        Arc::new(move || {
            let ctx = Arc::clone(&tick_ctx);
            Box::pin(async move { scheduled_tick(ctx).await })
        }),
    );
}

/// The run_on_startup dispatch: one scheduled-style tick at process start.
pub async fn startup_kick(ctx: Arc<ServerCtx>) {
    if scheduled_tick(Arc::clone(&ctx)).await {
        ctx.scheduler.record_last_run(Utc::now());
    }
}

/// One scheduler fire: skip when a run is active, log-and-skip on config
/// problems, otherwise start a run tagged "scheduled".
async fn scheduled_tick(ctx: Arc<ServerCtx>) -> bool {
    if ctx.manager.is_running() {
        log::info!("Scheduled run skipped; run already active");
        return false;
    }
    let config = match ctx.load_valid_config() {
        Ok(config) => config,
        Err(_) => {
            log::error!("Schedule skipped: config missing or invalid");
            return false;
        }
    };
    ctx.manager.try_start_run(
        config,
        RunOptions {
            run_source: "scheduled",
            ..Default::default()
        },
    )
}

// --- metrics / version -------------------------------------------------

#[cfg(unix)]
fn disk_usage(path: &Path) -> Value {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return json!({"total_bytes": null, "free_bytes": null, "used_bytes": null, "free_percent": null});
    };
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return json!({"total_bytes": null, "free_bytes": null, "used_bytes": null, "free_percent": null});
    }
    let total = stat.f_frsize as u64 * stat.f_blocks as u64;
    let free = stat.f_frsize as u64 * stat.f_bavail as u64;
    let used = total.saturating_sub(free);
    let free_percent = if total > 0 {
        Some((free as f64 / total as f64) * 100.0)
    } else {
        None
    };
    json!({
        "total_bytes": total,
        "free_bytes": free,
        "used_bytes": used,
        "free_percent": free_percent.map(|p| (p * 10.0).round() / 10.0),
    })
}

#[cfg(not(unix))]
fn disk_usage(_path: &Path) -> Value {
    json!({"total_bytes": null, "free_bytes": null, "used_bytes": null, "free_percent": null})
}

fn walk_library(base: &Path) -> Vec<(PathBuf, std::fs::Metadata)> {
    let mut results = Vec::new();
    let mut stack = vec![base.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            match entry.metadata() {
                Ok(meta) if meta.is_dir() => stack.push(path),
                Ok(meta) if meta.is_file() => results.push((path, meta)),
                _ => {}
            }
        }
    }
    results
}

async fn api_metrics(State(ctx): State<Arc<ServerCtx>>) -> Json<Value> {
    let library = ctx.manager.roots.downloads.clone();
    let (count, bytes, disk) = tokio::task::spawn_blocking(move || {
        let files = walk_library(&library);
        let bytes: u64 = files.iter().map(|(_, m)| m.len()).sum();
        (files.len(), bytes, disk_usage(&library))
    })
    .await
    .unwrap_or((0, 0, json!({})));

    Json(json!({
        "schema_version": METRICS_SCHEMA_VERSION,
        "server_time": Utc::now().to_rfc3339(),
        "library": {"file_count": count, "total_bytes": bytes},
        "disk": disk,
    }))
}

async fn api_version(State(ctx): State<Arc<ServerCtx>>) -> Json<Value> {
    let info = runtime_info(&ctx.manager.paths.tools_dir).await;
    Json(serde_json::to_value(info).unwrap_or_else(|_| json!({})))
}

// --- runs ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RunRequest {
    single_url: Option<String>,
    destination: Option<String>,
    final_format_override: Option<String>,
    js_runtime: Option<String>,
    delivery_mode: Option<String>,
}

async fn api_run(
    State(ctx): State<Arc<ServerCtx>>,
    Json(request): Json<RunRequest>,
) -> Result<Json<Value>, ApiFailure> {
    let config = ctx.load_valid_config()?;
    let delivery_mode = request
        .delivery_mode
        .as_deref()
        .and_then(DeliveryMode::parse)
        .unwrap_or_default();

    let started = ctx.manager.try_start_run(
        config,
        RunOptions {
            single_url: request.single_url.filter(|u| !u.is_empty()),
            destination: request.destination,
            final_format_override: request.final_format_override,
            js_runtime_override: request.js_runtime,
            delivery_mode,
            run_source: "api",
        },
    );
    if !started {
        return Err(ApiFailure::new(
            StatusCode::CONFLICT,
            "A run is already active",
        ));
    }
    Ok(Json(json!({"started": true})))
}

// --- logs ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

fn tail_lines(path: &Path, lines: usize, max_bytes: u64) -> String {
    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    use std::io::{Read, Seek, SeekFrom};
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    let block = size.min(max_bytes);
    if block == 0 {
        return String::new();
    }
    if file.seek(SeekFrom::End(-(block as i64))).is_err() {
        return String::new();
    }
    let mut buf = Vec::with_capacity(block as usize);
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    let text = String::from_utf8_lossy(&buf);
    let collected: Vec<&str> = text.lines().collect();
    let start = collected.len().saturating_sub(lines);
    collected[start..].join("\n")
}

async fn api_logs(
    State(ctx): State<Arc<ServerCtx>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let lines = query.lines.unwrap_or(200).clamp(1, 5000);
    let path = ctx.log_path.clone();
    let body = tokio::task::spawn_blocking(move || tail_lines(&path, lines, 1_000_000))
        .await
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

// --- config -------------------------------------------------------------

async fn api_get_config(State(ctx): State<Arc<ServerCtx>>) -> Result<Json<Value>, ApiFailure> {
    let path = ctx.config_path();
    if !path.exists() {
        return Err(ApiFailure::new(
            StatusCode::NOT_FOUND,
            format!("Config not found: {}", path.display()),
        ));
    }
    load_config_value(&path)
        .map(Json)
        .map_err(|e| ApiFailure::new(StatusCode::BAD_REQUEST, format!("{e:#}")))
}

async fn api_put_config(
    State(ctx): State<Arc<ServerCtx>>,
    Json(document): Json<Value>,
) -> Result<Json<Value>, ApiFailure> {
    let config: Config = serde_json::from_value(document.clone())
        .map_err(|e| ApiFailure::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let errors = validate_config(&config);
    if !errors.is_empty() {
        return Err(ApiFailure::errors(errors));
    }

    write_config_atomic(&ctx.config_path(), &document).map_err(ApiFailure::internal)?;
    apply_schedule(&ctx, &config.schedule_or_default());
    Ok(Json(json!({"saved": true})))
}

#[derive(Debug, Deserialize)]
struct ConfigPathRequest {
    path: String,
}

async fn api_get_config_path(State(ctx): State<Arc<ServerCtx>>) -> Json<Value> {
    Json(json!({"path": ctx.config_path().to_string_lossy()}))
}

async fn api_put_config_path(
    State(ctx): State<Arc<ServerCtx>>,
    Json(request): Json<ConfigPathRequest>,
) -> Result<Json<Value>, ApiFailure> {
    let resolved = resolve_config_path(Some(&request.path), &ctx.manager.roots.config)
        .map_err(|e| ApiFailure::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    ctx.set_config_path(resolved.clone());
    if let Ok(config) = ctx.load_valid_config() {
        apply_schedule(&ctx, &config.schedule_or_default());
    }
    Ok(Json(json!({"path": resolved.to_string_lossy()})))
}

// --- history / files ----------------------------------------------------

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
    search: Option<String>,
    playlist_id: Option<String>,
    date_from: Option<String>,
    date_to: Option<String>,
    sort_by: Option<String>,
    sort_dir: Option<String>,
}

fn normalize_date(value: Option<String>, end_of_day: bool) -> Option<String> {
    let value = value?.trim().to_string();
    if value.is_empty() {
        return None;
    }
    if value.len() == 10 && value.as_bytes()[4] == b'-' && value.as_bytes()[7] == b'-' {
        let suffix = if end_of_day { "T23:59:59" } else { "T00:00:00" };
        return Some(format!("{value}{suffix}"));
    }
    Some(value)
}

async fn api_history(
    State(ctx): State<Arc<ServerCtx>>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, ApiFailure> {
    let query = HistoryQuery {
        limit: Some(params.limit.unwrap_or(100).clamp(1, 1000)),
        search: params.search,
        playlist_id: params.playlist_id,
        date_from: normalize_date(params.date_from, false),
        date_to: normalize_date(params.date_to, true),
        sort_by: params
            .sort_by
            .as_deref()
            .map(HistorySort::parse)
            .unwrap_or_default(),
        descending: params.sort_dir.as_deref().map_or(true, |d| d != "asc"),
    };

    let history = ctx.manager.history.clone();
    let rows = tokio::task::spawn_blocking(move || history.query_history(&query))
        .await
        .map_err(|e| ApiFailure::internal(e.into()))?
        .map_err(ApiFailure::internal)?;

    let library_root = ctx.manager.roots.downloads.clone();
    let items: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            let file_id = file_id_for(&row.filepath, &library_root);
            json!({
                "item_id": row.item_id,
                "playlist_id": row.playlist_id,
                "downloaded_at": row.downloaded_at,
                "filepath": row.filepath,
                "file_id": file_id,
            })
        })
        .collect();
    Ok(Json(json!({"items": items})))
}

async fn api_files(State(ctx): State<Arc<ServerCtx>>) -> Json<Value> {
    let library = ctx.manager.roots.downloads.clone();
    let files = tokio::task::spawn_blocking(move || {
        let mut out: Vec<Value> = walk_library(&library)
            .into_iter()
            .map(|(path, meta)| {
                let rel = path
                    .strip_prefix(&library)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                let modified = meta
                    .modified()
                    .ok()
                    .map(chrono::DateTime::<Utc>::from)
                    .map(|t| t.to_rfc3339());
                json!({
                    "id": URL_SAFE_NO_PAD.encode(rel.as_bytes()),
                    "name": path.file_name().map(|n| n.to_string_lossy().to_string()),
                    "relative_path": rel,
                    "size_bytes": meta.len(),
                    "modified_at": modified,
                })
            })
            .collect();
        out.sort_by(|a, b| {
            b["modified_at"]
                .as_str()
                .unwrap_or("")
                .cmp(a["modified_at"].as_str().unwrap_or(""))
        });
        out
    })
    .await
    .unwrap_or_default();
    Json(json!({"files": files}))
}

fn decode_file_id(id: &str) -> Option<String> {
    let raw = URL_SAFE_NO_PAD.decode(id.as_bytes()).ok()?;
    String::from_utf8(raw).ok()
}

fn safe_attachment_name(name: &str) -> String {
    let cleaned: String = name
        .replace('"', "'")
        .replace(['\n', '\r'], " ")
        .trim()
        .to_string();
    if cleaned.is_empty() {
        "download".to_string()
    } else {
        cleaned
    }
}

async fn stream_file(path: &Path, filename: &str) -> Result<Response, ApiFailure> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|_| ApiFailure::new(StatusCode::NOT_FOUND, "File not found"))?;
    let size = file.metadata().await.ok().map(|m| m.len());
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        "application/octet-stream".parse().unwrap(),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", safe_attachment_name(filename))
            .parse()
            .unwrap(),
    );
    if let Some(size) = size {
        if let Ok(value) = size.to_string().parse() {
            headers.insert(header::CONTENT_LENGTH, value);
        }
    }
    Ok(response)
}

async fn api_file_download(
    State(ctx): State<Arc<ServerCtx>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Response, ApiFailure> {
    let rel = decode_file_id(&id)
        .ok_or_else(|| ApiFailure::new(StatusCode::BAD_REQUEST, "Invalid file id"))?;
    let library = &ctx.manager.roots.downloads;
    let full = crate::paths::resolve_dir(Some(&rel), library)
        .map_err(|_| ApiFailure::new(StatusCode::FORBIDDEN, "Path not allowed"))?;
    let name = full
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    stream_file(&full, &name).await
}

async fn api_delivery_pickup(
    State(ctx): State<Arc<ServerCtx>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Response, ApiFailure> {
    let handle = ctx
        .manager
        .delivery
        .claim(&id)
        .ok_or_else(|| ApiFailure::new(StatusCode::NOT_FOUND, "Delivery not available"))?;

    let file = tokio::fs::File::open(&handle.path)
        .await
        .map_err(|_| ApiFailure::new(StatusCode::NOT_FOUND, "File not found"))?;
    let size = file.metadata().await.ok().map(|m| m.len());

    // Mark delivered (and delete the file) once the body is fully streamed.
    let registry = ctx.manager.delivery.clone();
    let handle_id = handle.id.clone();
    let stream = ReaderStream::new(file).chain(futures::stream::once(async move {
        registry.complete(&handle_id);
        Ok(bytes_empty())
    }));
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        "application/octet-stream".parse().unwrap(),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        format!(
            "attachment; filename=\"{}\"",
            safe_attachment_name(&handle.filename)
        )
        .parse()
        .unwrap(),
    );
    if let Some(size) = size {
        if let Ok(value) = size.to_string().parse() {
            headers.insert(header::CONTENT_LENGTH, value);
        }
    }
    Ok(response)
}

fn bytes_empty() -> axum::body::Bytes {
    axum::body::Bytes::new()
}

// --- cleanup / browse ---------------------------------------------------

fn cleanup_dir(path: &Path) -> (u64, u64) {
    let mut files = 0u64;
    let mut bytes = 0u64;
    for (file, meta) in walk_library(path) {
        bytes += meta.len();
        if std::fs::remove_file(&file).is_ok() {
            files += 1;
        }
    }
    // Sweep now-empty subdirectories.
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    stack.push(entry.path());
                    dirs.push(entry.path());
                }
            }
        }
    }
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let _ = std::fs::remove_dir(dir);
    }
    let _ = ensure_dir(path);
    (files, bytes)
}

async fn api_cleanup(State(ctx): State<Arc<ServerCtx>>) -> Json<Value> {
    let temp = ctx.manager.paths.temp_downloads_dir.clone();
    let scratch = ctx.manager.paths.ytdlp_temp_dir.clone();
    let (files, bytes) = tokio::task::spawn_blocking(move || {
        let (f1, b1) = cleanup_dir(&temp);
        let (f2, b2) = cleanup_dir(&scratch);
        (f1 + f2, b1 + b2)
    })
    .await
    .unwrap_or((0, 0));
    Json(json!({"deleted_files": files, "deleted_bytes": bytes}))
}

#[derive(Debug, Deserialize)]
struct BrowseParams {
    root: Option<String>,
    path: Option<String>,
    mode: Option<String>,
    ext: Option<String>,
    limit: Option<usize>,
}

async fn api_browse(
    State(ctx): State<Arc<ServerCtx>>,
    Query(params): Query<BrowseParams>,
) -> Result<Json<Value>, ApiFailure> {
    let roots = &ctx.manager.roots;
    let base = match params.root.as_deref().unwrap_or("downloads") {
        "downloads" => roots.downloads.clone(),
        "config" => roots.config.clone(),
        "tokens" => roots.tokens.clone(),
        other => {
            return Err(ApiFailure::new(
                StatusCode::BAD_REQUEST,
                format!("unknown root '{other}'"),
            ))
        }
    };

    let rel = params.path.unwrap_or_default();
    if Path::new(&rel).is_absolute() {
        return Err(ApiFailure::new(StatusCode::BAD_REQUEST, "path must be relative"));
    }
    let directory = crate::paths::resolve_dir(Some(&rel), &base)
        .map_err(|_| ApiFailure::new(StatusCode::FORBIDDEN, "path not allowed"))?;

    let dirs_only = params.mode.as_deref() == Some("dir");
    let ext = params.ext.map(|e| e.to_lowercase());
    let limit = params.limit.unwrap_or(500).clamp(1, 2000);

    let entries = tokio::task::spawn_blocking(move || {
        let mut out: Vec<Value> = Vec::new();
        let Ok(read) = std::fs::read_dir(&directory) else {
            return out;
        };
        for entry in read.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.path().is_dir();
            if dirs_only && !is_dir {
                continue;
            }
            if !is_dir {
                if let Some(ext) = &ext {
                    if !name.to_lowercase().ends_with(ext) {
                        continue;
                    }
                }
            }
            let rel_entry = entry
                .path()
                .strip_prefix(&base)
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            out.push(json!({
                "name": name,
                "path": rel_entry,
                "type": if is_dir { "dir" } else { "file" },
            }));
            if out.len() >= limit {
                break;
            }
        }
        out.sort_by(|a, b| {
            let a_dir = a["type"] == "dir";
            let b_dir = b["type"] == "dir";
            b_dir
                .cmp(&a_dir)
                .then_with(|| {
                    a["name"]
                        .as_str()
                        .unwrap_or("")
                        .to_lowercase()
                        .cmp(&b["name"].as_str().unwrap_or("").to_lowercase())
                })
        });
        out
    })
    .await
    .unwrap_or_default();

    Ok(Json(json!({"entries": entries})))
}

// --- toolkit update -----------------------------------------------------

async fn api_ytdlp_update(State(ctx): State<Arc<ServerCtx>>) -> Result<Json<Value>, ApiFailure> {
    if !ctx.updater.try_start() {
        return Err(ApiFailure::new(
            StatusCode::CONFLICT,
            "yt-dlp update already running",
        ));
    }
    let updater = ctx.updater.clone();
    tokio::spawn(async move {
        match updater.update_ytdlp().await {
            Ok(version) => log::info!("yt-dlp update finished: {version}"),
            Err(err) => log::error!("yt-dlp update failed: {err:#}"),
        }
        updater.finish();
    });
    Ok(Json(json!({"started": true})))
}

// --- search -------------------------------------------------------------

async fn api_search_create(
    State(ctx): State<Arc<ServerCtx>>,
    Json(payload): Json<SearchRequestPayload>,
) -> Result<Json<Value>, ApiFailure> {
    let search = Arc::clone(&ctx.search);
    let request_id = tokio::task::spawn_blocking(move || search.create_request(&payload))
        .await
        .map_err(|e| ApiFailure::internal(e.into()))?
        .map_err(|e| ApiFailure::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(json!({"request_id": request_id, "status": "queued"})))
}

#[derive(Debug, Deserialize)]
struct SearchListParams {
    status: Option<String>,
    limit: Option<u32>,
}

async fn api_search_list(
    State(ctx): State<Arc<ServerCtx>>,
    Query(params): Query<SearchListParams>,
) -> Result<Json<Value>, ApiFailure> {
    let status = match params.status.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            RequestStatus::parse(raw)
                .ok_or_else(|| ApiFailure::new(StatusCode::BAD_REQUEST, "invalid status"))?,
        ),
    };
    let limit = params.limit.unwrap_or(50);
    let search = Arc::clone(&ctx.search);
    let rows = tokio::task::spawn_blocking(move || search.list_requests(status, limit))
        .await
        .map_err(|e| ApiFailure::internal(e.into()))?
        .map_err(ApiFailure::internal)?;
    Ok(Json(json!({"requests": rows})))
}

async fn api_search_get(
    State(ctx): State<Arc<ServerCtx>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, ApiFailure> {
    let search = Arc::clone(&ctx.search);
    let found = tokio::task::spawn_blocking(move || search.get_request(&id))
        .await
        .map_err(|e| ApiFailure::internal(e.into()))?
        .map_err(ApiFailure::internal)?;
    let Some((request, summary)) = found else {
        return Err(ApiFailure::new(StatusCode::NOT_FOUND, "request not found"));
    };
    let mut value = serde_json::to_value(&request).map_err(|e| ApiFailure::internal(e.into()))?;
    value["summary"] = serde_json::to_value(summary.into_iter().collect::<HashMap<_, _>>())
        .unwrap_or(json!({}));
    Ok(Json(value))
}

async fn api_search_cancel(
    State(ctx): State<Arc<ServerCtx>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, ApiFailure> {
    let search = Arc::clone(&ctx.search);
    let canceled = tokio::task::spawn_blocking(move || search.cancel_request(&id))
        .await
        .map_err(|e| ApiFailure::internal(e.into()))?
        .map_err(ApiFailure::internal)?;
    if !canceled {
        return Err(ApiFailure::new(
            StatusCode::CONFLICT,
            "request already finished",
        ));
    }
    Ok(Json(json!({"canceled": true})))
}

async fn api_search_items(
    State(ctx): State<Arc<ServerCtx>>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<Value>, ApiFailure> {
    let search = Arc::clone(&ctx.search);
    let items = tokio::task::spawn_blocking(move || search.list_items(&id))
        .await
        .map_err(|e| ApiFailure::internal(e.into()))?
        .map_err(ApiFailure::internal)?;
    Ok(Json(json!({"items": items})))
}

async fn api_search_candidates(
    State(ctx): State<Arc<ServerCtx>>,
    UrlPath(item_id): UrlPath<String>,
) -> Result<Json<Value>, ApiFailure> {
    let search = Arc::clone(&ctx.search);
    let candidates = tokio::task::spawn_blocking(move || search.list_candidates(&item_id))
        .await
        .map_err(|e| ApiFailure::internal(e.into()))?
        .map_err(ApiFailure::internal)?;
    Ok(Json(json!({"candidates": candidates})))
}

/// Background resolver loop: poll for queued requests every couple of
/// seconds, running each pass off the async dispatcher.
pub fn spawn_resolver_loop(ctx: Arc<ServerCtx>) {
    tokio::spawn(async move {
        loop {
            if ctx.stop.is_set() {
                break;
            }
            let config = ctx.load_valid_config().unwrap_or_default();
            let search = Arc::clone(&ctx.search);
            let processed = tokio::task::spawn_blocking(move || search.run_resolution_once(&config))
                .await
                .ok()
                .and_then(|r| r.ok())
                .flatten();
            if processed.is_none() {
                tokio::select! {
                    _ = ctx.stop.wait() => break,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {}
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secres"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"", b"x"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_check_basic_auth() {
        use base64::engine::general_purpose::STANDARD;
        let token = STANDARD.encode("alice:hunter2");
        let header = format!("Basic {token}");
        assert!(check_basic_auth(Some(&header), "alice", "hunter2"));
        assert!(!check_basic_auth(Some(&header), "alice", "other"));
        assert!(!check_basic_auth(Some("Bearer zzz"), "alice", "hunter2"));
        assert!(!check_basic_auth(None, "alice", "hunter2"));
        assert!(!check_basic_auth(Some("Basic !!!"), "alice", "hunter2"));
    }

    #[test]
    fn test_file_id_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let file = root.join("Artist").join("song.webm");
        let id = file_id_for(file.to_str().unwrap(), root).unwrap();
        assert_eq!(decode_file_id(&id).unwrap(), "Artist/song.webm");
        // A path outside the library yields no id.
        assert!(file_id_for("/elsewhere/song.webm", root).is_none());
    }

    #[test]
    fn test_normalize_date() {
        assert_eq!(
            normalize_date(Some("2026-01-02".to_string()), false).as_deref(),
            Some("2026-01-02T00:00:00")
        );
        assert_eq!(
            normalize_date(Some("2026-01-02".to_string()), true).as_deref(),
            Some("2026-01-02T23:59:59")
        );
        assert_eq!(normalize_date(Some("  ".to_string()), false), None);
        assert_eq!(
            normalize_date(Some("2026-01-02T10:00:00".to_string()), false).as_deref(),
            Some("2026-01-02T10:00:00")
        );
    }

    #[test]
    fn test_tail_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log.txt");
        let content: Vec<String> = (0..100).map(|i| format!("line {i}")).collect();
        std::fs::write(&path, content.join("\n")).unwrap();

        let tail = tail_lines(&path, 3, 1_000_000);
        assert_eq!(tail, "line 97\nline 98\nline 99");
        assert_eq!(tail_lines(&path, 1000, 1_000_000).lines().count(), 100);
        assert_eq!(tail_lines(Path::new("/nonexistent"), 10, 1_000_000), "");
    }

    #[test]
    fn test_safe_attachment_name() {
        assert_eq!(safe_attachment_name("a\"b\nc"), "a'b c");
        assert_eq!(safe_attachment_name("  "), "download");
    }
}
