use crate::metrics::Metrics;
use area_locator::{Georeferencer, LocateError};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use dashmap::DashMap;
use render_pipeline::{
    output_prefix, CommandTemplate, CpuPool, JobId, RenderQueue, RenderRequest, RequesterId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn locate_error(e: LocateError) -> ApiError {
    let status = match &e {
        LocateError::UnknownCity(_) => StatusCode::NOT_FOUND,
        LocateError::InvalidPhoto(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!(error = %e, "Area selection failed");
    }
    api_error(status, e.to_string())
}

/// A geometry chosen for a city but not yet attached to a render job.
#[derive(Debug, Clone)]
pub struct PendingArea {
    pub city: String,
    pub geometry_path: PathBuf,
    /// False for the shared city footprint, which must outlive every job.
    pub delete_geometry: bool,
    pub annotated_png: Option<Vec<u8>>,
    /// Areas older than the configured TTL are discarded by the sweeper.
    pub created: Instant,
}

#[derive(Clone)]
pub struct AppState {
    pub georeferencer: Arc<Georeferencer>,
    pub pool: CpuPool,
    pub queue: RenderQueue,
    pub template: CommandTemplate,
    pub work_dir: PathBuf,
    pub areas: Arc<DashMap<Uuid, PendingArea>>,
    pub metrics: Arc<Metrics>,
    pub max_upload_bytes: usize,
}

pub fn router(state: AppState) -> Router {
    let metrics = state.metrics.router();
    let body_limit = DefaultBodyLimit::max(state.max_upload_bytes);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/catalog", get(catalog))
        .route("/queue", get(queue_status))
        .route("/cities/:city/area", post(locate_area))
        .route("/areas/:id/annotated.png", get(annotated_area))
        .route("/jobs", post(submit_job))
        .route("/jobs/:id", get(job_status))
        .layer(body_limit)
        .with_state(state)
        .merge(metrics)
        .layer(TraceLayer::new_for_http())
}

async fn healthz() -> Response {
    (StatusCode::OK, "ok").into_response()
}

#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    pub cities: Vec<&'static str>,
    pub colors: &'static [&'static str],
}

async fn catalog(State(state): State<AppState>) -> Json<CatalogResponse> {
    let catalog = state.georeferencer.catalog();
    Json(CatalogResponse {
        cities: catalog.cities().collect(),
        colors: catalog.color_schemes(),
    })
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub outstanding: usize,
}

async fn queue_status(State(state): State<AppState>) -> Json<QueueResponse> {
    Json(QueueResponse {
        outstanding: state.queue.len(),
    })
}

#[derive(Debug, Serialize)]
pub struct AreaResponse {
    pub area_id: Uuid,
    pub city: String,
    /// False when the photo could not be located and the full city is used.
    pub matched: bool,
    pub score: Option<f64>,
    pub scale: Option<f64>,
    pub pixel_rect: Option<[u32; 4]>,
    pub polygon: Option<Vec<[f64; 2]>>,
}

async fn locate_area(
    State(state): State<AppState>,
    Path(city): Path<String>,
    body: Bytes,
) -> Result<Json<AreaResponse>, ApiError> {
    let default_geometry = state
        .georeferencer
        .catalog()
        .geometry_path(&city)
        .map_err(locate_error)?;
    if body.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "Area photo is required"));
    }

    let georeferencer = state.georeferencer.clone();
    let query_city = city.clone();
    let outcome = state
        .pool
        .run(move || georeferencer.select_area(&query_city, &body))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "CPU pool failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    let area_id = Uuid::new_v4();
    let response = match outcome {
        Ok(selection) => {
            state.metrics.areas_located_total.inc();
            let m = selection.matched;
            let response = AreaResponse {
                area_id,
                city: city.clone(),
                matched: true,
                score: Some(m.score),
                scale: Some(m.scale),
                pixel_rect: Some([m.top_left.0, m.top_left.1, m.bottom_right.0, m.bottom_right.1]),
                polygon: selection.polygon.to_f64_pairs(),
            };
            state.areas.insert(
                area_id,
                PendingArea {
                    city,
                    geometry_path: selection.geometry_path,
                    delete_geometry: true,
                    annotated_png: Some(selection.annotated_png),
                    created: Instant::now(),
                },
            );
            response
        }
        Err(e) if e.is_recoverable() => {
            state.metrics.area_fallbacks_total.inc();
            tracing::info!(city = %city, "Area not found, using the full city footprint");
            state.areas.insert(
                area_id,
                PendingArea {
                    city: city.clone(),
                    geometry_path: default_geometry,
                    delete_geometry: false,
                    annotated_png: None,
                    created: Instant::now(),
                },
            );
            AreaResponse {
                area_id,
                city,
                matched: false,
                score: None,
                scale: None,
                pixel_rect: None,
                polygon: None,
            }
        }
        Err(e) => return Err(locate_error(e)),
    };
    Ok(Json(response))
}

async fn annotated_area(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.areas.get(&id).and_then(|a| a.annotated_png.clone()) {
        Some(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "No annotated map for this area").into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub requester: i64,
    pub city: String,
    pub color: String,
    /// From `POST /cities/:city/area`; the full city is rendered when absent.
    #[serde(default)]
    pub area_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct JobTicket {
    pub id: u64,
    pub position: usize,
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<(StatusCode, Json<JobTicket>), ApiError> {
    let catalog = state.georeferencer.catalog();
    if !catalog.is_color_scheme(&request.color) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Unknown color scheme '{}'", request.color),
        ));
    }
    let shapefile = catalog.shapefile_path(&request.city).map_err(locate_error)?;

    let area = match request.area_id {
        Some(id) => {
            let Some((_, area)) = state.areas.remove(&id) else {
                return Err(api_error(StatusCode::NOT_FOUND, format!("Unknown area '{id}'")));
            };
            if area.city != request.city {
                let message = format!("Area '{id}' belongs to {}, not {}", area.city, request.city);
                state.areas.insert(id, area);
                return Err(api_error(StatusCode::BAD_REQUEST, message));
            }
            area
        }
        None => PendingArea {
            city: request.city.clone(),
            geometry_path: catalog.geometry_path(&request.city).map_err(locate_error)?,
            delete_geometry: false,
            annotated_png: None,
            created: Instant::now(),
        },
    };

    let requester = RequesterId(request.requester);
    let job = state.template.job(RenderRequest {
        shapefile,
        geometry: area.geometry_path.clone(),
        color: request.color.clone(),
        prefix: output_prefix(&state.work_dir, requester, &request.city, Utc::now()),
        requester,
        caption: format!("{}, {}", request.city, request.color),
        delete_geometry: area.delete_geometry,
    });

    match state.queue.submit(job) {
        Ok(ticket) => Ok((
            StatusCode::ACCEPTED,
            Json(JobTicket {
                id: ticket.id.0,
                position: ticket.position,
            }),
        )),
        Err(e) => {
            discard(&area).await;
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobStatus {
    pub id: u64,
    pub state: &'static str,
}

async fn job_status(State(state): State<AppState>, Path(id): Path<u64>) -> Result<Json<JobStatus>, ApiError> {
    state
        .queue
        .state(JobId(id))
        .map(|s| Json(JobStatus { id, state: s.as_str() }))
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Unknown job {id}")))
}

async fn discard(area: &PendingArea) {
    if !area.delete_geometry {
        return;
    }
    if let Err(e) = tokio::fs::remove_file(&area.geometry_path).await {
        tracing::warn!(path = %area.geometry_path.display(), error = %e, "Failed to remove area geometry");
    }
}

/// Drops areas created more than `ttl` ago and removes their geometries.
pub async fn discard_expired_areas(areas: &DashMap<Uuid, PendingArea>, ttl: Duration) -> usize {
    let now = Instant::now();
    let expired = |area: &PendingArea| now.saturating_duration_since(area.created) >= ttl;
    let ids: Vec<Uuid> = areas
        .iter()
        .filter(|e| expired(e.value()))
        .map(|e| *e.key())
        .collect();

    let mut count = 0;
    for id in ids {
        // A job may have claimed the area since the scan.
        if let Some((_, area)) = areas.remove_if(&id, |_, area| expired(area)) {
            discard(&area).await;
            count += 1;
        }
    }
    count
}

/// Periodically expires unclaimed areas until shutdown.
pub fn spawn_area_sweeper(
    areas: Arc<DashMap<Uuid, PendingArea>>,
    ttl: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) -> JoinHandle<()> {
    let period = (ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    let count = discard_expired_areas(&areas, ttl).await;
                    if count > 0 {
                        tracing::info!(count, ttl_secs = ttl.as_secs(), "Expired unused areas");
                    }
                }
            }
        }
        tracing::debug!("Area sweeper stopped.");
    })
}

/// Removes geometries of areas that never made it into a job.
pub async fn discard_pending_areas(areas: &DashMap<Uuid, PendingArea>) {
    let pending: Vec<PendingArea> = areas.iter().map(|e| e.value().clone()).collect();
    areas.clear();
    for area in &pending {
        discard(area).await;
    }
    if !pending.is_empty() {
        tracing::info!(count = pending.len(), "Discarded unused areas");
    }
}
