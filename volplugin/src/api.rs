//! The Docker volume plugin protocol: JSON over HTTP POSTs, one route per verb.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::http::header::{CONNECTION, CONTENT_TYPE};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use common::Volume;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::volumes::{Volumes, display};

pub const PLUGIN_CONTENT_TYPE: &str = "application/vnd.docker.plugins.v1.2+json";

pub struct AppState {
    pub volumes: Arc<Volumes>,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/VolumeDriver.Create", post(create))
        .route("/VolumeDriver.Remove", post(remove))
        .route("/VolumeDriver.Mount", post(mount))
        .route("/VolumeDriver.Unmount", post(unmount))
        .route("/VolumeDriver.Path", post(path))
        .route("/VolumeDriver.Get", post(get))
        .route("/VolumeDriver.List", post(list))
        .route("/VolumeDriver.Capabilities", post(capabilities))
        .layer(middleware::from_fn(plugin_headers))
        .with_state(state)
}

/// Every response closes its connection; Docker opens one per request.
async fn plugin_headers(req: Request, next: Next) -> Response {
    debug!("{} {}", req.method(), req.uri());
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("close"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(PLUGIN_CONTENT_TYPE));
    resp
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeRequest {
    pub name: String,
    #[serde(default)]
    pub opts: Option<HashMap<String, String>>,
    #[serde(default, rename = "ID")]
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrResponse {
    #[serde(rename = "Err")]
    pub err: String,
}

impl ErrResponse {
    fn ok() -> Json<Self> {
        Json(Self { err: String::new() })
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MountpointResponse {
    pub mountpoint: String,
    pub err: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VolumeInfo {
    pub name: String,
    pub mountpoint: String,
    #[serde(default)]
    pub created_at: String,
}

impl VolumeInfo {
    fn new(volume: &Volume, mountpoint: Option<&std::path::Path>) -> Self {
        Self {
            name: volume.volume_name().to_string(),
            mountpoint: display(mountpoint),
            created_at: volume.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetResponse {
    pub volume: VolumeInfo,
    pub err: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListResponse {
    pub volumes: Vec<VolumeInfo>,
    pub err: String,
}

/// Docker sends vendor content types and sometimes empty bodies, so requests
/// are decoded by hand rather than through the `Json` extractor.
fn decode<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

async fn activate() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "Implements": ["VolumeDriver"] }))
}

async fn capabilities() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "Capabilities": { "Scope": "global" } }))
}

async fn create(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ErrResponse>, ApiError> {
    let req: VolumeRequest = decode(&body)?;
    let opts = req.opts.unwrap_or_default();
    state.volumes.create(&req.name, &opts).await?;
    Ok(ErrResponse::ok())
}

async fn remove(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ErrResponse>, ApiError> {
    let req: VolumeRequest = decode(&body)?;
    state.volumes.remove(&req.name).await?;
    Ok(ErrResponse::ok())
}

async fn mount(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<MountpointResponse>, ApiError> {
    let req: VolumeRequest = decode(&body)?;
    let mountpoint = state.volumes.mount(&req.name, &req.id).await?;
    Ok(Json(MountpointResponse {
        mountpoint: mountpoint.display().to_string(),
        err: String::new(),
    }))
}

async fn unmount(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ErrResponse>, ApiError> {
    let req: VolumeRequest = decode(&body)?;
    state.volumes.unmount(&req.name, &req.id).await?;
    Ok(ErrResponse::ok())
}

async fn path(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<MountpointResponse>, ApiError> {
    let req: VolumeRequest = decode(&body)?;
    let mountpoint = state.volumes.path(&req.name).await?;
    Ok(Json(MountpointResponse {
        mountpoint: display(mountpoint.as_deref()),
        err: String::new(),
    }))
}

async fn get(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<GetResponse>, ApiError> {
    let req: VolumeRequest = decode(&body)?;
    let (volume, mountpoint) = state.volumes.get(&req.name).await?;
    Ok(Json(GetResponse {
        volume: VolumeInfo::new(&volume, mountpoint.as_deref()),
        err: String::new(),
    }))
}

async fn list(State(state): State<Arc<AppState>>) -> Result<Json<ListResponse>, ApiError> {
    let volumes = state
        .volumes
        .list()
        .await?
        .iter()
        .map(|(v, mp)| VolumeInfo::new(v, mp.as_deref()))
        .collect();
    Ok(Json(ListResponse {
        volumes,
        err: String::new(),
    }))
}
