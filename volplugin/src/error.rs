use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::{NameError, VolumeName};
use libstorage::DriverError;
use libvolstore::StoreError;
use log::error;
use thiserror::Error;

use crate::api::ErrResponse;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("policy {0} does not exist")]
    PolicyNotFound(String),

    #[error("volume {0} already exists")]
    VolumeExists(VolumeName),

    #[error("volume {0} does not exist")]
    VolumeNotFound(String),

    #[error("volume {name} is mounted on host {host}")]
    VolumeMounted { name: VolumeName, host: String },

    #[error("invalid value {value:?} for option {key}")]
    InvalidOption { key: String, value: String },

    #[error("malformed request: {0}")]
    BadRequest(#[from] serde_json::Error),

    #[error(transparent)]
    Name(#[from] NameError),

    #[error("config store: {0}")]
    Store(#[from] StoreError),

    #[error("storage backend: {0}")]
    Driver(#[from] DriverError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::PolicyNotFound(_) | Self::VolumeNotFound(_) => StatusCode::NOT_FOUND,
            Self::VolumeExists(_) | Self::VolumeMounted { .. } => StatusCode::CONFLICT,
            Self::InvalidOption { .. } | Self::BadRequest(_) | Self::Name(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Store(_) | Self::Driver(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!("Request failed: {self}");
        let body = ErrResponse {
            err: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
