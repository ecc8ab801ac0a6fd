use axum::{
    Json,
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::artifact::LineageError;
use generation::OrchestratorError;
use services::services::{blob_store::BlobStoreError, navigator::NavigatorError};
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error, ts_rs::TS)]
#[ts(type = "string")]
pub enum ApiError {
    #[error(transparent)]
    Lineage(#[from] LineageError),
    #[error(transparent)]
    Navigator(#[from] NavigatorError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Blob(#[from] BlobStoreError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Multipart error: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
}

fn lineage_status(err: &LineageError) -> (StatusCode, &'static str) {
    match err {
        LineageError::NotFound(_) => (StatusCode::NOT_FOUND, "ArtifactNotFound"),
        LineageError::VersionConflict { .. } => (StatusCode::CONFLICT, "VersionConflict"),
        LineageError::BrokenChain { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "BrokenChain"),
        LineageError::Database(_) | LineageError::Serialization(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "LineageError")
        }
    }
}

fn blob_status(err: &BlobStoreError) -> (StatusCode, &'static str) {
    match err {
        BlobStoreError::NotFound(_) => (StatusCode::NOT_FOUND, "BlobNotFound"),
        BlobStoreError::InvalidLocator(_) => (StatusCode::BAD_REQUEST, "InvalidLocator"),
        BlobStoreError::ChecksumMismatch { .. } | BlobStoreError::Io(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "BlobStoreError")
        }
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Lineage(err) => lineage_status(err),
            ApiError::Navigator(err) => match err {
                NavigatorError::Lineage(inner) => lineage_status(inner),
                NavigatorError::Blob(inner) => blob_status(inner),
                NavigatorError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
                NavigatorError::StaleBatch(_) => (StatusCode::CONFLICT, "StaleBatch"),
                NavigatorError::NoArtifact
                | NavigatorError::CursorOutOfRange { .. }
                | NavigatorError::NotInChain(_)
                | NavigatorError::NothingToRegenerate(_)
                | NavigatorError::InvalidTransition { .. }
                | NavigatorError::ResultMissing(_)
                | NavigatorError::ProviderFailed { .. }
                | NavigatorError::UnsupportedContent { .. } => (StatusCode::BAD_REQUEST, "NavigatorError"),
            },
            ApiError::Orchestrator(_) => (StatusCode::BAD_REQUEST, "InvalidGenerationRequest"),
            ApiError::Blob(err) => blob_status(err),
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::Multipart(_) => (StatusCode::BAD_REQUEST, "MultipartError"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = self.status();
        if status_code.is_server_error() {
            tracing::error!(error_type, "{}", self);
        }

        let error_message = match &self {
            ApiError::Multipart(_) => {
                "Failed to upload file. Please ensure the file is valid and try again.".to_string()
            }
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) => msg.clone(),
            _ => format!("{}: {}", error_type, self),
        };
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
