//! HTTP handlers.

use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;

use crate::error::Error;

use super::SharedState;

/// Body of `GET /`.
pub const STATUS_MESSAGE: &str = "Thermal GAN is Running";

/// Multipart field the upload is expected in.
const FILE_FIELD: &str = "file";

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

/// GET / - Health check endpoint
pub async fn status() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: STATUS_MESSAGE,
    })
}

/// POST /generate - Translate an uploaded thermal image into a PNG
pub async fn generate(
    State(pipeline): State<SharedState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let mut multipart =
        multipart.map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text()))?;
    let upload = read_upload(&mut multipart).await?;
    tracing::info!(bytes = upload.len(), "Generating image");

    // The forward pass is CPU/accelerator bound, keep it off the async workers.
    let png = tokio::task::spawn_blocking(move || pipeline.generate(&upload))
        .await
        .map_err(|err| ApiError::internal(format!("generation task failed: {err}")))??;

    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

/// Take the `file` field, or else the first non-empty field.
///
/// Multipart failures keep axum's status, so an oversized body is a 413.
async fn read_upload(multipart: &mut Multipart) -> Result<Bytes, ApiError> {
    let mut fallback = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::new(err.status(), err.body_text()))?
    {
        let is_file_field = field.name() == Some(FILE_FIELD);
        let data = field
            .bytes()
            .await
            .map_err(|err| ApiError::new(err.status(), err.body_text()))?;

        if data.is_empty() {
            continue;
        }
        if is_file_field {
            return Ok(data);
        }
        fallback.get_or_insert(data);
    }

    fallback.ok_or_else(|| ApiError::bad_request("no file uploaded"))
}

/// Error response carrying a status code and a JSON message.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        if err.is_client_error() {
            tracing::warn!("Rejected request: {err}");
            Self::bad_request(err.to_string())
        } else {
            tracing::error!("Generation failed: {err}");
            Self::internal(err.to_string())
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}
