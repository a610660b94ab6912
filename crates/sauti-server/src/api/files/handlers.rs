use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::Response,
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_UPLOAD_NAME: &str = "upload.wav";

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_id: String,
}

pub async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed reading multipart field: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_UPLOAD_NAME.to_string());
        let bytes = field.bytes().await.map_err(|e| {
            ApiError::bad_request(format!("Failed reading multipart 'file' field: {e}"))
        })?;
        if bytes.is_empty() {
            return Err(ApiError::bad_request("Uploaded file is empty"));
        }

        let file_id = state.blobs.save(bytes.to_vec(), &filename).await?;
        info!("Stored upload '{filename}' as {file_id}");
        return Ok(Json(UploadResponse { file_id }));
    }

    Err(ApiError::bad_request("Missing multipart `file` field"))
}

pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Response, ApiError> {
    let blob = state
        .blobs
        .load(&file_id)
        .await?
        .ok_or_else(|| sauti_core::Error::BlobNotFound(file_id.clone()))?;

    let content_type = content_type_for(blob.location.extension());
    let filename = blob
        .location
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(file_id.as_str())
        .to_string();

    let mut response = Response::new(Body::from(blob.bytes));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    let disposition = format!("inline; filename=\"{}\"", filename.replace('"', ""));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "webm" => "audio/webm",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
