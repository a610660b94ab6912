use axum::{
    extract::{Extension, Path, State},
    Json,
};
use sauti_core::{BatchReceipt, BatchStatus, BatchSubmission};
use tracing::info;

use crate::api::request_context::RequestContext;
use crate::error::ApiError;
use crate::state::AppState;

pub async fn submit_batch(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<BatchSubmission>,
) -> Result<Json<BatchReceipt>, ApiError> {
    let batch = req.validate()?;
    let receipt = state.store.create_batch(batch).await?;
    info!(
        "Accepted batch {} with {} item(s) [{}]",
        receipt.batch_id, receipt.total_items, ctx.correlation_id
    );
    Ok(Json(receipt))
}

pub async fn get_batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchStatus>, ApiError> {
    let status = state
        .store
        .get_status(batch_id.clone())
        .await?
        .ok_or_else(|| sauti_core::Error::BatchNotFound(batch_id.clone()))?;
    Ok(Json(status))
}
