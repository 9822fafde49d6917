use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::{info, instrument};

use super::{parse_body, parse_id};
use crate::errors::ApiError;
use crate::jsonapi::{image_resource, CreateImageAttributes, Document, RequestDocument};
use crate::AppState;

#[instrument(skip_all)]
pub async fn create(State(state): State<AppState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let request: RequestDocument<CreateImageAttributes> = parse_body(&body)?;
    let attributes = request.data.attributes;
    let image = state
        .engine
        .images
        .create(attributes.backed_up_at, attributes.anonymisation_script)
        .await?;
    info!(image_id = image.id, "image registered");
    Ok((StatusCode::CREATED, Json(Document::new(image_resource(&image)))))
}

pub async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let images = state.engine.images.list().await?;
    let data: Vec<_> = images.iter().map(image_resource).collect();
    Ok(Json(Document::new(data)))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let image = state.engine.images.get(parse_id(&id)?).await?;
    Ok(Json(Document::new(image_resource(&image))))
}

#[instrument(skip(state))]
pub async fn done(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let image = state.engine.images.finalize(parse_id(&id)?).await?;
    Ok(Json(Document::new(image_resource(&image))))
}

#[instrument(skip(state))]
pub async fn destroy(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.engine.images.delete(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}
