use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use draupnir_common::{DraupnirError, InstanceId};
use tracing::{error, info, instrument, warn};

use super::{parse_body, parse_id};
use crate::client_ip::ClientIp;
use crate::errors::ApiError;
use crate::jsonapi::{
    credential_resource, instance_resource, CreateInstanceAttributes, Document, RequestDocument,
};
use crate::AppState;

#[instrument(skip_all)]
pub async fn create(
    State(state): State<AppState>,
    client_ip: ClientIp,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: RequestDocument<CreateInstanceAttributes> = parse_body(&body)?;
    let image_id: u64 = request
        .data
        .attributes
        .image_id
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_image_id())?;

    let provisioned = state
        .engine
        .instances
        .provision(image_id)
        .await
        .map_err(|e| match e {
            DraupnirError::NotFound(_) => ApiError::image_not_found(),
            other => other.into(),
        })?;

    let instance = provisioned.instance;
    info!(instance_id = instance.id, image_id, port = instance.port, "instance provisioned");
    whitelist_caller(&state, instance.id, client_ip).await;

    let mut document = Document::new(instance_resource(&instance));
    if let Some(credential) = &instance.credential {
        document
            .included
            .push(credential_resource(credential, Some(provisioned.client_key)));
    }
    Ok((StatusCode::CREATED, Json(document)))
}

/// Listing carries only the relationship pointer, never credential material.
pub async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let instances = state.engine.instances.list().await?;
    let data: Vec<_> = instances.iter().map(instance_resource).collect();
    Ok(Json(Document::new(data)))
}

pub async fn get(
    State(state): State<AppState>,
    client_ip: ClientIp,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state.engine.instances.get(parse_id(&id)?).await?;
    whitelist_caller(&state, instance.id, client_ip).await;
    let mut document = Document::new(instance_resource(&instance));
    if let Some(credential) = &instance.credential {
        document.included.push(credential_resource(credential, None));
    }
    Ok(Json(document))
}

#[instrument(skip(state))]
pub async fn destroy(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.engine.instances.delete(parse_id(&id)?).await?;
    if let Some(whitelister) = &state.whitelister {
        whitelister.trigger("instance deleted");
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Let the caller's address reach the instance's port.
///
/// Failures are logged rather than returned: the instance itself is fine and
/// a create response carries a key that cannot be fetched again.
async fn whitelist_caller(state: &AppState, instance_id: InstanceId, ClientIp(ip): ClientIp) {
    let Some(whitelister) = &state.whitelister else {
        return;
    };
    let Some(ip) = ip else {
        warn!(instance_id, "client address unknown, not whitelisting");
        return;
    };
    match state.engine.instances.whitelist_address(instance_id, ip).await {
        Ok(_) => whitelister.trigger("api"),
        Err(e) => error!(instance_id, %ip, error = %e, "failed to whitelist client address"),
    }
}
