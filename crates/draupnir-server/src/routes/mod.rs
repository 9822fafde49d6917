pub mod health;
pub mod images;
pub mod instances;

use crate::errors::ApiError;
use serde::de::DeserializeOwned;

/// Path ids that are not numbers name nothing.
pub(crate) fn parse_id(raw: &str) -> Result<u64, ApiError> {
    raw.parse().map_err(|_| ApiError::not_found())
}

/// Decode a request body regardless of its declared content type.
pub(crate) fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        tracing::debug!(error = %e, "rejecting malformed body");
        ApiError::invalid_json()
    })
}

pub(crate) async fn not_found() -> ApiError {
    ApiError::not_found()
}
