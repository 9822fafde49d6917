//! JSON:API error objects

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use draupnir_common::DraupnirError;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub id: &'static str,
    pub status: String,
    pub code: &'static str,
    pub title: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ErrorSource>,
    #[serde(skip)]
    status_code: StatusCode,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, title: &str, detail: impl Into<String>) -> Self {
        Self {
            id: code,
            status: status.as_u16().to_string(),
            code,
            title: title.to_string(),
            detail: detail.into(),
            source: None,
            status_code: status,
        }
    }

    fn with_parameter(mut self, parameter: &str) -> Self {
        self.source = Some(ErrorSource {
            parameter: Some(parameter.to_string()),
            pointer: None,
        });
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_server_error",
            "Internal Server Error",
            "Something went wrong :(",
        )
    }

    pub fn not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "resource_not_found",
            "Resource Not Found",
            "The resource you requested could not be found",
        )
    }

    pub fn image_not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "resource_not_found",
            "Image Not Found",
            "The image you specified could not be found",
        )
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Unauthorized",
            "You do not have permission to view this resource",
        )
    }

    pub fn missing_api_version() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "missing_api_version_header",
            "Missing API Version Header",
            "No API version specified in Draupnir-Version header",
        )
    }

    pub fn invalid_api_version(client: &str, server: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "invalid_api_version",
            "Invalid API Version",
            format!("Specified API version ({client}) does not match server version ({server})"),
        )
    }

    pub fn invalid_json() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "Invalid JSON",
            "Your JSON is malformed",
        )
    }

    pub fn bad_image_id() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "Bad Request",
            "The image ID provided is not valid",
        )
        .with_parameter("image_id")
    }

    pub fn unready_image() -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "unprocessable_entity",
            "Image Not Ready",
            "The specified image is not ready to be used",
        )
        .with_parameter("image_id")
    }

    pub fn image_has_instances() -> Self {
        Self::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "unprocessable_entity",
            "Image Has Instances",
            "Cannot delete an image that has instances",
        )
    }

    pub fn invalid_transition(detail: String) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", "Conflict", detail)
    }

    pub fn exhausted() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "resource_exhausted",
            "Resource Exhausted",
            "No instance ports are available",
        )
    }
}

impl From<DraupnirError> for ApiError {
    fn from(err: DraupnirError) -> Self {
        match err {
            DraupnirError::NotFound(_) => ApiError::not_found(),
            DraupnirError::ImageNotReady(_) => ApiError::unready_image(),
            DraupnirError::Conflict(_) => ApiError::image_has_instances(),
            DraupnirError::InvalidTransition { .. } => ApiError::invalid_transition(err.to_string()),
            DraupnirError::ResourceExhausted(_) => ApiError::exhausted(),
            DraupnirError::Storage(_)
            | DraupnirError::Corrupted(_)
            | DraupnirError::Config(_)
            | DraupnirError::Io(_)
            | DraupnirError::Internal(_) => {
                error!(error = %err, "request failed");
                ApiError::internal()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unready_image_names_parameter() {
        let json = serde_json::to_value(ApiError::from(DraupnirError::ImageNotReady(3))).unwrap();
        assert_eq!(json["status"], "422");
        assert_eq!(json["code"], "unprocessable_entity");
        assert_eq!(json["source"]["parameter"], "image_id");
        assert!(json.get("status_code").is_none());
    }

    #[test]
    fn test_server_errors_are_generic() {
        let err = ApiError::from(DraupnirError::Corrupted("base-4 missing from /var/draupnir".into()));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.detail.contains("/var/draupnir"));
        assert!(err.source.is_none());
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (DraupnirError::NotFound("image 1".into()), StatusCode::NOT_FOUND),
            (DraupnirError::Conflict("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                DraupnirError::InvalidTransition { state: "provisioning".into(), action: "delete" },
                StatusCode::CONFLICT,
            ),
            (DraupnirError::ResourceExhausted("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (DraupnirError::Storage("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }
}
