//! Request middleware: version advertisement, client version check, bearer auth

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use draupnir_common::version::{is_compatible, VERSION_HEADER};
use tracing::debug;

use crate::errors::ApiError;
use crate::{AppState, VERSION};

/// Stamp every response with the running server version.
pub async fn add_version_header(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(HeaderName::from_static("draupnir-version"), HeaderValue::from_static(VERSION));
    response
}

/// Reject clients whose declared version this server cannot serve.
pub async fn check_api_version(request: Request, next: Next) -> Response {
    let Some(value) = request.headers().get(VERSION_HEADER) else {
        return ApiError::missing_api_version().into_response();
    };
    let client = value.to_str().unwrap_or_default().trim().to_string();
    if !is_compatible(VERSION, &client) {
        debug!(client_version = %client, "rejecting incompatible client");
        return ApiError::invalid_api_version(&client, VERSION).into_response();
    }
    next.run(request).await
}

pub async fn authenticate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match token {
        Some(token) if constant_time_eq(token.as_bytes(), state.shared_secret.as_bytes()) => {
            next.run(request).await
        }
        _ => ApiError::unauthorized().into_response(),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
