//! Request extractors.
//!
//! Identity is supplied by the fronting gateway in the `x-vigil-user`
//! header. The engine only needs a stable user id to enforce ownership.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, Path, Request},
    http::request::Parts,
};
use serde::de::DeserializeOwned;
use uuid::Uuid;
use vigil_core::UserId;

use crate::error::ApiError;

pub const CALLER_HEADER: &str = "x-vigil-user";

/// The calling user, parsed from [`CALLER_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub UserId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(CALLER_HEADER)
            .ok_or_else(|| ApiError::unauthorized(format!("Missing {} header", CALLER_HEADER)))?;
        let value = value
            .to_str()
            .map_err(|_| ApiError::unauthorized(format!("Unreadable {} header", CALLER_HEADER)))?;
        Uuid::parse_str(value.trim())
            .map(Caller)
            .map_err(|e| ApiError::unauthorized(format!("Invalid {} header: {}", CALLER_HEADER, e)))
    }
}

/// UUID path parameter with an [`ApiError`] rejection.
#[derive(Debug, Clone, Copy)]
pub struct PathId(pub Uuid);

#[axum::async_trait]
impl<S> FromRequestParts<S> for PathId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw) = Path::<String>::from_request_parts(parts, state)
            .await
            .map_err(|e| ApiError::invalid_input(e.body_text()))?;
        Uuid::parse_str(&raw)
            .map(PathId)
            .map_err(|e| ApiError::invalid_input(format!("Invalid ID '{}': {}", raw, e)))
    }
}

/// JSON body with an [`ApiError`] rejection.
#[derive(Debug, Clone, Default)]
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        axum::Json::<T>::from_request(req, state)
            .await
            .map(|axum::Json(value)| ApiJson(value))
            .map_err(|e: JsonRejection| ApiError::invalid_input(e.body_text()))
    }
}
