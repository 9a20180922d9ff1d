//! Caller identity
//!
//! The caller names itself with an `X-User-Id` header. This is identity, not
//! authentication: the value is trusted as given.

use axum::http::HeaderMap;
use coedit_core::UserId;

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

pub fn extract_user_id(headers: &HeaderMap) -> Result<UserId, AppError> {
    let header = headers
        .get(USER_ID_HEADER)
        .ok_or_else(|| AppError::unauthorized("Missing X-User-Id header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("X-User-Id header is not valid UTF-8"))?;

    header
        .parse()
        .map_err(|error: coedit_core::Error| AppError::unauthorized(error.to_string()))
}
