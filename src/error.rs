//! Error kinds shared by every request-path operation.
//!
//! The outer (HTTP) layer only needs the kind; `status()` gives it the code.
//! A record that does not exist is reported as `BadRequest`, not as a
//! separate not-found kind, and callers rely on that.

use core::fmt;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use http::StatusCode;
use std::error::Error;

#[derive(Debug)]
pub enum ServiceError {
    /// Bad, expired or missing credentials or access token.
    Unauthorized(String),
    /// Refresh token unknown, expired or out of uses.
    Forbidden(String),
    /// Missing fields, capacity exceeded, absent records, constraint violations.
    BadRequest(String),
    Database(DieselError),
    Internal(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ServiceError::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        ServiceError::Forbidden(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        ServiceError::BadRequest(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Database(_) | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            ServiceError::Forbidden(msg) => write!(f, "forbidden: {}", msg),
            ServiceError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            ServiceError::Database(e) => write!(f, "database error: {}", e),
            ServiceError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServiceError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DieselError> for ServiceError {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::NotFound => ServiceError::BadRequest("record not found".to_string()),
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                ServiceError::BadRequest(format!("already exists: {}", info.message()))
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                ServiceError::BadRequest(format!("unknown reference: {}", info.message()))
            }
            other => ServiceError::Database(other),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for ServiceError {
    fn from(value: jsonwebtoken::errors::Error) -> Self {
        ServiceError::Internal(format!("token signing failed: {}", value))
    }
}
