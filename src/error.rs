// Copyright 2024 - Nym Technologies SA <contact@nymtech.net>
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Flat error taxonomy shared by every gateway subsystem. Callers match on
/// the variant, never on the wrapped message, since the message text is
/// allowed to change without notice.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request was malformed or failed validation: {0}")]
    Invalid(String),

    #[error("requested entity was not found")]
    NotFound,

    #[error("entity already exists")]
    AlreadyExists,

    #[error("authentication failed")]
    Unauthenticated,

    #[error("request was rejected by the rate limiter")]
    RateLimited,

    #[error("round batch is already full")]
    Overfull,

    #[error("no known host for proxy target")]
    NoTarget,

    #[error("proxy target is not currently connected")]
    NotConnected,

    #[error("operation timed out")]
    Timeout,

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => GatewayError::NotFound,
            other => GatewayError::Backend(other.to_string()),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Backend(err.to_string())
    }
}

impl From<rsa::Error> for GatewayError {
    fn from(err: rsa::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<bincode::Error> for GatewayError {
    fn from(err: bincode::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
