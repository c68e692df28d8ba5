use std::fmt::Display;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Request-terminating failure. Rendered as `{"error": "<message>"}` with `status`.
#[derive(Debug)]
pub struct GatewayError {
    pub status: StatusCode,
    pub message: String,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl GatewayError {
    pub fn new(status: StatusCode, message: impl Display) -> Self {
        Self {
            status,
            message: message.to_string(),
        }
    }

    /// Missing or invalid API key.
    pub fn unauthorized(message: impl Display) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    /// Missing or malformed upload.
    pub fn bad_request(message: impl Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// The server lacks a setting it needs to serve the request.
    pub fn configuration(message: impl Display) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// The inference endpoint could not be reached or answered with an error.
    pub fn upstream(message: impl Display) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: &self.message,
        });
        (self.status, body).into_response()
    }
}

// Anything `?`-propagated without an explicit status is our own fault.
impl<E> From<E> for GatewayError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", err.into()))
    }
}

pub type GatewayResult<T, E = GatewayError> = Result<T, E>;

#[macro_export]
macro_rules! bail_gateway {
    ($status:expr, $message:expr) => {
        return Err($crate::error::GatewayError::new($status, $message))
    };
    ($status:expr, $fmt:expr, $($arg:expr),+) => {
        return Err($crate::error::GatewayError::new($status, format!($fmt, $($arg),+)))
    };
}

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $($arg:tt)+) => {{
        tracing::error!($($arg)+);
        std::process::exit($code);
    }};
}
