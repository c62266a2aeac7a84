//! Converts `anyhow::Error` chains (with optional [`errors::ErrorMetadata`]
//! tags) into HTTP responses. All handlers return this as their error type;
//! this is the exit point where errors are logged.

use axum::response::{
    IntoResponse,
    Response,
};
use axum::Json;
use errors::ErrorMetadataAnyhowExt;
use serde::Serialize;

#[derive(Debug)]
pub struct HttpResponseError(anyhow::Error);

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for HttpResponseError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        if status.is_server_error() {
            tracing::error!("request failed: {:#}", self.0);
        } else {
            tracing::info!("request rejected ({status}): {:#}", self.0);
        }
        let body = ErrorBody {
            code: self.0.short_msg().to_string(),
            message: self.0.user_facing_message(),
        };
        (status, Json(body)).into_response()
    }
}

impl<E: Into<anyhow::Error>> From<E> for HttpResponseError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type HttpResult<T> = Result<T, HttpResponseError>;
