use std::borrow::Cow;

use http::StatusCode;

pub const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
pub const INTERNAL_SERVER_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";

/// ErrorMetadata can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It tags errors with the information
/// used to classify them at the HTTP/WS boundary.
///
/// The `msg` is conveyed as a user facing error message if it makes it to the
/// client.
///
/// The `short_msg` is used as a tag - available for tests and for logging -
/// that is resilient to changes in copy. HTTP responses send it as a separate
/// `code` field.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag, e.g. `ConversationLocked`. Usable in
    /// tests for string matching.
    pub short_msg: Cow<'static, str>,
    /// Human readable, user/developer facing. Longer and descriptive.
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    RequestTimeout,
    UnprocessableEntity,
    ClientDisconnect,

    Overloaded,
    OperationalInternalServerError,
}

impl ErrorMetadata {
    /// Bad Request. Maps to 400 in HTTP.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Not authenticated. Maps to 401 in HTTP.
    pub fn unauthenticated(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unauthenticated,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Forbidden. Maps to 403 in HTTP.
    pub fn forbidden(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Forbidden,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found. Maps to 404 in HTTP.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// A concurrent request already holds an exclusive resource. Maps to 409.
    pub fn conflict(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Conflict,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// An upstream dependency didn't answer in time. Maps to 408.
    pub fn request_timeout(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::RequestTimeout,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The request was well-formed but cannot be processed (e.g. the user's
    /// database rejected our session). Maps to 422.
    pub fn unprocessable_entity(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::UnprocessableEntity,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Client disconnected the connection.
    pub fn client_disconnect() -> Self {
        Self {
            code: ErrorCode::ClientDisconnect,
            short_msg: "ClientDisconnected".into(),
            msg: "The client disconnected before the request completed".into(),
        }
    }

    /// A defensive limit was hit (e.g. the connection pool is exhausted).
    /// Maps to 503; safe to retry.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Internal server error with a generic user message (maps to 500).
    /// Used where the failure comes from a known operational source. For
    /// everything else use bare `anyhow`, which classifies as 500 anyway.
    pub fn operational_internal_server_error() -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: INTERNAL_SERVER_ERROR.into(),
            msg: INTERNAL_SERVER_ERROR_MSG.into(),
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_unauthenticated(&self) -> bool {
        self.code == ErrorCode::Unauthenticated
    }

    pub fn is_forbidden(&self) -> bool {
        self.code == ErrorCode::Forbidden
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.code == ErrorCode::Conflict
    }

    pub fn is_overloaded(&self) -> bool {
        self.code == ErrorCode::Overloaded
    }

    /// True if this error is deterministically caused by the caller, so
    /// retrying the same request cannot succeed.
    pub fn is_deterministic_user_error(&self) -> bool {
        match self.code {
            ErrorCode::BadRequest
            | ErrorCode::Unauthenticated
            | ErrorCode::Forbidden
            | ErrorCode::NotFound
            | ErrorCode::UnprocessableEntity => true,
            ErrorCode::Conflict
            | ErrorCode::RequestTimeout
            | ErrorCode::ClientDisconnect
            | ErrorCode::Overloaded
            | ErrorCode::OperationalInternalServerError => false,
        }
    }
}

impl ErrorCode {
    pub fn http_status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            // HTTP has the unfortunate naming of 401 as unauthorized when
            // it's really about authentication.
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::RequestTimeout | ErrorCode::ClientDisconnect => {
                StatusCode::REQUEST_TIMEOUT
            },
            ErrorCode::UnprocessableEntity => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::OperationalInternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Classification helpers over `anyhow::Error`, looking for an attached
/// [`ErrorMetadata`] anywhere in the chain. Untagged errors classify as 500.
pub trait ErrorMetadataAnyhowExt {
    fn is_bad_request(&self) -> bool;
    fn is_unauthenticated(&self) -> bool;
    fn is_forbidden(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
    fn is_overloaded(&self) -> bool;
    fn is_deterministic_user_error(&self) -> bool;
    fn user_facing_message(&self) -> String;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn http_status(&self) -> StatusCode;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_bad_request(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(|e| e.is_bad_request())
    }

    fn is_unauthenticated(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(|e| e.is_unauthenticated())
    }

    fn is_forbidden(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(|e| e.is_forbidden())
    }

    fn is_not_found(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(|e| e.is_not_found())
    }

    fn is_conflict(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(|e| e.is_conflict())
    }

    fn is_overloaded(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(|e| e.is_overloaded())
    }

    fn is_deterministic_user_error(&self) -> bool {
        self.downcast_ref::<ErrorMetadata>()
            .is_some_and(|e| e.is_deterministic_user_error())
    }

    /// Message to show the user. Untagged errors get the generic 500 copy so
    /// internal details never leak.
    fn user_facing_message(&self) -> String {
        match self.downcast_ref::<ErrorMetadata>() {
            Some(e) => e.msg.to_string(),
            None => INTERNAL_SERVER_ERROR_MSG.to_string(),
        }
    }

    fn short_msg(&self) -> &str {
        match self.downcast_ref::<ErrorMetadata>() {
            Some(e) => &e.short_msg,
            None => INTERNAL_SERVER_ERROR,
        }
    }

    fn msg(&self) -> &str {
        match self.downcast_ref::<ErrorMetadata>() {
            Some(e) => &e.msg,
            None => INTERNAL_SERVER_ERROR_MSG,
        }
    }

    fn http_status(&self) -> StatusCode {
        match self.downcast_ref::<ErrorMetadata>() {
            Some(e) => e.code.http_status_code(),
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use http::StatusCode;

    use super::*;

    #[test]
    fn test_tagged_error_survives_context_chain() {
        let e: anyhow::Error = anyhow::anyhow!("underlying io failure")
            .context(ErrorMetadata::not_found("MapNotFound", "Map M123 not found"))
            .context("while handling request");
        assert!(e.is_not_found());
        assert_eq!(e.short_msg(), "MapNotFound");
        assert_eq!(e.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(e.user_facing_message(), "Map M123 not found");
    }

    #[test]
    fn test_untagged_error_is_internal() {
        let e = anyhow::anyhow!("schema drift: missing column");
        assert_eq!(e.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
        // Internal details must not reach the user.
        assert_eq!(e.user_facing_message(), INTERNAL_SERVER_ERROR_MSG);
        assert_eq!(e.short_msg(), INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            ErrorMetadata::conflict("ConversationLocked", "busy")
                .code
                .http_status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ErrorMetadata::request_timeout("ConnectTimeout", "timed out")
                .code
                .http_status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            ErrorMetadata::unprocessable_entity("PostgresError", "bad db")
                .code
                .http_status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ErrorMetadata::overloaded("PoolExhausted", "try later")
                .code
                .http_status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_deterministic_user_error_classification() {
        assert!(ErrorMetadata::bad_request("X", "y").is_deterministic_user_error());
        assert!(!ErrorMetadata::conflict("X", "y").is_deterministic_user_error());
        assert!(!ErrorMetadata::operational_internal_server_error().is_deterministic_user_error());
    }
}
