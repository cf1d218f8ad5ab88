use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::collections::BTreeMap;

/// Error taxonomy for the whole API. Every failure a handler or domain
/// function can produce maps onto one of these, which in turn maps onto a
/// stable `{success: false, message, errors?}` envelope.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(BTreeMap<String, String>),

    #[error("resource not found")]
    NotFound,

    #[error("already enrolled in this course")]
    AlreadyEnrolled,

    #[error("course is not open for enrollment")]
    CourseUnavailable,

    #[error("course enrollment limit reached")]
    CapacityExceeded,

    #[error("enrollment cannot change state")]
    InvalidTransition,

    #[error("not enrolled in this course")]
    NotEnrolled,

    #[error("maximum attempts reached for this quiz")]
    AttemptLimitReached,

    #[error("attempt has already been submitted")]
    AlreadySubmitted,

    #[error("attempt belongs to another student")]
    AttemptNotOwned,

    #[error("certificate already issued")]
    AlreadyIssued,

    #[error("course already paid")]
    AlreadyPaid,

    #[error("permission denied")]
    PermissionDenied,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("payment processor unavailable")]
    External,

    #[error("internal server error")]
    Internal,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl ApiError {
    pub fn validation(field: &str, message: &str) -> Self {
        let mut errors = BTreeMap::new();
        errors.insert(field.to_string(), message.to_string());
        ApiError::Validation(errors)
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::AlreadyEnrolled
            | ApiError::InvalidTransition
            | ApiError::AlreadySubmitted
            | ApiError::AlreadyIssued
            | ApiError::AlreadyPaid => StatusCode::CONFLICT,
            ApiError::CourseUnavailable => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::CapacityExceeded | ApiError::AttemptLimitReached => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::NotEnrolled
            | ApiError::AttemptNotOwned
            | ApiError::PermissionDenied => StatusCode::FORBIDDEN,
            ApiError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ApiError::External => StatusCode::BAD_GATEWAY,
            ApiError::Internal | ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Fixed message catalog; internal errors never leak their text.
    fn message(&self) -> String {
        match self {
            ApiError::Database(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Database(ref e) = self {
            tracing::error!(error = %e, "database error");
        }
        let mut body = json!({
            "success": false,
            "message": self.message(),
        });
        if let ApiError::Validation(ref errors) = self {
            body["errors"] = json!(errors);
        }
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_errors_map_to_409() {
        assert_eq!(ApiError::AlreadyEnrolled.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::AlreadySubmitted.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::AlreadyIssued.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn ownership_errors_map_to_403() {
        assert_eq!(ApiError::NotEnrolled.status(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::AttemptNotOwned.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn database_errors_hide_their_text() {
        let err = ApiError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.message(), "internal server error");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn validation_errors_carry_field_messages() {
        let err = ApiError::validation("email", "must not be empty");
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        match err {
            ApiError::Validation(map) => {
                assert_eq!(map.get("email").map(String::as_str), Some("must not be empty"));
            }
            _ => unreachable!(),
        }
    }
}
