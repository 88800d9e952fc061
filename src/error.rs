use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Unknown entity type '{0}'")]
    UnknownEntityType(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Device '{0}' is not registered")]
    DeviceNotFound(String),

    #[error("Queue entry '{0}' not found")]
    EntryNotFound(u64),

    #[error("Conflict '{0}' not found")]
    ConflictNotFound(u64),

    #[error("Conflict '{0}' is already resolved")]
    ConflictAlreadyResolved(u64),

    #[error("Retry budget exhausted for entry '{0}'")]
    RetryExhausted(u64),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Apply failed: {0}")]
    ApplyFailed(String),

    #[error("Record with id '{0}' not found")]
    RecordNotFound(i64),

    #[error("Processing timed out after {0}s")]
    Timeout(u64),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl serde::Serialize for SyncError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            SyncError::UnknownEntityType(_)
            | SyncError::MalformedPayload(_)
            | SyncError::BadRequest(_)
            | SyncError::ConflictAlreadyResolved(_)
            | SyncError::RetryExhausted(_)
            | SyncError::DeviceNotFound(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            SyncError::EntryNotFound(_)
            | SyncError::ConflictNotFound(_)
            | SyncError::RecordNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            SyncError::Timeout(_) => (StatusCode::REQUEST_TIMEOUT, self.to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
            "code": status.as_u16(),
            "type": format!("{:?}", self).split('(').next().unwrap_or("Error")
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SyncError::UnknownEntityType("vehicle".to_string());
        assert_eq!(err.to_string(), "Unknown entity type 'vehicle'");

        let err = SyncError::DeviceNotFound("tablet-07".to_string());
        assert_eq!(err.to_string(), "Device 'tablet-07' is not registered");

        let err = SyncError::EntryNotFound(42);
        assert_eq!(err.to_string(), "Queue entry '42' not found");

        let err = SyncError::MalformedPayload("expected object".to_string());
        assert_eq!(err.to_string(), "Malformed payload: expected object");

        let err = SyncError::ApplyFailed("validation rejected phone".to_string());
        assert_eq!(err.to_string(), "Apply failed: validation rejected phone");

        let err = SyncError::Timeout(60);
        assert_eq!(err.to_string(), "Processing timed out after 60s");
    }

    #[test]
    fn test_error_debug() {
        let err = SyncError::ConflictNotFound(7);
        let debug = format!("{:?}", err);
        assert!(debug.contains("ConflictNotFound"));
    }

    #[test]
    fn test_sync_result_type() {
        let ok_result: SyncResult<i32> = Ok(42);
        assert_eq!(ok_result.unwrap(), 42);

        let err_result: SyncResult<i32> = Err(SyncError::Internal("test".to_string()));
        assert!(err_result.is_err());
    }
}
