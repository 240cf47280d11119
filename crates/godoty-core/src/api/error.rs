use serde_json::Value;
use thiserror::Error;

/// Error codes the query backend uses for a table or view that does not exist
const RELATION_MISSING_CODES: [&str; 2] = ["42P01", "PGRST205"];

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Relation not found: {0}")]
    RelationNotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    /// `{error}` body from an edge function
    #[error("{0}")]
    Endpoint(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if let Ok(json) = serde_json::from_str::<Value>(body) {
            let message = json.get("message").and_then(Value::as_str);

            if let Some(code) = json.get("code").and_then(Value::as_str) {
                if RELATION_MISSING_CODES.contains(&code) {
                    return ApiError::RelationNotFound(message.unwrap_or(code).to_string());
                }
            }

            if let Some(error) = json.get("error").and_then(Value::as_str) {
                return ApiError::Endpoint(error.to_string());
            }
        }

        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }
}
