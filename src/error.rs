//! Error types for the client.
//!
//! `ClientError` is what a request can fail with; coordinators reduce it to a
//! single published message. `ValidationError` is the auth endpoints'
//! structured rejection body.

use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    /// The configured base URL cannot be joined with an endpoint path.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Non-success status. `message` is already user-facing.
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },

    #[error("Invalid response from server: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ClientError {
    pub fn rejected(status: StatusCode, message: impl Into<String>) -> Self {
        ClientError::Rejected {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ClientError::Rejected { status, .. } => Some(*status),
            ClientError::Transport(e) => e.status(),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("value under '{0}' is not valid UTF-8")]
    NotUtf8(String),
}

/// Raw rejection body: each field is an optional list of messages.
#[derive(Deserialize, Debug, Default)]
struct ValidationPayload {
    #[serde(default)]
    non_field_errors: Option<Vec<String>>,
    #[serde(default)]
    username: Option<Vec<String>>,
    #[serde(default)]
    email: Option<Vec<String>>,
    #[serde(default)]
    password: Option<Vec<String>>,
}

/// The auth endpoints' validation failure, reduced to the single variant
/// that wins by priority: general, then username, email, password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    General(Vec<String>),
    Username(Vec<String>),
    Email(Vec<String>),
    Password(Vec<String>),
    Unknown,
}

impl ValidationError {
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let payload: ValidationPayload = serde_json::from_slice(body)?;
        Ok(Self::from(payload))
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

impl From<ValidationPayload> for ValidationError {
    fn from(payload: ValidationPayload) -> Self {
        let non_empty = |errors: Option<Vec<String>>| errors.filter(|e| !e.is_empty());

        if let Some(errors) = non_empty(payload.non_field_errors) {
            ValidationError::General(errors)
        } else if let Some(errors) = non_empty(payload.username) {
            ValidationError::Username(errors)
        } else if let Some(errors) = non_empty(payload.email) {
            ValidationError::Email(errors)
        } else if let Some(errors) = non_empty(payload.password) {
            ValidationError::Password(errors)
        } else {
            ValidationError::Unknown
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::General(errors) => write!(f, "{}", errors.join(", ")),
            ValidationError::Username(errors) => write!(f, "Username: {}", errors.join(", ")),
            ValidationError::Email(errors) => write!(f, "Email: {}", errors.join(", ")),
            ValidationError::Password(errors) => write!(f, "Password: {}", errors.join(", ")),
            ValidationError::Unknown => write!(f, "Unknown error occurred"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_wins_over_email() {
        let body = br#"{"username": ["A user with that username already exists."],
                        "email": ["Enter a valid email address."]}"#;
        let err = ValidationError::from_slice(body).unwrap();
        assert_eq!(
            err,
            ValidationError::Username(vec!["A user with that username already exists.".into()])
        );
        assert_eq!(err.message(), "Username: A user with that username already exists.");
    }

    #[test]
    fn test_general_errors_are_joined_without_prefix() {
        let body = br#"{"non_field_errors": ["Invalid credentials", "Try again"],
                        "password": ["Too short"]}"#;
        let err = ValidationError::from_slice(body).unwrap();
        assert_eq!(err.message(), "Invalid credentials, Try again");
    }

    #[test]
    fn test_empty_lists_are_skipped() {
        let body = br#"{"non_field_errors": [], "username": [], "password": ["Too short"]}"#;
        let err = ValidationError::from_slice(body).unwrap();
        assert_eq!(err.message(), "Password: Too short");
    }

    #[test]
    fn test_unknown_fallback_and_undecodable_body() {
        let err = ValidationError::from_slice(br#"{"detail": "nope"}"#).unwrap();
        assert_eq!(err, ValidationError::Unknown);
        assert_eq!(err.message(), "Unknown error occurred");

        assert!(ValidationError::from_slice(b"<html>502</html>").is_err());
    }

    #[test]
    fn test_client_error_messages() {
        let err = ClientError::rejected(StatusCode::BAD_REQUEST, "Failed to vote");
        assert_eq!(err.to_string(), "Failed to vote");
        assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));

        let decode = serde_json::from_str::<u8>("x").unwrap_err();
        let err = ClientError::from(decode);
        assert!(err.to_string().starts_with("Invalid response from server"));
        assert_eq!(err.status(), None);
    }
}
