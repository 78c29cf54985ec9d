//! Error handling for the framework.

use std::fmt;

use crate::status::{is_status_code, phrase_to_code, reason_phrase};

pub type TejasResult<T> = Result<T, TejasError>;

/// Errors raised outside the request path: configuration, listener and
/// connection lifecycle, limiter/cache storage.
#[derive(Debug, Clone)]
pub enum TejasError {
    /// Configuration validation error, startup-fatal
    Config(String),
    /// Endpoint path rejected at registration
    InvalidPath(String),
    /// Listener could not bind or accept
    Listen(String),
    /// A managed connection could not be established
    ConnectionFailed(String),
    /// Unsupported connection type or driver
    Unsupported(String),
    /// Limiter or cache storage operation failed
    Storage(String),
    /// Limiter storage operation timed out
    StorageTimeout(String),
    /// Cache value transform failure
    Crypto(String),
}

impl fmt::Display for TejasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TejasError::Config(msg) => write!(f, "Configuration error: {}", msg),
            TejasError::InvalidPath(msg) => write!(f, "Invalid path: {}", msg),
            TejasError::Listen(msg) => write!(f, "Listener error: {}", msg),
            TejasError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            TejasError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            TejasError::Storage(msg) => write!(f, "Storage error: {}", msg),
            TejasError::StorageTimeout(msg) => write!(f, "Storage timeout: {}", msg),
            TejasError::Crypto(msg) => write!(f, "Crypto error: {}", msg),
        }
    }
}

impl std::error::Error for TejasError {}

impl From<std::io::Error> for TejasError {
    fn from(error: std::io::Error) -> Self {
        TejasError::Listen(error.to_string())
    }
}

/// The value a middleware or handler throws into the error-sender.
///
/// `Typed` carries an explicit status and message; `Status` is a bare code
/// with an optional message; `Generic` is anything else and is classified at
/// resolution time (integer message, known reason phrase, or 500 fallback).
#[derive(Debug, Clone, PartialEq)]
pub enum HttpError {
    Typed { code: u16, message: String },
    Status { code: u16, message: Option<String> },
    Generic(String),
}

impl HttpError {
    /// The no-argument default: 500 with its reason phrase.
    pub fn internal() -> Self {
        HttpError::Typed {
            code: 500,
            message: reason_phrase(500).to_string(),
        }
    }

    pub fn with_code(code: u16) -> Self {
        HttpError::Status { code, message: None }
    }

    pub fn with_message(code: u16, message: impl Into<String>) -> Self {
        HttpError::Typed {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::with_message(400, message)
    }

    pub fn unauthorized() -> Self {
        Self::with_code(401)
    }

    pub fn forbidden() -> Self {
        Self::with_code(403)
    }

    pub fn not_found() -> Self {
        Self::with_code(404)
    }

    pub fn not_allowed() -> Self {
        Self::with_code(405)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_message(408, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::with_message(413, message)
    }

    pub fn unsupported_media_type(message: impl Into<String>) -> Self {
        Self::with_message(415, message)
    }

    pub fn too_many_requests() -> Self {
        Self::with_message(429, reason_phrase(429))
    }

    /// Resolves to the `(status, message)` pair the error-sender writes.
    ///
    /// Resolution order for `Generic` values: a message that parses as a
    /// valid status code becomes that status with its default phrase; a
    /// message equal to a known reason phrase (case-insensitive) maps to its
    /// code with the original text; anything else is a 500 carrying the
    /// stringified value. Out-of-range explicit codes degrade to 500.
    pub fn resolve(&self) -> (u16, String) {
        match self {
            HttpError::Typed { code, message } => {
                if is_status_code(i64::from(*code)) {
                    (*code, message.clone())
                } else {
                    (500, message.clone())
                }
            }
            HttpError::Status { code, message } => {
                let code = if is_status_code(i64::from(*code)) { *code } else { 500 };
                let message = message
                    .clone()
                    .unwrap_or_else(|| reason_phrase(code).to_string());
                (code, message)
            }
            HttpError::Generic(text) => {
                if let Ok(n) = text.trim().parse::<i64>() {
                    if is_status_code(n) {
                        let code = n as u16;
                        return (code, reason_phrase(code).to_string());
                    }
                }
                if let Some(code) = phrase_to_code(text) {
                    return (code, text.clone());
                }
                (500, text.clone())
            }
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (code, message) = self.resolve();
        write!(f, "{} {}", code, message)
    }
}

impl std::error::Error for HttpError {}

impl From<TejasError> for HttpError {
    fn from(error: TejasError) -> Self {
        match error {
            TejasError::StorageTimeout(_) => HttpError::Typed {
                code: 503,
                message: reason_phrase(503).to_string(),
            },
            TejasError::Storage(_) => HttpError::internal(),
            other => HttpError::Generic(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(error: serde_json::Error) -> Self {
        HttpError::Generic(error.to_string())
    }
}

impl From<u16> for HttpError {
    fn from(code: u16) -> Self {
        HttpError::Status { code, message: None }
    }
}

impl From<&str> for HttpError {
    fn from(text: &str) -> Self {
        HttpError::Generic(text.to_string())
    }
}

impl From<String> for HttpError {
    fn from(text: String) -> Self {
        HttpError::Generic(text)
    }
}
