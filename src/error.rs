//! Error types for the RealityHub bridge
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - Transport failure classification for the scheduler
//! - User-friendly messages with suggestions
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Transport errors (3xx)
    TransportFailed = 300,
    TransportTimeout = 301,
    ConnectionFailed = 302,

    // HTTP / response errors (4xx)
    HttpStatus = 400,
    HttpUnauthorized = 401,
    HttpForbidden = 403,
    MalformedResponse = 422,

    // Execution errors (5xx)
    ExecutionBlocked = 500,
    TaskAbandoned = 501,
    RequestsDisabled = 502,
    InvalidEndpoint = 503,
    ActionRejected = 504,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E301")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Transport errors
            400..=499 => 40, // HTTP errors
            500..=599 => 50, // Execution errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse classification of a failed request.
///
/// The dispatcher decides between "log and carry on" and "reconnect" from
/// this alone, never from message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Timeout,
    ConnectionRefused,
    Unauthorized,
    Forbidden,
    Other,
}

impl ErrorClass {
    /// Whether the device itself should be considered unreachable
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ErrorClass::Timeout | ErrorClass::ConnectionRefused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "TimeoutError",
            ErrorClass::ConnectionRefused => "RequestError",
            ErrorClass::Unauthorized => "Unauthorized",
            ErrorClass::Forbidden => "Forbidden",
            ErrorClass::Other => "RequestFailed",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the bridge
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // ─────────────────────────────────────────────────────────────
    // Transport Errors
    // ─────────────────────────────────────────────────────────────

    /// The device did not answer within the configured timeouts
    #[error("Request to {url} timed out")]
    TransportTimeout { url: String },

    /// The connection could not be established
    #[error("Failed to connect to {url}: {message}")]
    TransportConnectionFailed { url: String, message: String },

    /// Any other transport-level failure
    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // HTTP / Response Errors
    // ─────────────────────────────────────────────────────────────

    #[error("Request to {url} was rejected: 401 Unauthorized")]
    HttpUnauthorized { url: String },

    #[error("Request to {url} was rejected: 403 Forbidden")]
    HttpForbidden { url: String },

    #[error("Request to {url} failed with HTTP {status}")]
    HttpOther { url: String, status: u16 },

    /// Response body was not the JSON we expected
    #[error("Malformed response from {url}: {message}")]
    MalformedResponse { url: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────

    /// The executor is blocked (teardown or reconnect in progress)
    #[error("Execution blocked: the request queue is not accepting work")]
    ExecutionBlocked,

    /// A queued task was dropped by `clear()` before it ran
    #[error("Task {task_id} was abandoned before execution")]
    TaskAbandoned { task_id: u64 },

    /// Requests are administratively paused
    #[error("Requests are disabled")]
    RequestsDisabled,

    /// The endpoint could not be turned into a URL
    #[error("Invalid endpoint '{endpoint}': {message}")]
    InvalidEndpoint { endpoint: String, message: String },

    /// The device answered an action without confirming it
    #[error("Action '{action}' was not confirmed by engine {engine}")]
    ActionRejected { action: String, engine: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,

            Error::TransportTimeout { .. } => ErrorCode::TransportTimeout,
            Error::TransportConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::Transport { .. } => ErrorCode::TransportFailed,

            Error::HttpUnauthorized { .. } => ErrorCode::HttpUnauthorized,
            Error::HttpForbidden { .. } => ErrorCode::HttpForbidden,
            Error::HttpOther { .. } => ErrorCode::HttpStatus,
            Error::MalformedResponse { .. } => ErrorCode::MalformedResponse,

            Error::ExecutionBlocked => ErrorCode::ExecutionBlocked,
            Error::TaskAbandoned { .. } => ErrorCode::TaskAbandoned,
            Error::RequestsDisabled => ErrorCode::RequestsDisabled,
            Error::InvalidEndpoint { .. } => ErrorCode::InvalidEndpoint,
            Error::ActionRejected { .. } => ErrorCode::ActionRejected,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Classify a request failure
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::TransportTimeout { .. } => ErrorClass::Timeout,
            Error::TransportConnectionFailed { .. } => ErrorClass::ConnectionRefused,
            Error::HttpUnauthorized { .. } => ErrorClass::Unauthorized,
            Error::HttpForbidden { .. } => ErrorClass::Forbidden,
            _ => ErrorClass::Other,
        }
    }

    /// The URL a request failure refers to, if any
    pub fn subject(&self) -> Option<&str> {
        match self {
            Error::TransportTimeout { url }
            | Error::TransportConnectionFailed { url, .. }
            | Error::Transport { url, .. }
            | Error::HttpUnauthorized { url }
            | Error::HttpForbidden { url }
            | Error::HttpOther { url, .. }
            | Error::MalformedResponse { url, .. } => Some(url),
            _ => None,
        }
    }

    /// Whether this error came back from the device or the network
    pub fn is_request_failure(&self) -> bool {
        self.subject().is_some()
    }

    /// Check if the error is worth retrying later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportTimeout { .. }
                | Error::TransportConnectionFailed { .. }
                | Error::Transport { .. }
                | Error::ExecutionBlocked
                | Error::TaskAbandoned { .. }
                | Error::RequestsDisabled
        ) || matches!(self, Error::HttpOther { status, .. } if *status >= 500)
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'realityhub-bridge config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'realityhub-bridge config validate' to see details."
            ),
            Error::ConfigValidation { .. } | Error::Config(_) => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::TransportTimeout { .. } => Some(
                "The RealityHub server did not answer in time. Check that it is running and reachable."
            ),
            Error::TransportConnectionFailed { .. } => Some(
                "Check the configured host address and your network connection."
            ),
            Error::HttpUnauthorized { .. } | Error::HttpForbidden { .. } => Some(
                "The RealityHub server rejected the request. Check the REST API permissions."
            ),
            Error::MalformedResponse { .. } => Some(
                "The server answered with unexpected data. Verify the RealityHub version is supported."
            ),
            Error::ActionRejected { .. } => Some(
                "Check that the node and function or property names exist on every selected engine."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            self.code().as_str(),
            self
        );

        if let Some(hint) = self.suggestion() {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::TransportConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(url: impl Into<String>) -> Self {
        Error::TransportTimeout { url: url.into() }
    }

    /// Map an HTTP status code onto the matching variant
    pub fn from_status(url: impl Into<String>, status: u16) -> Self {
        let url = url.into();
        match status {
            401 => Error::HttpUnauthorized { url },
            403 => Error::HttpForbidden { url },
            _ => Error::HttpOther { url, status },
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::TransportTimeout.as_str(), "E301");
        assert_eq!(ErrorCode::ExecutionBlocked.as_str(), "E500");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigValidation.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::ConnectionFailed.exit_code(), 30);
        assert_eq!(ErrorCode::HttpForbidden.exit_code(), 40);
        assert_eq!(ErrorCode::TaskAbandoned.exit_code(), 50);
        assert_eq!(ErrorCode::InternalError.exit_code(), 90);
    }

    #[test]
    fn test_classification() {
        assert_eq!(Error::timeout("http://h/x").class(), ErrorClass::Timeout);
        assert_eq!(
            Error::connection_failed("http://h/x", "refused").class(),
            ErrorClass::ConnectionRefused
        );
        assert_eq!(Error::from_status("u", 401).class(), ErrorClass::Unauthorized);
        assert_eq!(Error::from_status("u", 403).class(), ErrorClass::Forbidden);
        assert_eq!(Error::from_status("u", 404).class(), ErrorClass::Other);
        assert_eq!(Error::ExecutionBlocked.class(), ErrorClass::Other);
    }

    #[test]
    fn test_connection_fatal() {
        assert!(ErrorClass::Timeout.is_connection_fatal());
        assert!(ErrorClass::ConnectionRefused.is_connection_fatal());
        assert!(!ErrorClass::Unauthorized.is_connection_fatal());
        assert!(!ErrorClass::Forbidden.is_connection_fatal());
        assert!(!ErrorClass::Other.is_connection_fatal());
    }

    #[test]
    fn test_subject() {
        let err = Error::from_status("http://10.0.0.1/api/rest/v1/engines", 500);
        assert_eq!(err.subject(), Some("http://10.0.0.1/api/rest/v1/engines"));
        assert!(err.is_request_failure());
        assert!(err.is_retryable());

        assert_eq!(Error::ExecutionBlocked.subject(), None);
        assert!(!Error::RequestsDisabled.is_request_failure());
    }

    #[test]
    fn test_retryable() {
        assert!(Error::timeout("u").is_retryable());
        assert!(!Error::from_status("u", 404).is_retryable());
        assert!(!Error::config_not_found("/test").is_retryable());
    }

    #[test]
    fn test_format_for_terminal() {
        let formatted = Error::config_not_found("/test/bridge.toml").format_for_terminal();
        assert!(formatted.contains("E100"));
        assert!(formatted.contains("\x1b[31m"));
        assert!(formatted.contains("config init"));
    }

    #[test]
    fn test_format_for_log() {
        let formatted = Error::ExecutionBlocked.format_for_log();
        assert!(formatted.starts_with("[E500]"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }
}
