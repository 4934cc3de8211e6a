// src/error.rs - Gateway error taxonomy
use std::io;
use thiserror::Error;

/// Main gateway error type
#[derive(Error, Debug)]
pub enum GatewayError {
    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid configuration file '{path}': {reason}")]
    InvalidConfigFile { path: String, reason: String },

    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<String> },

    #[error("Configuration reload failed: {reason}")]
    ConfigReloadFailed { reason: String },

    #[error("Invalid path pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // Routing errors
    #[error("Malformed handshake: {reason}")]
    MalformedHandshake { reason: String },

    #[error("No rule matches on {listener} (identity: {identity:?})")]
    NoMatchingRule {
        listener: String,
        identity: Option<String>,
    },

    // Upstream and relay errors
    #[error("Failed to connect to upstream '{target}': {reason}")]
    UpstreamConnectFailed { target: String, reason: String },

    #[error("Connection reset by peer: {message}")]
    PeerReset { message: String },

    #[error("Peer timed out: {operation}")]
    PeerTimeout { operation: String },

    // Transport errors
    #[error("TLS error: {message}")]
    Tls { message: String },

    #[error("Failed to bind to address '{address}': {reason}")]
    Bind { address: String, reason: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    // Serialization errors
    #[error("YAML parsing error: {message}")]
    Yaml { message: String },

    #[error("JSON parsing error: {message}")]
    Json { message: String },
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Routing,
    Upstream,
    Relay,
    Transport,
    Parsing,
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl GatewayError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::Config { .. }
            | GatewayError::InvalidConfigFile { .. }
            | GatewayError::ConfigValidation { .. }
            | GatewayError::ConfigReloadFailed { .. }
            | GatewayError::InvalidPattern { .. } => ErrorCategory::Configuration,

            GatewayError::MalformedHandshake { .. } | GatewayError::NoMatchingRule { .. } => {
                ErrorCategory::Routing
            }

            GatewayError::UpstreamConnectFailed { .. } => ErrorCategory::Upstream,

            GatewayError::PeerReset { .. } | GatewayError::PeerTimeout { .. } => {
                ErrorCategory::Relay
            }

            GatewayError::Tls { .. } | GatewayError::Bind { .. } | GatewayError::Io { .. } => {
                ErrorCategory::Transport
            }

            GatewayError::Yaml { .. } | GatewayError::Json { .. } => ErrorCategory::Parsing,
        }
    }

    /// Get the HTTP status code that should be returned for this error
    pub fn http_status_code(&self) -> u16 {
        match self {
            GatewayError::MalformedHandshake { .. } => 400, // Bad Request

            GatewayError::NoMatchingRule { .. } => 404, // Not Found

            GatewayError::UpstreamConnectFailed { .. } | GatewayError::PeerReset { .. } => 502, // Bad Gateway

            GatewayError::PeerTimeout { .. } => 504, // Gateway Timeout

            _ => 500, // Default to Internal Server Error
        }
    }

    /// Check if the error only affects a single connection
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GatewayError::MalformedHandshake { .. }
                | GatewayError::NoMatchingRule { .. }
                | GatewayError::UpstreamConnectFailed { .. }
                | GatewayError::PeerReset { .. }
                | GatewayError::PeerTimeout { .. }
                | GatewayError::ConfigReloadFailed { .. }
                | GatewayError::Tls { .. }
        )
    }

    /// Get the log level for this error
    pub fn log_level(&self) -> LogLevel {
        match self {
            GatewayError::Config { .. }
            | GatewayError::InvalidConfigFile { .. }
            | GatewayError::ConfigValidation { .. }
            | GatewayError::Bind { .. } => LogLevel::Error,

            GatewayError::ConfigReloadFailed { .. }
            | GatewayError::UpstreamConnectFailed { .. }
            | GatewayError::Tls { .. } => LogLevel::Warn,

            GatewayError::PeerReset { .. } | GatewayError::PeerTimeout { .. } => LogLevel::Info,

            GatewayError::MalformedHandshake { .. } | GatewayError::NoMatchingRule { .. } => {
                LogLevel::Debug
            }

            _ => LogLevel::Warn,
        }
    }

    /// Emit this error through `tracing` at its own level.
    pub fn log(&self, context: &str) {
        match self.log_level() {
            LogLevel::Error => tracing::error!(category = ?self.category(), "{}: {}", context, self),
            LogLevel::Warn => tracing::warn!(category = ?self.category(), "{}: {}", context, self),
            LogLevel::Info => tracing::info!(category = ?self.category(), "{}: {}", context, self),
            LogLevel::Debug => tracing::debug!(category = ?self.category(), "{}: {}", context, self),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        GatewayError::Config {
            message: message.into(),
        }
    }

    pub fn tls<S: Into<String>>(message: S) -> Self {
        GatewayError::Tls {
            message: message.into(),
        }
    }

    pub fn upstream<T: Into<String>, R: ToString>(target: T, reason: R) -> Self {
        GatewayError::UpstreamConnectFailed {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

/// Conversion implementations from common error types
impl From<io::Error> for GatewayError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => GatewayError::PeerReset {
                message: err.to_string(),
            },
            io::ErrorKind::TimedOut => GatewayError::PeerTimeout {
                operation: err.to_string(),
            },
            _ => GatewayError::Io {
                message: err.to_string(),
            },
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        GatewayError::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Json {
            message: err.to_string(),
        }
    }
}

impl From<rustls::Error> for GatewayError {
    fn from(err: rustls::Error) -> Self {
        GatewayError::Tls {
            message: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        GatewayError::PeerTimeout {
            operation: "async operation".to_string(),
        }
    }
}
