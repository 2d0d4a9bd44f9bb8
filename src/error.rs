//! Error types for stagehand
//!
//! This module separates the three kinds of failure the orchestrator deals with:
//! - Protocol errors on the control plane (malformed or mismatched messages)
//! - Fatal pipeline errors that abort the remaining phases
//! - General infrastructure errors (I/O, configuration, transport)
//!
//! Per-item failures of external workers are not errors. They are recorded as
//! [`ItemOutcome::Failed`](crate::types::ItemOutcome) values and a failed page
//! never cancels its siblings.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for stagehand operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for stagehand
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "parallelism.extractor")
        key: Option<String>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Control-plane socket error (bind, receive, send)
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed control-plane message
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Fatal pipeline failure
    #[error("pipeline aborted: {0}")]
    Pipeline(#[from] PipelineError),

    /// External tool could not be located or launched
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Returns true if this error must stop the pipeline.
    ///
    /// Protocol errors only affect a single message and never abort a run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Protocol(_))
    }

    /// Machine-readable error code used in log fields
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::Transport(_) => "transport_error",
            Error::Protocol(_) => "protocol_error",
            Error::Pipeline(_) => "pipeline_aborted",
            Error::ExternalTool(_) => "external_tool_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<zeromq::ZmqError> for Error {
    fn from(e: zeromq::ZmqError) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Control-plane decoding errors
///
/// Every variant carries the (upper-cased) tag of the offending message so log
/// lines can be correlated with the worker that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Fewer than the four envelope frames were received
    #[error("message has {frames} frames, at least 4 required")]
    MessageTooShort {
        /// Number of frames actually received
        frames: usize,
    },

    /// The tag is not part of the protocol
    #[error("unknown tag {0:?}")]
    UnknownTag(String),

    /// A required argument frame is absent
    #[error("{tag}: missing argument #{index}")]
    MissingArgument {
        /// Message tag
        tag: String,
        /// Zero-based argument index
        index: usize,
    },

    /// A fixed-width integer argument has the wrong size
    #[error("{tag}: argument #{index} is {actual} bytes, expected {expected}")]
    InvalidLength {
        /// Message tag
        tag: String,
        /// Zero-based argument index
        index: usize,
        /// Expected width in bytes
        expected: usize,
        /// Received width in bytes
        actual: usize,
    },

    /// A string argument is not valid UTF-8
    #[error("{tag}: argument #{index} is not valid UTF-8")]
    InvalidUtf8 {
        /// Message tag
        tag: String,
        /// Zero-based argument index
        index: usize,
    },
}

/// Fatal pipeline failures
///
/// Any of these stops the run: no later phase is started.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The member list file could not be read
    #[error("failed to read list file {path}: {reason}")]
    ListFileUnreadable {
        /// List file path
        path: PathBuf,
        /// Underlying reason
        reason: String,
    },

    /// The member-data extraction could not be launched or exited with a failure
    #[error("member data extraction failed: {0}")]
    MemberDataExtractionFailed(String),

    /// The member-data extraction did not produce its dump file
    #[error("member data dump {path} was not produced")]
    MemberDataMissing {
        /// Expected dump path
        path: PathBuf,
    },

    /// The member-data dump exists but could not be read
    #[error("failed to read member data dump {path}: {reason}")]
    MemberDataUnreadable {
        /// Dump path
        path: PathBuf,
        /// Underlying reason
        reason: String,
    },

    /// One of the control-plane endpoints could not be bound
    #[error("failed to start control plane: {0}")]
    ControlPlaneStartup(String),

    /// Neither the extractor executable nor its script is available
    #[error("extractor unavailable: {0}")]
    ExtractorUnavailable(String),

    /// The run was cancelled before completion
    #[error("run cancelled")]
    Cancelled,
}
