//! Error types for the conformance harness
//!
//! Wire-level failures (framing, handshake, compression) and harness-level
//! failures (configuration, case selection, malformed stimulus commands,
//! result storage) share one [`Error`] type so the connection actor and the
//! sequencer can propagate either with `?`.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type alias for harness operations
pub type Result<T> = std::result::Result<T, Error>;

/// Harness error types
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(io::Error),
    /// Invalid WebSocket frame
    #[error("Invalid frame: {0}")]
    InvalidFrame(&'static str),
    /// Invalid UTF-8 in text message or close reason
    #[error("Invalid UTF-8 in text payload")]
    InvalidUtf8,
    /// Protocol violation by the peer
    #[error("Protocol error: {0}")]
    Protocol(&'static str),
    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,
    /// Connection reset by peer
    #[error("Connection reset by peer")]
    ConnectionReset,
    /// Frame exceeds the configured maximum
    #[error("Frame too large")]
    FrameTooLarge,
    /// Invalid HTTP request or response during the opening handshake
    #[error("Invalid HTTP: {0}")]
    InvalidHttp(String),
    /// Opening handshake rejected
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    /// Opening handshake did not complete in time
    #[error("Opening handshake timed out")]
    HandshakeTimeout,
    /// Invalid close code
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),
    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),
    /// Spec or command-line configuration is unusable
    #[error(transparent)]
    Configuration(#[from] ConfigurationErrors),
    /// A connection asked for a case that cannot be run
    #[error(transparent)]
    CaseSelection(#[from] CaseSelectionError),
    /// A direct-control command could not be interpreted
    #[error(transparent)]
    Stimulus(#[from] ProtocolStimulusError),
    /// A case hook hit an internal inconsistency
    #[error("Case internal error: {0}")]
    CaseInternal(String),
    /// Result persistence failed
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Malformed or unexpected WAMP message
    #[error("WAMP error: {0}")]
    Wamp(String),
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may appear on the wire per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

// ============================================================================
// Harness error families
// ============================================================================

/// A single problem found while validating a spec or the command line
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// Spec JSON could not be parsed at all
    #[error("malformed spec: {0}")]
    MalformedSpec(String),
    /// A case pattern is not a dotted list of integers and wildcards
    #[error("invalid case pattern '{0}'")]
    InvalidPattern(String),
    /// A literal case id names no case in the catalog
    #[error("case '{0}' not found in catalog")]
    UnknownCase(String),
    /// Unknown test mode
    #[error("unknown mode '{0}'")]
    UnknownMode(String),
    /// A key required by the selected mode is missing
    #[error("missing required field '{0}'")]
    MissingField(String),
    /// A key is present but its value is unusable
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
    /// The spec names a case set this build does not provide
    #[error("unsupported case set '{0}'")]
    UnsupportedCaseSet(String),
}

/// All configuration problems found in one validation pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationErrors(pub Vec<ConfigurationError>);

impl ConfigurationErrors {
    /// Turn a validation result into `Ok(())` when nothing was reported
    pub fn check(errors: Vec<ConfigurationError>) -> Result<()> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(ConfigurationErrors(errors)))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigurationError> {
        self.0.iter()
    }
}

impl From<ConfigurationError> for ConfigurationErrors {
    fn from(e: ConfigurationError) -> Self {
        ConfigurationErrors(vec![e])
    }
}

impl From<ConfigurationError> for Error {
    fn from(e: ConfigurationError) -> Self {
        Error::Configuration(e.into())
    }
}

impl fmt::Display for ConfigurationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "configuration error"),
            [single] => write!(f, "configuration error: {}", single),
            many => {
                write!(f, "{} configuration errors:", many.len())?;
                for e in many {
                    write!(f, "\n  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigurationErrors {}

/// A connection requested a case that cannot be run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaseSelectionError {
    /// Numeric case index outside `1..=count`
    #[error("case {requested} not found (server has {count} cases)")]
    OutOfRange { requested: usize, count: usize },
    /// Case id that is not in the catalog
    #[error("case {0} not found")]
    UnknownCaseId(String),
    /// `case` parameter is not a number
    #[error("invalid case parameter '{0}'")]
    InvalidParameter(String),
    /// Case run requested without an agent
    #[error("case run requested without agent")]
    MissingAgent,
}

/// A direct-control command could not be executed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolStimulusError {
    /// Commands must be text frames
    #[error("binary command message")]
    BinaryCommand,
    /// Payload is not a `[name, params]` JSON array
    #[error("could not parse command: {0}")]
    Unparseable(String),
    /// Unknown command name
    #[error("fuzzing peer received unknown command '{0}'")]
    UnknownCommand(String),
    /// A required field is missing
    #[error("command '{command}' is missing field '{field}'")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },
    /// A field has the wrong type or range
    #[error("command '{command}' has invalid field '{field}': {reason}")]
    InvalidField {
        command: &'static str,
        field: &'static str,
        reason: String,
    },
}

/// Result persistence failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("no such test run {0}")]
    NoSuchRun(String),
    #[error("test run {0} already closed")]
    RunClosed(String),
    #[error("storage I/O failed: {0}")]
    Io(String),
}

impl Error {
    /// Check if this error is a timeout
    #[inline]
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::TimedOut,
            Error::HandshakeTimeout => true,
            _ => false,
        }
    }

    /// Get a short, lowercase name for structured log fields
    pub fn metric_name(&self) -> &'static str {
        match self {
            Error::Io(_) => "io_error",
            Error::InvalidFrame(_) => "invalid_frame",
            Error::InvalidUtf8 => "invalid_utf8",
            Error::Protocol(_) => "protocol_error",
            Error::ConnectionClosed => "connection_closed",
            Error::ConnectionReset => "connection_reset",
            Error::FrameTooLarge => "frame_too_large",
            Error::InvalidHttp(_) => "invalid_http",
            Error::HandshakeFailed(_) => "handshake_failed",
            Error::HandshakeTimeout => "handshake_timeout",
            Error::InvalidCloseCode(_) => "invalid_close_code",
            Error::Compression(_) => "compression_error",
            Error::Configuration(_) => "configuration_error",
            Error::CaseSelection(_) => "case_selection_error",
            Error::Stimulus(_) => "protocol_stimulus_error",
            Error::CaseInternal(_) => "case_internal_error",
            Error::Storage(_) => "storage_error",
            Error::Json(_) => "json_error",
            Error::Wamp(_) => "wamp_error",
        }
    }

    /// Close code to send when this error fails a connection
    pub fn close_code(&self) -> u16 {
        match self {
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::FrameTooLarge => CloseReason::TOO_BIG,
            Error::Compression(_) => CloseReason::INVALID_PAYLOAD,
            Error::CaseInternal(_) | Error::Storage(_) => CloseReason::INTERNAL,
            _ => CloseReason::PROTOCOL_ERROR,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset => Error::ConnectionReset,
            io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl From<StorageError> for io::Error {
    fn from(e: StorageError) -> Self {
        io::Error::other(e.to_string())
    }
}
