//! Error taxonomy for the load engine.
//!
//! Step-scoped errors become fields on the step report and never abort the
//! run; engine-scoped errors terminate the run with a single summary error.

use serde::Serialize;
use thiserror::Error;

/// Transport-level failure sub-kinds, mirroring the phases of an HTTP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Dns,
    Connect,
    Tls,
    Read,
    Write,
    ProxyConnect,
    Other,
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Dns => "dns",
            TransportKind::Connect => "connect",
            TransportKind::Tls => "tls",
            TransportKind::Read => "read",
            TransportKind::Write => "write",
            TransportKind::ProxyConnect => "proxy_connect",
            TransportKind::Other => "other",
        }
    }
}

/// Step-scoped error kinds recorded on step reports.
///
/// `Timeout`, `Transport` and `ResponseTooLarge` are recoverable: the
/// iteration continues with the next step unless the step sets
/// `abort-on-fail`. `TargetInvalid` aborts the iteration; `Cancelled`
/// terminates the whole run cleanly.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("invalid target: {0}")]
    TargetInvalid(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport error ({}): {message}", kind.label())]
    Transport {
        kind: TransportKind,
        message: String,
    },

    #[error("response body exceeded {limit_bytes} bytes")]
    ResponseTooLarge { limit_bytes: usize },

    #[error("run cancelled")]
    Cancelled,
}

impl ErrorKind {
    /// Stable label used for summary aggregation.
    pub fn label(&self) -> String {
        match self {
            ErrorKind::TargetInvalid(_) => "target_invalid".into(),
            ErrorKind::Timeout => "timeout".into(),
            ErrorKind::Transport { kind, .. } => format!("transport_{}", kind.label()),
            ErrorKind::ResponseTooLarge { .. } => "response_too_large".into(),
            ErrorKind::Cancelled => "cancelled".into(),
        }
    }

    /// True when the iteration cannot meaningfully continue past this step.
    pub fn aborts_iteration(&self) -> bool {
        matches!(self, ErrorKind::TargetInvalid(_) | ErrorKind::Cancelled)
    }

    /// Classify a reqwest error into the transport taxonomy.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return ErrorKind::Timeout;
        }

        let message = error.to_string();
        let lower = message.to_lowercase();

        let kind = if error.is_connect() {
            if lower.contains("dns") || lower.contains("resolve") {
                TransportKind::Dns
            } else if lower.contains("certificate") || lower.contains("tls") {
                TransportKind::Tls
            } else if lower.contains("proxy") {
                TransportKind::ProxyConnect
            } else {
                TransportKind::Connect
            }
        } else if error.is_body() || error.is_decode() {
            TransportKind::Read
        } else if error.is_request() {
            TransportKind::Write
        } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
            TransportKind::Tls
        } else if lower.contains("dns") || lower.contains("resolve") {
            TransportKind::Dns
        } else if lower.contains("proxy") {
            TransportKind::ProxyConnect
        } else {
            TransportKind::Other
        };

        ErrorKind::Transport { kind, message }
    }
}

/// Fatal configuration errors raised while building the plan.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid plan document: {0}")]
    InvalidDocument(#[from] serde_json::Error),

    #[error("plan has no steps")]
    NoSteps,

    #[error("{field} must be positive")]
    NonPositive { field: &'static str },

    #[error("step {step_id}: invalid url '{url}': {message}")]
    InvalidUrl {
        step_id: u16,
        url: String,
        message: String,
    },

    #[error("step {step_id}: invalid method '{method}'")]
    InvalidMethod { step_id: u16, method: String },

    #[error("step {step_id}: invalid sleep spec '{sleep}'")]
    InvalidSleep { step_id: u16, sleep: String },

    #[error("step {step_id}: invalid assertion '{rule}': {message}")]
    InvalidAssertion {
        step_id: u16,
        rule: String,
        message: String,
    },

    #[error("step {step_id}: duplicate step id")]
    DuplicateStepId { step_id: u16 },

    #[error("unknown load type '{0}'")]
    UnknownLoadType(String),

    #[error("unknown output destination '{0}'")]
    UnknownOutput(String),

    #[error("invalid proxy url '{url}': {message}")]
    InvalidProxy { url: String, message: String },

    #[error("failed to read payload file '{path}': {message}")]
    PayloadFile { path: String, message: String },

    #[error("multipart part '{name}': {message}")]
    Multipart { name: String, message: String },

    #[error("step {step_id}: capture '{name}': {message}")]
    Capture {
        step_id: u16,
        name: String,
        message: String,
    },

    #[error("tls material for step {step_id}: {message}")]
    TlsMaterial { step_id: u16, message: String },

    #[error("csv source '{name}': {message}")]
    CsvSource { name: String, message: String },

    #[error("failed to read config file '{path}': {message}")]
    Io { path: String, message: String },
}

/// Engine-scoped runtime failures.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("report sink failed: {0}")]
    Sink(String),

    #[error("result pipeline task failed: {0}")]
    PipelineJoin(String),
}
