//! Error types for webwire.
//!
//! RPC failures are [`RpcError`] values carrying a [`Code`] from the
//! standard RPC taxonomy, a human-readable message, and optional
//! structured details. Adapters render them onto the wire (Connect:
//! in-body JSON, gRPC: trailers); everything returned by conn
//! operations is an `RpcError`.

use thiserror::Error;

/// RPC status codes, mirroring the standard gRPC code set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    /// The operation was cancelled by the caller.
    Canceled = 1,
    /// Unknown error, or an error that has no better code.
    Unknown = 2,
    /// The client supplied an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired before the operation completed.
    DeadlineExceeded = 4,
    /// The requested entity was not found.
    NotFound = 5,
    /// The entity already exists.
    AlreadyExists = 6,
    /// The caller lacks permission.
    PermissionDenied = 7,
    /// A resource (quota, message size) has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The operation is not implemented or supported.
    Unimplemented = 12,
    /// An invariant expected by the framework was broken.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request lacks valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Snake-case name used by the Connect wire encoding.
    pub fn name(self) -> &'static str {
        match self {
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }

    /// Numeric value used by the gRPC wire encoding (`grpc-status`).
    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Parse a numeric gRPC status value. Out-of-range values map to
    /// [`Code::Unknown`].
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Code::Canceled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    /// Parse the snake-case Connect name. Unrecognized names map to
    /// [`Code::Unknown`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "canceled" => Code::Canceled,
            "unknown" => Code::Unknown,
            "invalid_argument" => Code::InvalidArgument,
            "deadline_exceeded" => Code::DeadlineExceeded,
            "not_found" => Code::NotFound,
            "already_exists" => Code::AlreadyExists,
            "permission_denied" => Code::PermissionDenied,
            "resource_exhausted" => Code::ResourceExhausted,
            "failed_precondition" => Code::FailedPrecondition,
            "aborted" => Code::Aborted,
            "out_of_range" => Code::OutOfRange,
            "unimplemented" => Code::Unimplemented,
            "internal" => Code::Internal,
            "unavailable" => Code::Unavailable,
            "data_loss" => Code::DataLoss,
            "unauthenticated" => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A structured RPC error.
///
/// Every error surfaced by conn operations and handler implementations
/// is an `RpcError`; the selected protocol adapter decides how it
/// reaches the wire.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    code: Code,
    message: String,
    details: Vec<serde_json::Value>,
}

impl RpcError {
    /// Create a new error with the given code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Get the status code.
    #[inline]
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the human-readable message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Structured details attached to this error.
    #[inline]
    pub fn details(&self) -> &[serde_json::Value] {
        &self.details
    }

    /// Attach a structured detail value.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.details.push(detail);
        self
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        // Opaque I/O failures have no better classification.
        RpcError::new(Code::Unknown, err.to_string())
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
