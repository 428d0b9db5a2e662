use std::error::Error;
use std::fmt::{Display, Formatter};

/// Reason attached to an `InvalidData` error, narrowing down which
/// validation step rejected the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidDataReason {
    SerializationFailure,
    InvalidFilter,
    InvalidDocument,
    InvalidIdentifierFormat,
    InvalidKeyPath,
    InvalidLimit,
}

impl InvalidDataReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidDataReason::SerializationFailure => "serialization-failure",
            InvalidDataReason::InvalidFilter => "invalid-filter",
            InvalidDataReason::InvalidDocument => "invalid-document",
            InvalidDataReason::InvalidIdentifierFormat => "invalid-identifier-format",
            InvalidDataReason::InvalidKeyPath => "invalid-key-path",
            InvalidDataReason::InvalidLimit => "invalid-limit",
        }
    }
}

/// Reason attached to an `ExecutionFailed` error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionFailure {
    WriteConflict,
    Aborted,
}

impl ExecutionFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionFailure::WriteConflict => "write-conflict",
            ExecutionFailure::Aborted => "aborted",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NimbusErrorCode {
    PermissionDenied,
    Server,
    InvalidRequest,
    ConnectionTerminated,
    InvalidData(InvalidDataReason),
    Timeout,
    InvalidAuthToken,
    ExecutionFailed(ExecutionFailure),
    Default,
}

impl NimbusErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NimbusErrorCode::PermissionDenied => "nimbusdb/permission-denied",
            NimbusErrorCode::Server => "nimbusdb/server-error",
            NimbusErrorCode::InvalidRequest => "nimbusdb/invalid-request",
            NimbusErrorCode::ConnectionTerminated => "nimbusdb/connection-terminated",
            NimbusErrorCode::InvalidData(_) => "nimbusdb/invalid-data",
            NimbusErrorCode::Timeout => "nimbusdb/timeout",
            NimbusErrorCode::InvalidAuthToken => "nimbusdb/invalid-auth-token",
            NimbusErrorCode::ExecutionFailed(_) => "nimbusdb/execution-failed",
            NimbusErrorCode::Default => "nimbusdb/error",
        }
    }

    /// The `err-type` token carried on the wire for this code.
    pub fn wire_str(&self) -> &'static str {
        match self {
            NimbusErrorCode::PermissionDenied => "permission-denied",
            NimbusErrorCode::Server => "server-error",
            NimbusErrorCode::InvalidRequest => "invalid-request",
            NimbusErrorCode::ConnectionTerminated => "connection-terminated",
            NimbusErrorCode::InvalidData(_) => "invalid-data",
            NimbusErrorCode::Timeout => "timeout",
            NimbusErrorCode::InvalidAuthToken => "invalid-auth-token",
            NimbusErrorCode::ExecutionFailed(_) => "execution-failed",
            NimbusErrorCode::Default => "error",
        }
    }

    pub(crate) fn from_wire(token: &str) -> Self {
        match token {
            "permission-denied" => NimbusErrorCode::PermissionDenied,
            "server-error" => NimbusErrorCode::Server,
            "invalid-request" => NimbusErrorCode::InvalidRequest,
            "connection-terminated" => NimbusErrorCode::ConnectionTerminated,
            "invalid-data" => {
                NimbusErrorCode::InvalidData(InvalidDataReason::SerializationFailure)
            }
            "timeout" => NimbusErrorCode::Timeout,
            "invalid-auth-token" => NimbusErrorCode::InvalidAuthToken,
            "write-conflict" => {
                NimbusErrorCode::ExecutionFailed(ExecutionFailure::WriteConflict)
            }
            _ => NimbusErrorCode::Default,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NimbusError {
    pub code: NimbusErrorCode,
    message: String,
}

impl NimbusError {
    pub fn new(code: NimbusErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_write_conflict(&self) -> bool {
        matches!(
            self.code,
            NimbusErrorCode::ExecutionFailed(ExecutionFailure::WriteConflict)
        )
    }
}

impl Display for NimbusError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for NimbusError {}

pub type NimbusResult<T> = Result<T, NimbusError>;

pub fn permission_denied(message: impl Into<String>) -> NimbusError {
    NimbusError::new(NimbusErrorCode::PermissionDenied, message)
}

pub fn server_error(message: impl Into<String>) -> NimbusError {
    NimbusError::new(NimbusErrorCode::Server, message)
}

pub fn invalid_request(message: impl Into<String>) -> NimbusError {
    NimbusError::new(NimbusErrorCode::InvalidRequest, message)
}

pub fn connection_terminated(message: impl Into<String>) -> NimbusError {
    NimbusError::new(NimbusErrorCode::ConnectionTerminated, message)
}

pub fn invalid_data(reason: InvalidDataReason, message: impl Into<String>) -> NimbusError {
    NimbusError::new(NimbusErrorCode::InvalidData(reason), message)
}

pub fn timeout(message: impl Into<String>) -> NimbusError {
    NimbusError::new(NimbusErrorCode::Timeout, message)
}

pub fn invalid_auth_token(message: impl Into<String>) -> NimbusError {
    NimbusError::new(NimbusErrorCode::InvalidAuthToken, message)
}

pub fn execution_failed(failure: ExecutionFailure, message: impl Into<String>) -> NimbusError {
    NimbusError::new(NimbusErrorCode::ExecutionFailed(failure), message)
}

pub fn default_error(message: impl Into<String>) -> NimbusError {
    NimbusError::new(NimbusErrorCode::Default, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_strings_are_namespaced() {
        assert_eq!(
            permission_denied("no access").code_str(),
            "nimbusdb/permission-denied"
        );
        assert_eq!(
            invalid_data(InvalidDataReason::InvalidLimit, "too big").code_str(),
            "nimbusdb/invalid-data"
        );
    }

    #[test]
    fn wire_tokens_round_trip() {
        for code in [
            NimbusErrorCode::PermissionDenied,
            NimbusErrorCode::Server,
            NimbusErrorCode::InvalidRequest,
            NimbusErrorCode::ConnectionTerminated,
            NimbusErrorCode::Timeout,
            NimbusErrorCode::InvalidAuthToken,
        ] {
            assert_eq!(NimbusErrorCode::from_wire(code.wire_str()), code);
        }
        assert_eq!(
            NimbusErrorCode::from_wire("something-new"),
            NimbusErrorCode::Default
        );
    }

    #[test]
    fn write_conflict_is_detectable() {
        let err = execution_failed(ExecutionFailure::WriteConflict, "etag mismatch");
        assert!(err.is_write_conflict());
        let err = execution_failed(ExecutionFailure::Aborted, "caller aborted");
        assert!(!err.is_write_conflict());
    }
}
