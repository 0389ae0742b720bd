//! Error taxonomy shared by every surface of the service.
//!
//! Each module owns its own `thiserror` enum; all of them map onto an
//! [`ErrorKind`] so responses can be built without inspecting messages.

use serde::{Deserialize, Serialize};

/// Wire-visible error classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The model backend failed to initialize at process start
    BackendUnavailable,
    /// Model or adapter files are missing
    ModelNotFound,
    /// Any other backend failure while loading or unloading
    LoadFailed,
    /// The operation needs a loaded model
    NoModelLoaded,
    /// Schema or validation failure in the request
    InvalidRequest,
    /// No persisted or live cache to operate on
    CacheNotFound,
    /// The cache type cannot perform the operation (e.g. trim)
    CacheUnsupportedOperation,
    /// The backend raised while decoding
    DecodeFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::ModelNotFound => "model_not_found",
            ErrorKind::LoadFailed => "load_failed",
            ErrorKind::NoModelLoaded => "no_model_loaded",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::CacheNotFound => "cache_not_found",
            ErrorKind::CacheUnsupportedOperation => "cache_unsupported_operation",
            ErrorKind::DecodeFailure => "decode_failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_like_display() {
        let json = serde_json::to_string(&ErrorKind::CacheUnsupportedOperation).unwrap();
        assert_eq!(json, "\"cache_unsupported_operation\"");
        assert_eq!(ErrorKind::NoModelLoaded.to_string(), "no_model_loaded");
    }
}
