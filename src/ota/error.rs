use std::fmt;

use super::download::should_retry;
use crate::platform::{ImageKind, PlatformError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaError {
    // Configuration
    NoUpdateUrl,
    InvalidJson(String),
    MissingField(&'static str),
    NoMatchingAsset(&'static str),
    NoUpdateAvailable,
    MissingAssetUrls,

    // Network
    HttpStatus(u16),
    Transport(String),
    MissingContentLength,

    // Space
    NoTargetPartition,
    ImageTooLarge { size: usize, capacity: usize },
    BeginRejected(PlatformError),

    // Stream
    Incomplete { kind: ImageKind, written: usize, expected: usize },
    HeaderTimeout,
    InvalidBundle(&'static str),

    // Resource
    LowHeap { free: usize },

    // Flash
    FinalizeFailed(PlatformError),
    SetBootFailed(PlatformError),
}

impl OtaError {
    /// Worth another attempt: the image was partially transferred.
    pub fn is_retryable(&self) -> bool {
        match self {
            OtaError::Incomplete { written, expected, .. } => should_retry(*written, *expected),
            _ => false,
        }
    }

    /// Short text for the progress display.
    pub fn display_message(&self) -> &'static str {
        match self {
            OtaError::NoUpdateUrl
            | OtaError::InvalidJson(_)
            | OtaError::MissingField(_)
            | OtaError::NoMatchingAsset(_)
            | OtaError::MissingAssetUrls => "Update config error",
            OtaError::NoUpdateAvailable => "No update available",
            OtaError::HttpStatus(_) | OtaError::Transport(_) | OtaError::MissingContentLength => {
                "Download failed"
            }
            OtaError::NoTargetPartition
            | OtaError::ImageTooLarge { .. }
            | OtaError::BeginRejected(_) => "Not enough space",
            OtaError::Incomplete { .. } | OtaError::HeaderTimeout | OtaError::InvalidBundle(_) => {
                "Download incomplete"
            }
            OtaError::LowHeap { .. } => "Low memory",
            OtaError::FinalizeFailed(_) => "Verify failed",
            OtaError::SetBootFailed(_) => "Boot switch failed",
        }
    }
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaError::NoUpdateUrl => write!(f, "no update URL configured"),
            OtaError::InvalidJson(e) => write!(f, "invalid JSON: {}", e),
            OtaError::MissingField(field) => write!(f, "missing field '{}'", field),
            OtaError::NoMatchingAsset(role) => write!(f, "no {} asset for this board", role),
            OtaError::NoUpdateAvailable => write!(f, "no update available"),
            OtaError::MissingAssetUrls => write!(f, "firmware and filesystem URLs are required"),
            OtaError::HttpStatus(code) => write!(f, "HTTP status {}", code),
            OtaError::Transport(e) => write!(f, "transport error: {}", e),
            OtaError::MissingContentLength => write!(f, "missing content length"),
            OtaError::NoTargetPartition => write!(f, "no OTA partition available"),
            OtaError::ImageTooLarge { size, capacity } => {
                write!(f, "image of {} bytes exceeds partition of {} bytes", size, capacity)
            }
            OtaError::BeginRejected(e) => write!(f, "update begin rejected: {}", e),
            OtaError::Incomplete {
                kind,
                written,
                expected,
            } => write!(
                f,
                "{} download incomplete ({}/{} bytes)",
                kind.as_str(),
                written,
                expected
            ),
            OtaError::HeaderTimeout => write!(f, "timed out reading bundle header"),
            OtaError::InvalidBundle(reason) => write!(f, "invalid bundle: {}", reason),
            OtaError::LowHeap { free } => write!(f, "low heap ({} bytes free)", free),
            OtaError::FinalizeFailed(e) => write!(f, "image finalize failed: {}", e),
            OtaError::SetBootFailed(e) => write!(f, "failed to set boot partition: {}", e),
        }
    }
}

impl std::error::Error for OtaError {}

impl From<PlatformError> for OtaError {
    fn from(e: PlatformError) -> Self {
        OtaError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for OtaError {
    fn from(e: serde_json::Error) -> Self {
        OtaError::InvalidJson(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_mention_sizes() {
        let err = OtaError::Incomplete {
            kind: ImageKind::Firmware,
            written: 10,
            expected: 20,
        };
        assert_eq!(err.to_string(), "firmware download incomplete (10/20 bytes)");
        assert_eq!(err.display_message(), "Download incomplete");
    }

    #[test]
    fn only_partial_downloads_are_retryable() {
        let partial = OtaError::Incomplete {
            kind: ImageKind::Filesystem,
            written: 5,
            expected: 20,
        };
        let empty = OtaError::Incomplete {
            kind: ImageKind::Filesystem,
            written: 0,
            expected: 20,
        };
        assert!(partial.is_retryable());
        assert!(!empty.is_retryable());
        assert!(!OtaError::HttpStatus(404).is_retryable());
    }

    #[test]
    fn json_errors_convert() {
        let err: OtaError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert!(matches!(err, OtaError::InvalidJson(_)));
    }
}
