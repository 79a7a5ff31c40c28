//! Error types for client and multipart-engine operations

use std::io;
use thiserror::Error;

/// Result type alias for nimbus operations
pub type NimbusResult<T> = Result<T, NimbusError>;

/// Errors that can occur during object storage operations
#[derive(Error, Debug)]
pub enum NimbusError {
    /// AWS SDK error
    #[error("SDK error: {0}")]
    Sdk(String),

    /// S3 service error with specific error code
    #[error("service error ({code}): {message}")]
    Service { code: String, message: String },

    /// Object not found in bucket
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Bucket not found or not accessible
    #[error("bucket not found or not accessible: {0}")]
    BucketNotFound(String),

    /// Access denied error
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Object size exceeds what the part geometry can cover
    #[error("entity too large: {size} bytes exceeds maximum of {max} bytes")]
    EntityTooLarge { size: u64, max: u64 },

    /// Caller-supplied part size outside protocol bounds
    #[error("invalid part size {size}: must be within [{min}, {max}]")]
    InvalidPartSize { size: u64, min: u64, max: u64 },

    /// Streaming source produced more parts than the protocol allows
    #[error("source exceeds the maximum of {max} parts before EOF")]
    TooManyParts { max: u64 },

    /// A part upload failed; the session is left open so the caller can
    /// resume it with the embedded upload id.
    #[error("upload of part {part_number} failed (upload id {upload_id}): {source}")]
    PartUpload {
        part_number: i32,
        upload_id: String,
        #[source]
        source: Box<NimbusError>,
    },

    /// Bytes uploaded disagree with the declared object size
    #[error("unexpected EOF: uploaded {actual} bytes of declared {expected}")]
    UnexpectedEof { expected: u64, actual: u64 },

    /// Completion manifest disagrees with the planned part count
    #[error("invalid parts: manifest has {actual} parts, plan requires {expected}")]
    InvalidPartCount { expected: u64, actual: u64 },

    /// Server accepted the initiate request but returned no upload id
    #[error("no upload id returned for {bucket}/{key}")]
    MissingUploadId { bucket: String, key: String },

    /// Server accepted a part but returned no ETag
    #[error("no ETag returned for part {part_number}")]
    MissingEtag { part_number: i32 },

    /// Operation canceled by the caller
    #[error("operation canceled")]
    Canceled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(String),

    /// Network error
    #[error("network error: {0}")]
    Network(String),

    /// Timeout error
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl NimbusError {
    /// Check if error is retryable by an outer retry layer.
    ///
    /// Geometry, accounting, and manifest errors are never retryable: they
    /// indicate a caller bug or a protocol-limit violation, not a transient
    /// fault. A failed part upload is retryable when its underlying cause is.
    pub fn is_retryable(&self) -> bool {
        match self {
            NimbusError::Network(_) => true,
            NimbusError::Timeout(_) => true,
            NimbusError::Io(_) => true,
            NimbusError::Sdk(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("connection reset")
                    || lower.contains("connection timed out")
                    || lower.contains("broken pipe")
                    || lower.contains("connection refused")
                    || lower.contains("temporarily unavailable")
            }
            NimbusError::Service { code, .. } => is_retryable_code(code),
            NimbusError::PartUpload { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The upload id of the session this error left open, if any.
    pub fn resumable_upload_id(&self) -> Option<&str> {
        match self {
            NimbusError::PartUpload { upload_id, .. } => Some(upload_id),
            _ => None,
        }
    }
}

impl From<io::Error> for NimbusError {
    fn from(err: io::Error) -> Self {
        NimbusError::Io(err.to_string())
    }
}

/// Check if an S3 error code is retryable
pub(crate) fn is_retryable_code(code: &str) -> bool {
    matches!(
        code,
        "RequestTimeout"
            | "ServiceUnavailable"
            | "InternalError"
            | "SlowDown"
            | "RequestTimeTooSkewed"
    )
}

/// Convert AWS SDK errors to NimbusError
impl<E> From<aws_sdk_s3::error::SdkError<E>> for NimbusError
where
    E: std::error::Error + 'static,
{
    fn from(error: aws_sdk_s3::error::SdkError<E>) -> Self {
        match error {
            aws_sdk_s3::error::SdkError::DispatchFailure(e) => {
                NimbusError::Network(format!("network dispatch failure: {:?}", e))
            }
            aws_sdk_s3::error::SdkError::ResponseError(e) => {
                NimbusError::Network(format!("response error: {:?}", e))
            }
            aws_sdk_s3::error::SdkError::TimeoutError(e) => {
                NimbusError::Timeout(format!("{:?}", e))
            }
            aws_sdk_s3::error::SdkError::ServiceError(e) => {
                let err_str = format!("{:?}", e);

                if err_str.contains("NoSuchKey") {
                    NimbusError::Service {
                        code: "NoSuchKey".to_string(),
                        message: "the specified key does not exist".to_string(),
                    }
                } else if err_str.contains("NoSuchUpload") {
                    NimbusError::Service {
                        code: "NoSuchUpload".to_string(),
                        message: "the specified multipart upload does not exist".to_string(),
                    }
                } else if err_str.contains("NoSuchBucket") {
                    NimbusError::Service {
                        code: "NoSuchBucket".to_string(),
                        message: "the specified bucket does not exist".to_string(),
                    }
                } else if err_str.contains("AccessDenied") {
                    NimbusError::AccessDenied("access denied to resource".to_string())
                } else {
                    NimbusError::Service {
                        code: "Unknown".to_string(),
                        message: err_str,
                    }
                }
            }
            _ => NimbusError::Sdk(format!("{:?}", error)),
        }
    }
}
