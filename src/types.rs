//! Type definitions for object storage operations

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// An in-progress multipart upload session.
///
/// The `upload_id` is the only resumption token: persisting it (together
/// with bucket and key) is the caller's responsibility. A session survives
/// a process crash and can be resumed until it is completed or aborted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Bucket the object is being uploaded to
    pub bucket: String,

    /// Object key
    pub key: String,

    /// Server-assigned opaque upload id
    pub upload_id: String,

    /// Content type recorded when the upload was initiated
    pub content_type: Option<String>,
}

/// A server-acknowledged part of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedPart {
    /// Part number (1-indexed, ordering-significant)
    pub part_number: i32,

    /// Opaque server-issued integrity token
    pub etag: String,

    /// Size of the part in bytes
    pub size: u64,

    /// Base64 SHA-256 of the part, when the transport reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl UploadedPart {
    /// Create a new uploaded part record
    pub fn new(part_number: i32, etag: impl Into<String>, size: u64) -> Self {
        Self {
            part_number,
            etag: etag.into(),
            size,
            sha256: None,
        }
    }

    /// Attach the part's checksum
    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }
}

/// One page of a paginated part listing
#[derive(Debug, Clone, Default)]
pub struct PartPage {
    /// Parts reported by the server for this page
    pub parts: Vec<UploadedPart>,

    /// Marker to request the next page, if the listing is truncated
    pub next_marker: Option<String>,
}

/// Metadata of a stored object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Object key
    pub key: String,

    /// Object size in bytes
    pub size: u64,

    /// Last modified timestamp
    pub last_modified: Option<SystemTime>,

    /// ETag
    pub etag: Option<String>,

    /// Content type
    pub content_type: Option<String>,
}

/// Result of a completed upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectInfo {
    /// Bucket the object was stored in
    pub bucket: String,

    /// Object key
    pub key: String,

    /// ETag of the assembled object, if the server reported one
    pub etag: Option<String>,

    /// Total size of the object in bytes
    pub size: u64,

    /// Version id, if versioning is enabled on the bucket
    pub version_id: Option<String>,
}
