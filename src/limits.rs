//! S3 protocol limits
//!
//! Centralizes the service quotas the multipart engine must respect so that
//! an AWS quota change only has to be applied in one place.
//!
//! Reference: <https://docs.aws.amazon.com/AmazonS3/latest/userguide/qfacts.html>

/// Minimum size of a multipart upload part (5 MiB).
///
/// The last part of an upload is allowed to be smaller.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Maximum size of a single multipart upload part (5 GiB).
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum number of parts in a multipart upload, numbered 1 to 10,000.
pub const MAX_PART_COUNT: u64 = 10_000;

/// Maximum size of an object uploaded with a single PutObject call (5 GiB).
pub const MAX_SINGLE_PUT_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Maximum size of a multipart object (5 TiB).
pub const MAX_OBJECT_SIZE: u64 = 5_497_558_138_880;
