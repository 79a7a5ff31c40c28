/*!
 * Nimbus - async client for S3-compatible object storage
 *
 * Built around a resumable multipart upload engine:
 * - Part geometry chosen under the protocol limits (5 MiB..5 GiB parts,
 *   10,000 parts, 5 TiB objects), with the historical formula selectable
 * - Seekable sources split by ranged reads; forward-only streams spilled
 *   to temporary files with SHA-256 computed in the same pass
 * - Bounded-concurrency part upload with backpressure and fail-fast
 * - Resume by reconciling against the server's part listing; failed
 *   sessions stay open and are resumable by upload id
 * - Retry policy layered above the engine, never inside it
 */

pub mod client;
pub mod config;
pub mod error;
pub mod limits;
pub mod multipart;
pub mod recovery;
pub mod types;

// Re-export commonly used types
pub use client::Client;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use error::{NimbusError, NimbusResult};
pub use multipart::{
    MultipartOps, ObjectSource, PartGeometry, PartPlan, PendingPart, Uploader,
};
pub use types::{ObjectInfo, ObjectMetadata, PartPage, UploadSession, UploadedPart};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
