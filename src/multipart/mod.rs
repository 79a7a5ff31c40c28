//! Multipart upload engine
//!
//! Four stages, leaves first: [`partition`] decides part geometry from the
//! protocol limits, [`source`] splits a byte source into hash-annotated
//! parts, [`reconcile`] computes the remaining work when resuming, and
//! [`engine`] drives bounded-concurrency upload and the completion
//! handshake against the [`engine::MultipartOps`] seam.

pub mod engine;
pub mod partition;
pub mod reconcile;
pub mod source;

pub use engine::{MultipartOps, Uploader};
pub use partition::{PartGeometry, PartPlan};
pub use reconcile::{MissingPart, Reconciliation};
pub use source::{ObjectSource, PartBody, PendingPart};
