//! Concurrent part upload and completion
//!
//! The engine drives one multipart upload end to end: it spawns the part
//! producer, admits part uploads through a semaphore-bounded worker pool,
//! drains results as they arrive, and finishes with the completion
//! handshake. It is written against the [`MultipartOps`] trait and never
//! touches the transport directly, which keeps every invariant testable
//! with a scripted mock.
//!
//! Failure discipline: results are drained fully asynchronously, each one
//! tagged with its part number. The first part failure halts submission of
//! further parts, aborts what is in flight, and surfaces the error with
//! the upload id embedded so the caller can resume the session later. The
//! engine never retries and never aborts a session on its own.

use crate::error::{NimbusError, NimbusResult};
use crate::multipart::partition::PartGeometry;
use crate::multipart::reconcile::{reconcile, Reconciliation};
use crate::multipart::source::{feed_parts, ObjectSource, PendingPart, FEED_CAPACITY};
use crate::types::{ObjectInfo, PartPage, UploadSession, UploadedPart};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The five server operations the engine needs, as black boxes.
///
/// The real implementation lives on [`crate::client::Client`]; tests
/// substitute scripted mocks.
#[async_trait]
pub trait MultipartOps: Send + Sync {
    /// Initiate a multipart upload and return the new session
    async fn create_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> NimbusResult<UploadSession>;

    /// Fetch one page of the session's uploaded-parts listing
    async fn list_parts_page(
        &self,
        session: &UploadSession,
        marker: Option<String>,
    ) -> NimbusResult<PartPage>;

    /// Upload one part; returns the server-issued ETag
    async fn upload_part(&self, session: &UploadSession, part: &PendingPart)
        -> NimbusResult<String>;

    /// Complete the upload with a part-number-ordered manifest
    async fn complete_upload(
        &self,
        session: &UploadSession,
        manifest: &[UploadedPart],
    ) -> NimbusResult<ObjectInfo>;

    /// Abort the session, discarding its uploaded parts
    async fn abort_upload(&self, session: &UploadSession) -> NimbusResult<()>;
}

/// Multipart upload driver
pub struct Uploader<A> {
    ops: A,
    parallelism: usize,
    cancel: CancellationToken,
}

impl<A> Uploader<A>
where
    A: MultipartOps + Clone + Send + Sync + 'static,
{
    /// Create a driver admitting at most `parallelism` concurrent part
    /// uploads. Zero is treated as one.
    pub fn new(ops: A, parallelism: usize) -> Self {
        Self {
            ops,
            parallelism: parallelism.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Use an external cancellation token instead of a private one
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels this uploader's operations when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Upload `source` as a new object
    pub async fn upload(
        &self,
        bucket: &str,
        key: &str,
        source: ObjectSource,
        geometry: PartGeometry,
        content_type: Option<&str>,
    ) -> NimbusResult<ObjectInfo> {
        let session = self.ops.create_upload(bucket, key, content_type).await?;
        info!(
            bucket,
            key,
            upload_id = %session.upload_id,
            "multipart upload started"
        );
        let rec = match geometry {
            PartGeometry::Sized(plan) => Reconciliation::all_missing(&plan),
            PartGeometry::Streaming { .. } => Reconciliation::default(),
        };
        self.run(session, source, geometry, rec).await
    }

    /// Resume an existing session.
    ///
    /// The source must have a known size so the original part geometry can
    /// be recomputed; server-verified parts are folded into the manifest
    /// without re-upload.
    pub async fn resume(
        &self,
        session: UploadSession,
        source: ObjectSource,
        geometry: PartGeometry,
    ) -> NimbusResult<ObjectInfo> {
        let plan = match geometry {
            PartGeometry::Sized(plan) => plan,
            PartGeometry::Streaming { .. } => {
                return Err(NimbusError::InvalidConfig(
                    "resuming requires a source of known size".to_string(),
                ));
            }
        };
        let rec = reconcile(&self.ops, &session, &plan).await?;
        info!(
            upload_id = %session.upload_id,
            verified = rec.completed.len(),
            missing = rec.missing.len(),
            "resuming multipart upload"
        );
        self.run(session, source, geometry, rec).await
    }

    /// Abort a session, discarding its parts server-side.
    ///
    /// Never called automatically: an upload that failed mid-flight stays
    /// resumable until the caller explicitly gives up on it.
    pub async fn abort(&self, session: &UploadSession) -> NimbusResult<()> {
        self.ops.abort_upload(session).await
    }

    async fn run(
        &self,
        session: UploadSession,
        source: ObjectSource,
        geometry: PartGeometry,
        rec: Reconciliation,
    ) -> NimbusResult<ObjectInfo> {
        let declared_size = match geometry {
            PartGeometry::Sized(plan) => Some(plan.total_size()),
            PartGeometry::Streaming { .. } => None,
        };
        let planned_count = match geometry {
            PartGeometry::Sized(plan) => Some(plan.part_count),
            PartGeometry::Streaming { .. } => None,
        };

        let mut manifest = rec.completed;
        let mut uploaded_bytes = rec.uploaded_bytes;

        if let PartGeometry::Sized(_) = geometry {
            if rec.missing.is_empty() {
                debug!(
                    upload_id = %session.upload_id,
                    "all parts already verified, completing directly"
                );
                return self
                    .finish(&session, manifest, declared_size, uploaded_bytes, planned_count)
                    .await;
            }
        }

        let skip: BTreeSet<i32> = manifest.iter().map(|p| p.part_number).collect();
        let attempt_cancel = self.cancel.child_token();

        let (tx, mut rx) = mpsc::channel::<PendingPart>(FEED_CAPACITY);
        let mut producer = tokio::spawn(feed_parts(
            source,
            geometry,
            skip,
            tx,
            attempt_cancel.clone(),
        ));

        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut workers: JoinSet<(i32, u64, NimbusResult<UploadedPart>)> = JoinSet::new();
        let mut failure: Option<NimbusError> = None;
        let mut parts_done = false;

        // At most one part waits here for a worker slot; the channel
        // provides the rest of the buffering. The biased order below
        // drains finished workers before admitting the pending part, so
        // a failure always wins the race against the next submission.
        let mut pending: Option<PendingPart> = None;

        while !parts_done || !workers.is_empty() || pending.is_some() {
            tokio::select! {
                biased;
                _ = attempt_cancel.cancelled() => {
                    failure.get_or_insert(NimbusError::Canceled);
                    break;
                }
                joined = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Some(Ok((part_number, size, Ok(part)))) => {
                            debug!(part_number, size, "part uploaded");
                            uploaded_bytes += size;
                            manifest.push(part);
                        }
                        Some(Ok((part_number, _, Err(err)))) => {
                            warn!(part_number, error = %err, "part upload failed");
                            failure.get_or_insert(NimbusError::PartUpload {
                                part_number,
                                upload_id: session.upload_id.clone(),
                                source: Box::new(err),
                            });
                            break;
                        }
                        Some(Err(join_err)) => {
                            failure.get_or_insert(NimbusError::Io(format!(
                                "upload worker failed: {}",
                                join_err
                            )));
                            break;
                        }
                        None => {}
                    }
                }
                permit = Arc::clone(&semaphore).acquire_owned(), if pending.is_some() => {
                    let permit = match permit {
                        Ok(permit) => permit,
                        Err(_) => {
                            failure.get_or_insert(NimbusError::Canceled);
                            break;
                        }
                    };
                    if let Some(part) = pending.take() {
                        let ops = self.ops.clone();
                        let task_session = session.clone();
                        workers.spawn(async move {
                            let part_number = part.part_number;
                            let size = part.size;
                            let sha256 = part.sha256.clone();
                            let result = ops
                                .upload_part(&task_session, &part)
                                .await
                                .map(|etag| {
                                    UploadedPart::new(part_number, etag, size)
                                        .with_sha256(sha256)
                                });
                            // Dropping the part here releases its spill
                            // file exactly once, success or failure.
                            drop(part);
                            drop(permit);
                            (part_number, size, result)
                        });
                    }
                }
                part = rx.recv(), if !parts_done && pending.is_none() => {
                    match part {
                        Some(part) => pending = Some(part),
                        None => parts_done = true,
                    }
                }
            }
        }

        if let Some(err) = failure {
            // Fail fast: stop the producer, abandon in-flight parts, and
            // leave the session open for resumption.
            attempt_cancel.cancel();
            drop(rx);
            workers.shutdown().await;
            producer.abort();
            let _ = (&mut producer).await;
            warn!(
                upload_id = %session.upload_id,
                error = %err,
                "upload failed, session left open for resume"
            );
            return Err(err);
        }

        drop(rx);
        match producer.await {
            Ok(result) => {
                result?;
            }
            Err(join_err) => {
                return Err(NimbusError::Io(format!("part producer failed: {}", join_err)));
            }
        }

        self.finish(&session, manifest, declared_size, uploaded_bytes, planned_count)
            .await
    }

    async fn finish(
        &self,
        session: &UploadSession,
        mut manifest: Vec<UploadedPart>,
        declared_size: Option<u64>,
        uploaded_bytes: u64,
        planned_count: Option<u64>,
    ) -> NimbusResult<ObjectInfo> {
        if let Some(expected) = declared_size {
            if uploaded_bytes != expected {
                return Err(NimbusError::UnexpectedEof {
                    expected,
                    actual: uploaded_bytes,
                });
            }
        }
        if let Some(expected) = planned_count {
            if manifest.len() as u64 != expected {
                return Err(NimbusError::InvalidPartCount {
                    expected,
                    actual: manifest.len() as u64,
                });
            }
        }

        // Workers finish in arbitrary order; the handshake requires the
        // manifest sorted by part number.
        manifest.sort_by_key(|p| p.part_number);

        let info = self.ops.complete_upload(session, &manifest).await?;
        info!(
            bucket = %info.bucket,
            key = %info.key,
            size = info.size,
            parts = manifest.len(),
            "multipart upload completed"
        );
        Ok(info)
    }
}
