//! Part-source splitting
//!
//! Turns a byte source into a sequence of upload-ready parts. Seekable
//! sources (local files) are split into window reads with no copying;
//! forward-only streams are spilled part-by-part into temporary files,
//! because a part upload needs a known length and a precomputed checksum
//! before the body is sent.
//!
//! The producer feeds a small bounded channel. Backpressure from the
//! uploader therefore throttles spill-file creation: at most a few parts
//! of temporary storage exist at any moment.

use crate::error::{NimbusError, NimbusResult};
use crate::limits;
use crate::multipart::partition::PartGeometry;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Bounded-channel capacity between the splitter and the uploader
pub(crate) const FEED_CAPACITY: usize = 3;

const CHUNK: usize = 256 * 1024;

/// The byte source of an upload
pub enum ObjectSource {
    /// A seekable local file, split by ranged reads
    File { path: PathBuf },

    /// A forward-only stream, optionally with a declared total size.
    /// Parts are spilled to temporary files before upload.
    Stream {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        size: Option<u64>,
    },
}

impl ObjectSource {
    /// Source backed by a local file
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    /// Source backed by a sequential reader. Pass the total size when it
    /// is known; `None` selects streaming geometry.
    pub fn stream(reader: impl AsyncRead + Send + Unpin + 'static, size: Option<u64>) -> Self {
        Self::Stream {
            reader: Box::new(reader),
            size,
        }
    }

    /// Total size of the source, if it can be known up front
    pub async fn size(&self) -> NimbusResult<Option<u64>> {
        match self {
            Self::File { path } => {
                let meta = tokio::fs::metadata(path).await?;
                Ok(Some(meta.len()))
            }
            Self::Stream { size, .. } => Ok(*size),
        }
    }

    /// Whether parts can be produced at arbitrary offsets
    pub fn is_seekable(&self) -> bool {
        matches!(self, Self::File { .. })
    }
}

impl std::fmt::Debug for ObjectSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File { path } => f.debug_struct("File").field("path", path).finish(),
            Self::Stream { size, .. } => f.debug_struct("Stream").field("size", size).finish(),
        }
    }
}

/// Backing bytes of one pending part.
///
/// A `Spill` variant owns its temporary file; dropping the part deletes
/// the file, which is what guarantees exactly-once release on every exit
/// path, including cancellation.
#[derive(Debug)]
pub enum PartBody {
    /// Window into a seekable file
    FileRange {
        path: PathBuf,
        offset: u64,
        length: u64,
    },

    /// Spilled bytes of a forward-only stream part
    Spill(NamedTempFile),

    /// The single zero-byte part of an empty object
    Empty,
}

/// One unit of upload work produced by the splitter
#[derive(Debug)]
pub struct PendingPart {
    /// Part number, 1-based, strictly increasing in production order
    pub part_number: i32,

    /// Exact size of the part in bytes
    pub size: u64,

    /// Base64-encoded SHA-256 of the part's bytes
    pub sha256: String,

    /// Where the bytes live
    pub body: PartBody,
}

fn finish_hash(hasher: Sha256) -> String {
    BASE64.encode(hasher.finalize())
}

fn empty_sha256() -> String {
    finish_hash(Sha256::new())
}

/// Produce parts for `source` under `geometry`, skipping the part numbers
/// in `skip` (already uploaded and verified by reconciliation).
///
/// Parts are sent over `tx` in increasing part-number order. Returns the
/// number of bytes read from the source, skipped parts included. A closed
/// receiver stops production silently; the driver's own error is the one
/// that matters in that case.
pub(crate) async fn feed_parts(
    source: ObjectSource,
    geometry: PartGeometry,
    skip: BTreeSet<i32>,
    tx: mpsc::Sender<PendingPart>,
    cancel: CancellationToken,
) -> NimbusResult<u64> {
    match source {
        ObjectSource::File { path } => {
            let plan = match geometry {
                PartGeometry::Sized(plan) => plan,
                PartGeometry::Streaming { .. } => {
                    return Err(NimbusError::InvalidConfig(
                        "file sources always have a known size".to_string(),
                    ));
                }
            };
            feed_file_parts(path, plan, skip, tx, cancel).await
        }
        ObjectSource::Stream { reader, .. } => {
            feed_stream_parts(reader, geometry, skip, tx, cancel).await
        }
    }
}

async fn feed_file_parts(
    path: PathBuf,
    plan: crate::multipart::partition::PartPlan,
    skip: BTreeSet<i32>,
    tx: mpsc::Sender<PendingPart>,
    cancel: CancellationToken,
) -> NimbusResult<u64> {
    if plan.part_size == 0 {
        if skip.contains(&1) {
            return Ok(0);
        }
        let part = PendingPart {
            part_number: 1,
            size: 0,
            sha256: empty_sha256(),
            body: PartBody::Empty,
        };
        let _ = send_part(&tx, &cancel, part).await?;
        return Ok(0);
    }

    let mut file = File::open(&path).await?;
    let mut buf = vec![0u8; CHUNK];
    let mut read_total = 0u64;

    for pn in 1..=plan.part_count {
        if cancel.is_cancelled() {
            return Err(NimbusError::Canceled);
        }
        let part_number = pn as i32;
        let size = plan.expected_size(pn);
        read_total += size;
        if skip.contains(&part_number) {
            trace!(part_number, "skipping reconciled part");
            continue;
        }

        let offset = plan.offset_of(pn);
        let sha256 = hash_window(&mut file, &mut buf, offset, size).await?;

        debug!(part_number, size, offset, "part ready");
        let part = PendingPart {
            part_number,
            size,
            sha256,
            body: PartBody::FileRange {
                path: path.clone(),
                offset,
                length: size,
            },
        };
        if !send_part(&tx, &cancel, part).await? {
            return Ok(read_total);
        }
    }
    Ok(read_total)
}

async fn hash_window(
    file: &mut File,
    buf: &mut [u8],
    offset: u64,
    length: u64,
) -> NimbusResult<String> {
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut hasher = Sha256::new();
    let mut remaining = length;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(NimbusError::UnexpectedEof {
                expected: length,
                actual: length - remaining,
            });
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(finish_hash(hasher))
}

async fn feed_stream_parts(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    geometry: PartGeometry,
    skip: BTreeSet<i32>,
    tx: mpsc::Sender<PendingPart>,
    cancel: CancellationToken,
) -> NimbusResult<u64> {
    let (plan, part_size) = match geometry {
        PartGeometry::Sized(plan) => (Some(plan), plan.part_size),
        PartGeometry::Streaming { part_size } => {
            if !skip.is_empty() {
                return Err(NimbusError::InvalidConfig(
                    "resuming requires a source of known size".to_string(),
                ));
            }
            (None, part_size)
        }
    };

    if let Some(plan) = plan {
        if plan.part_size == 0 {
            if !skip.contains(&1) {
                let part = PendingPart {
                    part_number: 1,
                    size: 0,
                    sha256: empty_sha256(),
                    body: PartBody::Empty,
                };
                let _ = send_part(&tx, &cancel, part).await?;
            }
            return Ok(0);
        }
    }

    let mut buf = vec![0u8; CHUNK];
    let mut part_number: i32 = 0;
    let mut read_total = 0u64;

    loop {
        if cancel.is_cancelled() {
            return Err(NimbusError::Canceled);
        }
        part_number += 1;
        let want = match plan {
            Some(plan) => {
                if part_number as u64 > plan.part_count {
                    break;
                }
                plan.expected_size(part_number as u64)
            }
            None => {
                if part_number as u64 > limits::MAX_PART_COUNT {
                    return Err(NimbusError::TooManyParts {
                        max: limits::MAX_PART_COUNT,
                    });
                }
                part_size
            }
        };

        if skip.contains(&part_number) {
            // Position must stay correct even for parts we will not send.
            let discarded = discard_exact(&mut reader, &mut buf, want).await?;
            read_total += discarded;
            trace!(part_number, "discarded reconciled part bytes");
            continue;
        }

        let (size, sha256, spill) = spill_one_part(&mut reader, &mut buf, want).await?;
        read_total += size;

        if size == 0 {
            // Clean EOF on a streaming source; known-size sources that end
            // short are reported by the driver's accounting check.
            if plan.is_none() && part_number == 1 {
                let part = PendingPart {
                    part_number: 1,
                    size: 0,
                    sha256: empty_sha256(),
                    body: PartBody::Empty,
                };
                let _ = send_part(&tx, &cancel, part).await?;
            }
            break;
        }

        debug!(part_number, size, "spilled part");
        let part = PendingPart {
            part_number,
            size,
            sha256,
            body: PartBody::Spill(spill),
        };
        if !send_part(&tx, &cancel, part).await? {
            return Ok(read_total);
        }

        if size < want && plan.is_some() {
            // Short final read of a known-size source; accounting upstream
            // turns this into an unexpected-EOF error.
            break;
        }
        if size < part_size && plan.is_none() {
            break;
        }
    }
    Ok(read_total)
}

/// Read up to `want` bytes into a fresh temp file, hashing in the same
/// pass. Returns the byte count, the checksum, and the spill file.
async fn spill_one_part(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
    want: u64,
) -> NimbusResult<(u64, String, NamedTempFile)> {
    let mut spill = NamedTempFile::new()?;
    let mut hasher = Sha256::new();
    let mut written = 0u64;

    while written < want {
        let take = (want - written).min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..take]).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        spill.as_file_mut().write_all(&buf[..n])?;
        written += n as u64;
    }
    spill.as_file_mut().flush()?;
    Ok((written, finish_hash(hasher), spill))
}

async fn discard_exact(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
    want: u64,
) -> NimbusResult<u64> {
    let mut discarded = 0u64;
    while discarded < want {
        let take = (want - discarded).min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..take]).await?;
        if n == 0 {
            return Err(NimbusError::UnexpectedEof {
                expected: want,
                actual: discarded,
            });
        }
        discarded += n as u64;
    }
    Ok(discarded)
}

/// Send one part, racing cancellation. `Ok(false)` means the receiver is
/// gone and production should stop.
async fn send_part(
    tx: &mpsc::Sender<PendingPart>,
    cancel: &CancellationToken,
    part: PendingPart,
) -> NimbusResult<bool> {
    tokio::select! {
        _ = cancel.cancelled() => Err(NimbusError::Canceled),
        sent = tx.send(part) => Ok(sent.is_ok()),
    }
}
