//! Resumption reconciliation
//!
//! Compares the server's view of an upload session against the local
//! `PartPlan` and decides which parts still need transfer. Expected sizes
//! and offsets come from the plan, never from the server listing, so a
//! listing produced under a different geometry can only mark parts as
//! missing, never smuggle wrong-sized parts into the manifest.

use crate::error::NimbusResult;
use crate::multipart::engine::MultipartOps;
use crate::multipart::partition::PartPlan;
use crate::types::{UploadSession, UploadedPart};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One part still to be transferred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissingPart {
    /// Offset in the source at which this part's bytes start
    pub read_offset: u64,

    /// Exact size the part must have under the plan
    pub expected_size: u64,
}

/// Result of reconciling a session against its plan
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Parts that still need transfer, keyed by part number
    pub missing: BTreeMap<i32, MissingPart>,

    /// Server-verified parts folded directly into the completion manifest
    pub completed: Vec<UploadedPart>,

    /// Bytes already on the server, counted from the verified parts
    pub uploaded_bytes: u64,
}

impl Reconciliation {
    /// Nothing on the server yet: every part of the plan is missing
    pub fn all_missing(plan: &PartPlan) -> Self {
        let mut missing = BTreeMap::new();
        for pn in 1..=plan.part_count {
            missing.insert(
                pn as i32,
                MissingPart {
                    read_offset: plan.offset_of(pn),
                    expected_size: plan.expected_size(pn),
                },
            );
        }
        Self {
            missing,
            completed: Vec::new(),
            uploaded_bytes: 0,
        }
    }

    /// True when every planned part is already verified on the server
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Fetch the server's part listing for `session`, driving pagination to
/// exhaustion, and reconcile it against `plan`.
pub async fn reconcile<A: MultipartOps>(
    ops: &A,
    session: &UploadSession,
    plan: &PartPlan,
) -> NimbusResult<Reconciliation> {
    let mut listed: BTreeMap<i32, UploadedPart> = BTreeMap::new();
    let mut marker: Option<String> = None;

    loop {
        let page = ops.list_parts_page(session, marker.take()).await?;
        for part in page.parts {
            listed.insert(part.part_number, part);
        }
        match page.next_marker {
            Some(next) => marker = Some(next),
            None => break,
        }
    }

    debug!(
        upload_id = %session.upload_id,
        listed = listed.len(),
        "reconciling against server part listing"
    );
    Ok(plan_missing(plan, &listed))
}

/// Pure reconciliation: decide missing parts from the plan and a complete
/// server listing.
///
/// The first absent or size-mismatched part number taints every higher
/// number. A hole in the sequence usually means an earlier attempt died
/// mid-upload, possibly under a different geometry; parts beyond the hole
/// are never trusted.
pub fn plan_missing(plan: &PartPlan, listed: &BTreeMap<i32, UploadedPart>) -> Reconciliation {
    let mut out = Reconciliation::default();
    let mut tainted = false;

    for pn in 1..=plan.part_count {
        let part_number = pn as i32;
        let expected = plan.expected_size(pn);

        let verified = if tainted {
            None
        } else {
            listed
                .get(&part_number)
                .filter(|part| part.size == expected)
        };

        match verified {
            Some(part) => {
                out.uploaded_bytes += part.size;
                out.completed.push(part.clone());
            }
            None => {
                if !tainted {
                    if let Some(part) = listed.get(&part_number) {
                        warn!(
                            part_number,
                            reported = part.size,
                            expected,
                            "size mismatch, re-uploading from this part on"
                        );
                    }
                    tainted = true;
                }
                out.missing.insert(
                    part_number,
                    MissingPart {
                        read_offset: plan.offset_of(pn),
                        expected_size: expected,
                    },
                );
            }
        }
    }
    out
}
