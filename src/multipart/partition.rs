//! Part-size arithmetic for multipart uploads
//!
//! Everything here is pure: given a total object size (or "unknown") and the
//! protocol limits, decide how many parts to upload and how large each one
//! is. The engine and the reconciler both derive offsets and expected sizes
//! from the same `PartPlan`, so there is exactly one source of truth for the
//! geometry of an upload.

use crate::error::{NimbusError, NimbusResult};
use crate::limits;

/// The geometry decision for an object of known total size.
///
/// All parts have `part_size` bytes except the final one, which has
/// `last_part_size` bytes. `(part_count - 1) * part_size + last_part_size`
/// always equals the total size the plan was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    /// Number of parts, 1 to 10,000
    pub part_count: u64,

    /// Size of every part except the last
    pub part_size: u64,

    /// Size of the final part, `<= part_size`, zero only for empty objects
    pub last_part_size: u64,
}

/// Part geometry for a source of known or unknown size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartGeometry {
    /// Total size known up front; the full plan is fixed before upload
    Sized(PartPlan),

    /// Forward-only source of unknown length. Parts are cut at `part_size`
    /// until EOF; producing more than the maximum part count is fatal.
    Streaming { part_size: u64 },
}

fn ceil_div(n: u64, d: u64) -> u64 {
    n.div_ceil(d)
}

impl PartPlan {
    /// Compute the plan for a known total size.
    ///
    /// A `configured_part_size` of 0 selects the default: the smallest
    /// multiple of the minimum part size that covers the object within the
    /// part-count limit. An explicit part size must lie within the protocol
    /// bounds and is honored as-is.
    pub fn optimal(total_size: u64, configured_part_size: u64) -> NimbusResult<Self> {
        if total_size == 0 {
            // One empty part so the completion manifest is never empty.
            return Ok(Self {
                part_count: 1,
                part_size: 0,
                last_part_size: 0,
            });
        }

        if total_size > limits::MAX_OBJECT_SIZE {
            return Err(NimbusError::EntityTooLarge {
                size: total_size,
                max: limits::MAX_OBJECT_SIZE,
            });
        }

        let part_size = if configured_part_size == 0 {
            default_part_size(total_size)
        } else {
            if !(limits::MIN_PART_SIZE..=limits::MAX_PART_SIZE).contains(&configured_part_size) {
                return Err(NimbusError::InvalidPartSize {
                    size: configured_part_size,
                    min: limits::MIN_PART_SIZE,
                    max: limits::MAX_PART_SIZE,
                });
            }
            configured_part_size
        };

        Self::with_part_size(total_size, part_size)
    }

    /// Compute the plan using the historical default part size.
    ///
    /// Required when resuming sessions whose parts were issued under the
    /// old formula; mixing formulas across attempts would make every
    /// reconciled part look size-mismatched.
    pub fn legacy(total_size: u64) -> NimbusResult<Self> {
        if total_size == 0 {
            return Ok(Self {
                part_count: 1,
                part_size: 0,
                last_part_size: 0,
            });
        }
        Self::with_part_size(total_size, legacy_part_size())
    }

    fn with_part_size(total_size: u64, part_size: u64) -> NimbusResult<Self> {
        let part_count = ceil_div(total_size, part_size);
        if part_count > limits::MAX_PART_COUNT {
            return Err(NimbusError::EntityTooLarge {
                size: total_size,
                max: limits::MAX_PART_COUNT * part_size,
            });
        }
        let last_part_size = total_size - (part_count - 1) * part_size;
        Ok(Self {
            part_count,
            part_size,
            last_part_size,
        })
    }

    /// Total size the plan covers
    pub fn total_size(&self) -> u64 {
        (self.part_count - 1) * self.part_size + self.last_part_size
    }

    /// Expected size of a given part number (1-based)
    pub fn expected_size(&self, part_number: u64) -> u64 {
        if part_number == self.part_count {
            self.last_part_size
        } else {
            self.part_size
        }
    }

    /// Byte offset at which a given part number (1-based) starts
    pub fn offset_of(&self, part_number: u64) -> u64 {
        (part_number - 1) * self.part_size
    }
}

impl PartGeometry {
    /// Decide geometry for a source. `None` means unknown/streaming size.
    pub fn for_source(
        total_size: Option<u64>,
        configured_part_size: u64,
        legacy: bool,
    ) -> NimbusResult<Self> {
        match total_size {
            Some(total) if legacy => Ok(Self::Sized(PartPlan::legacy(total)?)),
            Some(total) => Ok(Self::Sized(PartPlan::optimal(total, configured_part_size)?)),
            None => {
                let part_size = if configured_part_size == 0 {
                    streaming_part_size()
                } else {
                    if !(limits::MIN_PART_SIZE..=limits::MAX_PART_SIZE)
                        .contains(&configured_part_size)
                    {
                        return Err(NimbusError::InvalidPartSize {
                            size: configured_part_size,
                            min: limits::MIN_PART_SIZE,
                            max: limits::MAX_PART_SIZE,
                        });
                    }
                    configured_part_size
                };
                Ok(Self::Streaming { part_size })
            }
        }
    }

    /// Part size in effect for this geometry
    pub fn part_size(&self) -> u64 {
        match self {
            Self::Sized(plan) => plan.part_size,
            Self::Streaming { part_size } => *part_size,
        }
    }
}

/// Default part size for a known total: the smallest multiple of the
/// minimum part size that keeps the part count within the limit.
fn default_part_size(total_size: u64) -> u64 {
    let per_part = ceil_div(total_size, limits::MAX_PART_COUNT);
    ceil_div(per_part, limits::MIN_PART_SIZE).max(1) * limits::MIN_PART_SIZE
}

/// Part size for sources of unknown length: large enough that the maximum
/// part count covers the maximum object size, rounded up to a minimum-part
/// boundary.
pub fn streaming_part_size() -> u64 {
    let per_part = ceil_div(limits::MAX_OBJECT_SIZE, limits::MAX_PART_COUNT);
    ceil_div(per_part, limits::MIN_PART_SIZE) * limits::MIN_PART_SIZE
}

/// The historical default part size: the maximum object size divided by one
/// less than the maximum part count (549,810,794 bytes).
pub fn legacy_part_size() -> u64 {
    limits::MAX_OBJECT_SIZE / (limits::MAX_PART_COUNT - 1)
}

/// Number of parts the historical formula needs for a given size.
///
/// Zero for an empty object; exactly the maximum part count for the
/// maximum object size.
pub fn parts_required(total_size: u64) -> u64 {
    if total_size == 0 {
        return 0;
    }
    ceil_div(total_size, legacy_part_size())
}

/// Split `total_size` bytes into `part_count` near-equal contiguous ranges.
///
/// Returns inclusive `(start, end)` byte ranges in increasing order. The
/// first `total_size % part_count` ranges are one byte longer than the
/// rest, so the ranges cover `[0, total_size - 1]` exactly.
pub fn even_splits(total_size: u64, part_count: u64) -> Vec<(u64, u64)> {
    if total_size == 0 || part_count == 0 {
        return Vec::new();
    }
    let quot = total_size / part_count;
    let rem = total_size % part_count;

    let mut ranges = Vec::with_capacity(part_count as usize);
    let mut offset = 0u64;
    for i in 0..part_count {
        let len = if i < rem { quot + 1 } else { quot };
        ranges.push((offset, offset + len - 1));
        offset += len;
    }
    ranges
}
