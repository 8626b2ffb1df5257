//! Range request planning.
//!
//! Turns a caller's logical set of byte ranges into the physical requests the
//! executor issues. Neighbouring ranges are folded into one widened request
//! as long as the bytes wasted on gaps stay within the configured gap ratio,
//! trading over-fetch for fewer round trips.

use tracing::debug;

use crate::{
    BlobError,
    BlobResult,
    Capabilities,
    range::{self, IndexedRange, Range},
};

/// Tuning knobs for one planning pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlanOptions {
    /// Largest acceptable fraction of wasted bytes in a widened group.
    /// Zero only merges ranges that touch or overlap.
    pub gap_threshold: f64,

    /// Maximum number of physical groups, when the backend caps them.
    pub max_groups: Option<usize>,
}

impl PlanOptions {
    pub fn new(gap_threshold: f64) -> Self {
        Self {
            gap_threshold,
            max_groups: None,
        }
    }

    /// Options bounded by the backend's per-request range limit. The limit
    /// only applies to native multi-range requests.
    pub fn for_capabilities(caps: &Capabilities, gap_threshold: f64) -> Self {
        Self {
            gap_threshold,
            max_groups: if caps.supports_multi_range {
                caps.max_ranges_per_request
            } else {
                None
            },
        }
    }

    fn validate(&self) -> BlobResult<()> {
        if !self.gap_threshold.is_finite() || !(0.0..=1.0).contains(&self.gap_threshold) {
            return Err(BlobError::InvalidConfig {
                reason: format!("gap threshold {} outside [0, 1]", self.gap_threshold),
            });
        }
        if self.max_groups == Some(0) {
            return Err(BlobError::InvalidConfig {
                reason: "max groups must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// One physical request and the logical ranges it serves.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalGroup {
    range: Range,
    members: Vec<IndexedRange>,
}

impl PhysicalGroup {
    fn new(first: IndexedRange) -> Self {
        Self {
            range: first.range,
            members: vec![first],
        }
    }

    /// The byte range fetched from the backend.
    pub fn range(&self) -> Range {
        self.range
    }

    /// Logical ranges served by this group, ordered by start.
    pub fn members(&self) -> &[IndexedRange] {
        &self.members
    }

    /// Whether the group fetches more than a single verbatim logical range.
    pub fn is_widened(&self) -> bool {
        self.members.len() > 1 || self.members[0].range != self.range
    }

    fn member_ranges(&self) -> impl Iterator<Item = &Range> + Clone {
        self.members.iter().map(|m| &m.range)
    }

    fn try_grow(&mut self, next: IndexedRange, options: &PlanOptions, caps: &Capabilities) -> bool {
        let candidate = self.member_ranges().chain(std::iter::once(&next.range));
        let Some(grown) = range::span(candidate.clone()) else {
            return false;
        };
        if let Some(max_span) = caps.max_request_span {
            if grown.count > max_span {
                return false;
            }
        }
        if range::gap_ratio(candidate) > options.gap_threshold {
            return false;
        }
        self.range = grown;
        self.members.push(next);
        true
    }
}

/// Ordered physical groups covering a read request exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPlan {
    groups: Vec<PhysicalGroup>,
    requested: usize,
}

impl ExecutionPlan {
    pub fn groups(&self) -> &[PhysicalGroup] {
        &self.groups
    }

    /// Number of logical ranges in the original request.
    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Bytes fetched that no logical range asked for.
    pub fn over_fetch_bytes(&self) -> u64 {
        self.groups
            .iter()
            .map(|g| g.range.count - range::covered_bytes(g.member_ranges()))
            .sum()
    }

    /// Logical ranges restored to request order.
    pub fn logical_ranges(&self) -> Vec<Range> {
        let mut slots = vec![None; self.requested];
        for member in self.groups.iter().flat_map(|g| g.members.iter()) {
            slots[member.index] = Some(member.range);
        }
        slots.into_iter().flatten().collect()
    }
}

/// Plan the physical requests for `ranges` against a backend.
pub fn plan(
    ranges: &[Range],
    caps: &Capabilities,
    options: &PlanOptions,
) -> BlobResult<ExecutionPlan> {
    options.validate()?;
    range::validate_all(ranges)?;

    let mut normalized = range::normalize(ranges).into_iter();
    let mut groups = Vec::new();
    // validate_all rejected the empty request
    let Some(first) = normalized.next() else {
        return Err(BlobError::EmptyRequest);
    };
    let mut current = PhysicalGroup::new(first);
    for next in normalized {
        if !current.try_grow(next, options, caps) {
            groups.push(std::mem::replace(&mut current, PhysicalGroup::new(next)));
        }
    }
    groups.push(current);

    if let Some(max_groups) = options.max_groups {
        if groups.len() > max_groups {
            return Err(BlobError::PlanTooLarge {
                groups: groups.len(),
                max_groups,
            });
        }
    }

    debug!(
        backend = %caps.name,
        requested = ranges.len(),
        groups = groups.len(),
        gap_threshold = options.gap_threshold,
        "planned range read"
    );

    Ok(ExecutionPlan {
        groups,
        requested: ranges.len(),
    })
}
