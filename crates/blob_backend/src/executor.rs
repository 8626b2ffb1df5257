//! Multi-range read execution.
//!
//! Runs an [`ExecutionPlan`] against a backend: one native multi-range
//! request when the backend supports it, otherwise one ranged GET per
//! physical group. Widened groups are sliced back into the caller's logical
//! ranges and the results are returned in request order.

use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    BlobBody,
    BlobError,
    BlobMetrics,
    BlobResult,
    MultiRangePart,
    ReadConfig,
    StorageBackend,
    checked_multi_range,
    plan::{self, ExecutionPlan, PhysicalGroup, PlanOptions},
    range::Range,
};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Logical parts produced by one physical request, tagged with their
/// request index.
type GroupParts = Vec<(usize, MultiRangePart)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// Native multi-range request when the backend advertises it.
    Auto,
    /// One ranged GET per group.
    PerGroup,
}

/// Executes range plans against one backend.
pub struct MultiRangeExecutor {
    backend: Arc<dyn StorageBackend>,
    config: ReadConfig,
    metrics: Option<BlobMetrics>,
}

impl MultiRangeExecutor {
    pub fn new(backend: Arc<dyn StorageBackend>, config: ReadConfig) -> Self {
        Self {
            backend,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: BlobMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Plan `ranges` with this executor's gap threshold and the backend's
    /// range limit.
    pub fn plan(&self, ranges: &[Range]) -> BlobResult<ExecutionPlan> {
        let caps = self.backend.capabilities();
        let options = PlanOptions::for_capabilities(caps, self.config.gap_threshold);
        plan::plan(ranges, caps, &options)
    }

    /// Plan and execute a read of `ranges` from `key`.
    ///
    /// A plan exceeding the backend's per-request range limit is re-planned
    /// without the limit and fetched group by group.
    pub async fn read(
        &self,
        key: &str,
        ranges: &[Range],
        cancel: &CancellationToken,
    ) -> BlobResult<Vec<MultiRangePart>> {
        match self.plan(ranges) {
            Ok(plan) => self.execute(&plan, key, cancel).await,
            Err(BlobError::PlanTooLarge { groups, max_groups }) => {
                debug!(
                    key,
                    groups,
                    max_groups,
                    "plan exceeds multi-range limit, reading per group"
                );
                let caps = self.backend.capabilities();
                let plan = plan::plan(ranges, caps, &PlanOptions::new(self.config.gap_threshold))?;
                self.run(&plan, key, cancel, Dispatch::PerGroup).await
            }
            Err(e) => Err(e),
        }
    }

    /// Execute `plan` against `key`, returning one part per logical range in
    /// request order.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        key: &str,
        cancel: &CancellationToken,
    ) -> BlobResult<Vec<MultiRangePart>> {
        self.run(plan, key, cancel, Dispatch::Auto).await
    }

    async fn run(
        &self,
        plan: &ExecutionPlan,
        key: &str,
        cancel: &CancellationToken,
        dispatch: Dispatch,
    ) -> BlobResult<Vec<MultiRangePart>> {
        let _timer = self.metrics.as_ref().map(|m| m.timer("read"));
        if cancel.is_cancelled() {
            return Err(BlobError::Cancelled);
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BlobError::Cancelled),
            result = self.dispatch(plan, key, dispatch) => result,
        };
        if let (Err(e), Some(metrics)) = (&result, &self.metrics) {
            if !matches!(e, BlobError::Cancelled) {
                metrics.error("read");
            }
        }
        result
    }

    async fn dispatch(
        &self,
        plan: &ExecutionPlan,
        key: &str,
        dispatch: Dispatch,
    ) -> BlobResult<Vec<MultiRangePart>> {
        let caps = self.backend.capabilities();
        let groups = plan.groups();
        if let Some(metrics) = &self.metrics {
            metrics.over_fetched_bytes.add(plan.over_fetch_bytes(), &[]);
        }

        let fetched = match groups {
            [] => return Err(BlobError::EmptyRequest),
            [group] => {
                debug!(key, range = %group.range(), "reading single group");
                self.count_requests(1);
                vec![self.fetch_group(key, group).await?]
            }
            _ if dispatch == Dispatch::Auto && caps.supports_multi_range => {
                debug!(
                    key,
                    backend = %caps.name,
                    groups = groups.len(),
                    "reading groups with one multi-range request"
                );
                match self.fetch_native(key, groups).await {
                    Err(e) if e.is_unsupported() => {
                        warn!(
                            key,
                            backend = %caps.name,
                            "backend rejected multi-range request, reading per group"
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.multi_range_fallbacks.add(1, &[]);
                        }
                        self.fetch_per_group(key, groups).await?
                    }
                    other => other?,
                }
            }
            _ => {
                debug!(
                    key,
                    backend = %caps.name,
                    groups = groups.len(),
                    concurrency = self.config.concurrency,
                    "reading groups per request"
                );
                self.fetch_per_group(key, groups).await?
            }
        };

        assemble(plan.requested(), fetched)
    }

    async fn fetch_native(&self, key: &str, groups: &[PhysicalGroup]) -> BlobResult<Vec<GroupParts>> {
        let physical: Vec<Range> = groups.iter().map(PhysicalGroup::range).collect();
        let parts = checked_multi_range(self.backend.as_ref(), key, &physical).await?;
        self.count_requests(1);
        if parts.len() != groups.len() {
            return Err(BlobError::Backend {
                source: anyhow::anyhow!(
                    "multi-range read of {} returned {} parts for {} ranges",
                    key,
                    parts.len(),
                    groups.len()
                ),
            });
        }

        let mut fetched = Vec::with_capacity(groups.len());
        for (group, part) in groups.iter().zip(parts) {
            fetched.push(split_group(group, part.content_type, part.body).await?);
        }
        Ok(fetched)
    }

    async fn fetch_per_group(
        &self,
        key: &str,
        groups: &[PhysicalGroup],
    ) -> BlobResult<Vec<GroupParts>> {
        self.count_requests(groups.len() as u64);
        stream::iter(groups)
            .map(|group| self.fetch_group(key, group))
            .buffered(self.config.concurrency.max(1))
            .try_collect()
            .await
    }

    async fn fetch_group(&self, key: &str, group: &PhysicalGroup) -> BlobResult<GroupParts> {
        let output = self.backend.get_blob(key, Some(group.range())).await?;
        let content_type = output
            .metadata
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        split_group(group, content_type, output.body).await
    }

    fn count_requests(&self, requests: u64) {
        if let Some(metrics) = &self.metrics {
            metrics.physical_requests.add(requests, &[]);
        }
    }
}

/// Cut a group's fetched body into its logical ranges. Verbatim groups pass
/// the body through unbuffered.
async fn split_group(
    group: &PhysicalGroup,
    content_type: String,
    body: BlobBody,
) -> BlobResult<GroupParts> {
    if !group.is_widened() {
        let member = group.members()[0];
        return Ok(vec![(
            member.index,
            MultiRangePart {
                range: member.range,
                content_type,
                body,
            },
        )]);
    }

    let data = body.collect().await?;
    let base = group.range().start;
    group
        .members()
        .iter()
        .map(|member| {
            let bytes = slice_member(&data, base, member.range)?;
            Ok((
                member.index,
                MultiRangePart {
                    range: member.range,
                    content_type: content_type.clone(),
                    body: BlobBody::from_bytes(bytes),
                },
            ))
        })
        .collect()
}

/// Bytes of `range` within data fetched from offset `base`, clipped at the
/// end of the fetched data.
fn slice_member(data: &Bytes, base: u64, range: Range) -> BlobResult<Bytes> {
    let len = data.len() as u64;
    let offset = range.start - base;
    if offset >= len {
        return Err(BlobError::invalid_range(
            range.start,
            range.count,
            format!("starts beyond end of blob ({} bytes)", base + len),
        ));
    }
    let end = (offset + range.count).min(len);
    Ok(data.slice(offset as usize..end as usize))
}

fn assemble(requested: usize, fetched: Vec<GroupParts>) -> BlobResult<Vec<MultiRangePart>> {
    let mut slots: Vec<Option<MultiRangePart>> = (0..requested).map(|_| None).collect();
    for (index, part) in fetched.into_iter().flatten() {
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(part);
        }
    }
    slots
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| BlobError::Backend {
            source: anyhow::anyhow!("range plan did not cover all {} requested ranges", requested),
        })
}
