//! Multipart upload coordination.
//!
//! Tracks every upload started through a [`MultipartCoordinator`] as an
//! explicit state machine:
//!
//! ```text
//! Pending ──commit──▶ Committing ──▶ Committed
//!    │                    │
//!    ├──abort─────────────┼──────▶ Aborted
//!    └──expire────────────┴──────▶ Expired
//! ```
//!
//! Part uploads for one upload run through a per-upload semaphore, so
//! backends that cannot take parts in parallel see them strictly one at a
//! time while others get bounded concurrency.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt, TryStreamExt};
use opentelemetry::KeyValue;
use sha2::{Digest, Sha256};
use tokio::{sync::Semaphore, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    BeginOptions,
    BlobDescriptor,
    BlobError,
    BlobMetrics,
    BlobResult,
    PartDescriptor,
    StorageBackend,
    UploadConfig,
};

/// Lifecycle state of a multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    Pending,
    Committing,
    Committed,
    Aborted,
    Expired,
}

impl UploadState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadState::Committed | UploadState::Aborted | UploadState::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Pending => "pending",
            UploadState::Committing => "committing",
            UploadState::Committed => "committed",
            UploadState::Aborted => "aborted",
            UploadState::Expired => "expired",
        }
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpireReport {
    /// Uploads moved to `Expired` by this sweep.
    pub expired: Vec<String>,

    /// Orphaned uploads the backend reclaimed on its own.
    pub backend_reclaimed: usize,

    /// Finished uploads dropped from the registry.
    pub purged: usize,
}

struct SessionState {
    state: UploadState,
    parts: BTreeMap<u32, PartDescriptor>,
    /// Part uploads started, queued or running, and not yet finished.
    in_flight: usize,
    /// Bytes of recorded parts.
    bytes: u64,
    /// Bytes of parts still in flight.
    reserved: u64,
    committing_since: Option<Instant>,
    finished_at: Option<Instant>,
}

impl SessionState {
    fn finish(&mut self, state: UploadState) {
        self.state = state;
        self.finished_at = Some(Instant::now());
    }

    /// Part numbers a commit would be missing.
    fn missing_parts(&self, expected_parts: Option<u32>) -> Vec<u32> {
        let highest = self.parts.keys().next_back().copied().unwrap_or(0);
        let last = highest.max(expected_parts.unwrap_or(0)).max(1);
        (1..=last)
            .filter(|part_number| !self.parts.contains_key(part_number))
            .collect()
    }
}

struct UploadSession {
    key: String,
    upload_id: String,
    created_at: Instant,
    expected_parts: Option<u32>,
    permits: Semaphore,
    state: Mutex<SessionState>,
}

impl UploadSession {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn conflict(&self, state: UploadState, operation: &'static str) -> BlobError {
        BlobError::UploadStateConflict {
            upload_id: self.upload_id.clone(),
            state,
            operation,
        }
    }
}

/// Marks one part upload as in flight until dropped.
struct InFlightPart<'a> {
    session: &'a UploadSession,
    size: u64,
}

impl Drop for InFlightPart<'_> {
    fn drop(&mut self) {
        let mut state = self.session.lock();
        state.in_flight -= 1;
        state.reserved -= self.size;
    }
}

/// Aborts an upload whose commit was dropped while still `Committing`.
struct PendingCommit<'a> {
    shared: &'a Shared,
    session: &'a UploadSession,
    armed: bool,
}

impl PendingCommit<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingCommit<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.session.lock();
            if state.state != UploadState::Committing {
                return;
            }
            state.finish(UploadState::Aborted);
        }
        self.session.permits.close();
        warn!(
            key = %self.session.key,
            upload_id = %self.session.upload_id,
            "multipart commit cancelled, aborting upload"
        );
        self.shared.record_finished(UploadState::Aborted);

        let backend = self.shared.backend.clone();
        let key = self.session.key.clone();
        let upload_id = self.session.upload_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = backend.multipart_blob_abort(&key, &upload_id).await {
                        warn!(
                            upload_id = %upload_id,
                            error = %e,
                            "failed to release cancelled upload"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    upload_id = %upload_id,
                    "no runtime to release cancelled upload, leaving it to expiry"
                );
            }
        }
    }
}

struct Shared {
    backend: Arc<dyn StorageBackend>,
    config: UploadConfig,
    sessions: DashMap<String, Arc<UploadSession>>,
    metrics: Option<BlobMetrics>,
}

impl Shared {
    fn session(&self, upload_id: &str) -> BlobResult<Arc<UploadSession>> {
        self.sessions
            .get(upload_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BlobError::UploadNotFound {
                upload_id: upload_id.to_string(),
            })
    }

    fn part_concurrency(&self) -> usize {
        if self.backend.capabilities().no_parallel_multipart {
            1
        } else {
            self.config.concurrency.max(1)
        }
    }

    fn record_finished(&self, state: UploadState) {
        if let Some(metrics) = &self.metrics {
            metrics
                .uploads_finished
                .add(1, &[KeyValue::new("state", state.as_str())]);
        }
    }

    async fn add_part(
        &self,
        session: &UploadSession,
        part_number: u32,
        data: Bytes,
    ) -> BlobResult<PartDescriptor> {
        let caps = self.backend.capabilities();
        if part_number == 0 {
            return Err(BlobError::InvalidPart {
                part_number,
                reason: "part numbers start at 1".to_string(),
            });
        }
        if let Some(max_parts) = caps.max_parts {
            if part_number > max_parts {
                return Err(BlobError::InvalidPart {
                    part_number,
                    reason: format!("{} accepts at most {} parts", caps.name, max_parts),
                });
            }
        }

        let size = data.len() as u64;
        let _in_flight = {
            let mut state = session.lock();
            if state.state != UploadState::Pending {
                return Err(session.conflict(state.state, "add_part"));
            }
            let replaced = state.parts.get(&part_number).map_or(0, |p| p.size_bytes);
            let total = state.bytes - replaced + state.reserved + size;
            if total > caps.max_multipart_size {
                return Err(BlobError::ObjectTooLarge {
                    size: total,
                    max: caps.max_multipart_size,
                });
            }
            state.in_flight += 1;
            state.reserved += size;
            InFlightPart { session, size }
        };

        let _permit = match session.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let state = session.lock().state;
                return Err(session.conflict(state, "add_part"));
            }
        };
        {
            let state = session.lock();
            if state.state != UploadState::Pending {
                return Err(session.conflict(state.state, "add_part"));
            }
        }

        debug!(
            key = %session.key,
            upload_id = %session.upload_id,
            part_number,
            size,
            "adding multipart part"
        );
        let descriptor = self
            .backend
            .multipart_blob_add(&session.key, &session.upload_id, part_number, data)
            .await?;

        let mut state = session.lock();
        if state.state != UploadState::Pending {
            return Err(session.conflict(state.state, "add_part"));
        }
        if let Some(replaced) = state.parts.insert(part_number, descriptor.clone()) {
            state.bytes -= replaced.size_bytes;
        }
        state.bytes += descriptor.size_bytes;
        Ok(descriptor)
    }

    async fn commit(&self, session: &UploadSession) -> BlobResult<BlobDescriptor> {
        let parts: Vec<PartDescriptor> = {
            let mut state = session.lock();
            if state.state != UploadState::Pending {
                return Err(session.conflict(state.state, "commit"));
            }
            if state.in_flight > 0 {
                return Err(BlobError::PartsInFlight {
                    upload_id: session.upload_id.clone(),
                    in_flight: state.in_flight,
                });
            }
            let missing = state.missing_parts(session.expected_parts);
            if !missing.is_empty() {
                return Err(BlobError::MissingParts {
                    upload_id: session.upload_id.clone(),
                    missing,
                });
            }
            state.state = UploadState::Committing;
            state.committing_since = Some(Instant::now());
            state.parts.values().cloned().collect()
        };

        let mut pending = PendingCommit {
            shared: self,
            session,
            armed: true,
        };
        let result = self
            .backend
            .multipart_blob_commit(&session.key, &session.upload_id, &parts)
            .await;
        pending.disarm();

        match result {
            Ok(descriptor) => {
                {
                    let mut state = session.lock();
                    if state.state != UploadState::Committing {
                        return Err(session.conflict(state.state, "commit"));
                    }
                    state.finish(UploadState::Committed);
                }
                info!(
                    key = %session.key,
                    upload_id = %session.upload_id,
                    parts = parts.len(),
                    "multipart upload committed"
                );
                self.record_finished(UploadState::Committed);
                Ok(descriptor)
            }
            Err(e) => {
                {
                    let mut state = session.lock();
                    if state.state != UploadState::Committing {
                        // Aborted or expired while the backend call ran.
                        return Err(e);
                    }
                    state.finish(UploadState::Aborted);
                }
                session.permits.close();
                warn!(
                    key = %session.key,
                    upload_id = %session.upload_id,
                    error = %e,
                    "multipart commit failed, aborting upload"
                );
                if let Err(abort_err) = self
                    .backend
                    .multipart_blob_abort(&session.key, &session.upload_id)
                    .await
                {
                    warn!(
                        upload_id = %session.upload_id,
                        error = %abort_err,
                        "failed to release aborted upload"
                    );
                }
                self.record_finished(UploadState::Aborted);
                Err(e)
            }
        }
    }

    async fn abort(&self, session: &UploadSession) -> BlobResult<()> {
        let previous = {
            let mut state = session.lock();
            if state.state.is_terminal() {
                return Ok(());
            }
            let previous = state.state;
            state.finish(UploadState::Aborted);
            previous
        };
        session.permits.close();
        info!(
            key = %session.key,
            upload_id = %session.upload_id,
            from = %previous,
            "multipart upload aborted"
        );
        self.record_finished(UploadState::Aborted);
        self.backend
            .multipart_blob_abort(&session.key, &session.upload_id)
            .await
    }
}

/// Drives multipart uploads against one backend.
///
/// Cloning is cheap; clones share the same upload registry.
#[derive(Clone)]
pub struct MultipartCoordinator {
    shared: Arc<Shared>,
}

impl MultipartCoordinator {
    pub fn new(backend: Arc<dyn StorageBackend>, config: UploadConfig) -> Self {
        Self::build(backend, config, None)
    }

    pub fn with_metrics(
        backend: Arc<dyn StorageBackend>,
        config: UploadConfig,
        metrics: BlobMetrics,
    ) -> Self {
        Self::build(backend, config, Some(metrics))
    }

    fn build(
        backend: Arc<dyn StorageBackend>,
        config: UploadConfig,
        metrics: Option<BlobMetrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                sessions: DashMap::new(),
                metrics,
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.shared.backend
    }

    /// Start a new upload of `key`.
    ///
    /// A `size_hint` above the backend's multipart limit fails with
    /// `ObjectTooLarge` before the backend is contacted.
    pub async fn begin(&self, key: &str, options: BeginOptions) -> BlobResult<MultipartUpload> {
        let shared = &self.shared;
        let caps = shared.backend.capabilities();
        if !caps.supports_multipart() {
            return Err(BlobError::unsupported("multipart_begin", caps.name.clone()));
        }
        if let Some(size) = options.size_hint {
            if size > caps.max_multipart_size {
                return Err(BlobError::ObjectTooLarge {
                    size,
                    max: caps.max_multipart_size,
                });
            }
        }
        if let (Some(expected), Some(max_parts)) = (options.expected_parts, caps.max_parts) {
            if expected > max_parts {
                return Err(BlobError::InvalidPart {
                    part_number: expected,
                    reason: format!("{} accepts at most {} parts", caps.name, max_parts),
                });
            }
        }

        let _timer = shared.metrics.as_ref().map(|m| m.timer("multipart_begin"));
        let upload_id = shared.backend.multipart_blob_begin(key, &options).await?;
        let session = Arc::new(UploadSession {
            key: key.to_string(),
            upload_id: upload_id.clone(),
            created_at: Instant::now(),
            expected_parts: options.expected_parts,
            permits: Semaphore::new(shared.part_concurrency()),
            state: Mutex::new(SessionState {
                state: UploadState::Pending,
                parts: BTreeMap::new(),
                in_flight: 0,
                bytes: 0,
                reserved: 0,
                committing_since: None,
                finished_at: None,
            }),
        });
        shared.sessions.insert(upload_id.clone(), session.clone());
        info!(
            key,
            upload_id = %upload_id,
            backend = %caps.name,
            "multipart upload started"
        );

        Ok(MultipartUpload {
            shared: shared.clone(),
            session,
        })
    }

    /// Handle for an upload started earlier.
    pub fn upload(&self, upload_id: &str) -> BlobResult<MultipartUpload> {
        Ok(MultipartUpload {
            shared: self.shared.clone(),
            session: self.shared.session(upload_id)?,
        })
    }

    pub fn state(&self, upload_id: &str) -> BlobResult<UploadState> {
        Ok(self.shared.session(upload_id)?.lock().state)
    }

    pub async fn add_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> BlobResult<PartDescriptor> {
        let session = self.shared.session(upload_id)?;
        self.shared.add_part(&session, part_number, data).await
    }

    pub async fn commit(&self, upload_id: &str) -> BlobResult<BlobDescriptor> {
        let session = self.shared.session(upload_id)?;
        self.shared.commit(&session).await
    }

    /// Abort an upload. Unknown ids and finished uploads are left alone.
    pub async fn abort(&self, upload_id: &str) -> BlobResult<()> {
        match self.shared.session(upload_id) {
            Ok(session) => self.shared.abort(&session).await,
            Err(_) => Ok(()),
        }
    }

    /// Expire pending uploads older than `older_than`, and commits stuck in
    /// `Committing` for that long, releasing their backend resources.
    pub async fn expire(&self, older_than: Duration) -> BlobResult<ExpireReport> {
        enum Sweep {
            Keep,
            Expire,
            Purge,
        }

        let shared = &self.shared;
        let now = Instant::now();
        let sessions: Vec<Arc<UploadSession>> = shared
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut report = ExpireReport::default();
        for session in sessions {
            let sweep = {
                let mut state = session.lock();
                let age = now.duration_since(session.created_at);
                let stalled = state
                    .committing_since
                    .is_some_and(|since| now.duration_since(since) >= older_than);
                let stale = match state.state {
                    UploadState::Pending => age >= older_than,
                    UploadState::Committing => stalled,
                    _ => false,
                };
                if stale {
                    state.finish(UploadState::Expired);
                    Sweep::Expire
                } else if state
                    .finished_at
                    .is_some_and(|at| now.duration_since(at) >= older_than)
                {
                    Sweep::Purge
                } else {
                    Sweep::Keep
                }
            };

            match sweep {
                Sweep::Expire => {
                    session.permits.close();
                    info!(
                        key = %session.key,
                        upload_id = %session.upload_id,
                        "multipart upload expired"
                    );
                    shared.record_finished(UploadState::Expired);
                    if let Err(e) = shared
                        .backend
                        .multipart_blob_abort(&session.key, &session.upload_id)
                        .await
                    {
                        warn!(
                            upload_id = %session.upload_id,
                            error = %e,
                            "failed to release expired upload"
                        );
                    }
                    report.expired.push(session.upload_id.clone());
                }
                Sweep::Purge => {
                    shared.sessions.remove(&session.upload_id);
                    report.purged += 1;
                }
                Sweep::Keep => {}
            }
        }

        match shared.backend.multipart_expire(older_than).await {
            Ok(reclaimed) => report.backend_reclaimed = reclaimed,
            Err(e) if e.is_unsupported() => {
                debug!(
                    backend = %shared.backend.capabilities().name,
                    "backend does not list uploads, skipping orphan sweep"
                );
            }
            Err(e) => return Err(e),
        }

        Ok(report)
    }

    /// Upload a stream of chunks as one blob, one part per chunk.
    ///
    /// Parts are uploaded concurrently where the backend allows it. The
    /// returned descriptor carries the SHA-256 of the content. Any failure,
    /// including cancellation, aborts the upload.
    pub async fn upload_stream<S>(
        &self,
        key: &str,
        chunks: S,
        options: BeginOptions,
        cancel: &CancellationToken,
    ) -> BlobResult<BlobDescriptor>
    where
        S: Stream<Item = BlobResult<Bytes>> + Send,
    {
        let upload = self.begin(key, options).await?;
        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;

        let result = {
            let parts = chunks
                .enumerate()
                .map(|(index, chunk)| -> BlobResult<(u32, Bytes)> {
                    let chunk = chunk?;
                    let part_number = u32::try_from(index + 1).map_err(|_| BlobError::InvalidPart {
                        part_number: u32::MAX,
                        reason: "too many parts".to_string(),
                    })?;
                    hasher.update(&chunk);
                    size_bytes += chunk.len() as u64;
                    Ok((part_number, chunk))
                })
                .map_ok(|(part_number, chunk)| upload.add_part(part_number, chunk))
                .try_buffer_unordered(self.shared.part_concurrency())
                .try_collect::<Vec<PartDescriptor>>();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BlobError::Cancelled),
                added = parts => match added {
                    Ok(_) => upload.commit().await,
                    Err(e) => Err(e),
                },
            }
        };

        match result {
            Ok(descriptor) => Ok(BlobDescriptor {
                size_bytes: Some(size_bytes),
                sha256_hash: Some(format!("{:x}", hasher.finalize())),
                ..descriptor
            }),
            Err(e) => {
                if let Err(abort_err) = upload.abort().await {
                    warn!(
                        upload_id = %upload.upload_id(),
                        error = %abort_err,
                        "failed to abort upload after error"
                    );
                }
                Err(e)
            }
        }
    }
}

/// Handle to one multipart upload.
#[derive(Clone)]
pub struct MultipartUpload {
    shared: Arc<Shared>,
    session: Arc<UploadSession>,
}

impl fmt::Debug for MultipartUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartUpload")
            .field("key", &self.session.key)
            .field("upload_id", &self.session.upload_id)
            .field("state", &self.state())
            .finish()
    }
}

impl MultipartUpload {
    pub fn key(&self) -> &str {
        &self.session.key
    }

    pub fn upload_id(&self) -> &str {
        &self.session.upload_id
    }

    pub fn state(&self) -> UploadState {
        self.session.lock().state
    }

    /// Recorded parts, ordered by part number.
    pub fn parts(&self) -> Vec<PartDescriptor> {
        self.session.lock().parts.values().cloned().collect()
    }

    /// Upload one part. Part numbers start at 1; re-adding a part number
    /// replaces the earlier part.
    pub async fn add_part(&self, part_number: u32, data: Bytes) -> BlobResult<PartDescriptor> {
        self.shared.add_part(&self.session, part_number, data).await
    }

    /// Combine the recorded parts into the final blob.
    ///
    /// Fails without contacting the backend while parts are in flight or
    /// missing; the upload stays `Pending` in that case.
    pub async fn commit(&self) -> BlobResult<BlobDescriptor> {
        self.shared.commit(&self.session).await
    }

    /// Abort the upload. No-op once the upload has finished.
    pub async fn abort(&self) -> BlobResult<()> {
        self.shared.abort(&self.session).await
    }
}
