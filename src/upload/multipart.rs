//! Multipart upload handler
//!
//! Handles payloads larger than one chunk:
//!
//! 1. Plan the parts and start a multipart session.
//! 2. Queue every part on a bounded job channel sized to the part count,
//!    then close it.
//! 3. `parallel` workers drain the queue. Each reads its own byte range,
//!    uploads it with the part-tier retry, and sends the result back.
//! 4. The first worker to give up on a part cancels the group; the others
//!    stop pulling jobs once their current part is done.
//! 5. After every worker has exited, either the first failure is returned
//!    or the parts are merged in part-number order.

use super::retry::RetryPolicy;
use super::{
    planner, PartResult, PartSpec, Payload, UploadError, UploadHandler, UploadSource,
    UploadTarget,
};
use crate::metrics;
use crate::storage::StorageClient;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// State of one multipart session
#[derive(Debug, Clone)]
pub struct MultipartSession {
    pub upload_id: String,
    pub target: UploadTarget,
    pub plan: planner::PartPlan,
}

/// The failure that stopped a worker
#[derive(Debug)]
struct PartFailure {
    number: u32,
    error: UploadError,
}

/// Everything a worker needs, shared by all workers
struct WorkerContext {
    client: StorageClient,
    target: UploadTarget,
    source: UploadSource,
    upload_id: String,
    retry: RetryPolicy,
}

/// Multipart upload handler
#[derive(Debug, Clone)]
pub struct MultipartHandler {
    client: StorageClient,
    chunk_size: u64,
    parallel: usize,
    part_retry: RetryPolicy,
}

impl MultipartHandler {
    /// Create a new multipart handler
    ///
    /// `parallel` below 1 is treated as 1.
    pub fn new(client: StorageClient, chunk_size: u64, parallel: usize) -> Self {
        Self {
            client,
            chunk_size,
            parallel: parallel.max(1),
            part_retry: RetryPolicy::default(),
        }
    }

    /// Use `policy` for individual part uploads
    pub fn with_part_retry(mut self, policy: RetryPolicy) -> Self {
        self.part_retry = policy;
        self
    }

    pub fn parallel(&self) -> usize {
        self.parallel
    }

    /// Plan the parts and start the session on the target's host.
    #[tracing::instrument(
        name = "upload.multipart.create",
        skip(self, target),
        fields(host = %target.host(), object_id = %target.object_id),
        err
    )]
    pub async fn create(
        &self,
        target: &UploadTarget,
        size: u64,
        attempt: u32,
    ) -> Result<MultipartSession, UploadError> {
        let plan = planner::plan(size, self.chunk_size)?;
        let upload_id = self.client.init_multipart(target, attempt).await?;

        tracing::info!(
            upload_id = %upload_id,
            parts = plan.len(),
            "Created multipart upload"
        );

        Ok(MultipartSession {
            upload_id,
            target: target.clone(),
            plan,
        })
    }

    /// Upload every planned part through the worker pool.
    ///
    /// Returns the part results in part-number order, or the first failure.
    #[tracing::instrument(
        name = "upload.multipart.upload_parts",
        skip(self, session, source),
        fields(
            upload_id = %session.upload_id,
            parts_count = session.plan.len(),
            parallel = self.parallel
        ),
        err
    )]
    pub async fn upload_parts(
        &self,
        session: &MultipartSession,
        source: &UploadSource,
    ) -> Result<Vec<PartResult>, UploadError> {
        let total = session.plan.len();
        let workers = self.parallel.min(total.max(1));

        let (job_tx, job_rx) = async_channel::bounded::<PartSpec>(total.max(1));
        let (result_tx, mut result_rx) = mpsc::channel::<PartResult>(total.max(1));
        let (error_tx, mut error_rx) = mpsc::channel::<PartFailure>(workers);
        let quit = CancellationToken::new();

        let context = Arc::new(WorkerContext {
            client: self.client.clone(),
            target: session.target.clone(),
            source: source.clone(),
            upload_id: session.upload_id.clone(),
            retry: self.part_retry,
        });

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    context.clone(),
                    job_rx.clone(),
                    result_tx.clone(),
                    error_tx.clone(),
                    quit.clone(),
                ))
            })
            .collect();
        drop(job_rx);
        drop(result_tx);
        drop(error_tx);

        for spec in session.plan.iter() {
            // Capacity equals the part count, so this never waits.
            if job_tx.send(*spec).await.is_err() {
                break;
            }
        }
        job_tx.close();

        for joined in futures::future::join_all(handles).await {
            if let Err(e) = joined {
                quit.cancel();
                return Err(UploadError::MultipartError(format!(
                    "part worker did not finish: {}",
                    e
                )));
            }
        }

        if let Ok(failure) = error_rx.try_recv() {
            tracing::error!(
                part_number = failure.number,
                error = %failure.error,
                "Multipart upload aborted by part failure"
            );
            return Err(failure.error);
        }

        let mut results = Vec::with_capacity(total);
        while let Ok(part) = result_rx.try_recv() {
            results.push(part);
        }
        if results.len() != total {
            return Err(UploadError::MultipartError(format!(
                "expected {} part results, got {}",
                total,
                results.len()
            )));
        }
        results.sort_by_key(|p| p.number);
        Ok(results)
    }

    /// Merge the uploaded parts.
    ///
    /// The content type reported for part 1 rides along with the merge.
    #[tracing::instrument(
        name = "upload.multipart.complete",
        skip(self, session, parts),
        fields(upload_id = %session.upload_id, parts_count = parts.len()),
        err
    )]
    pub async fn complete(
        &self,
        session: &MultipartSession,
        parts: &[PartResult],
        attempt: u32,
    ) -> Result<(), UploadError> {
        let content_type = parts
            .iter()
            .find(|p| p.number == 1)
            .and_then(|p| p.content_type_hint.as_deref());

        self.client
            .merge_parts(&session.target, &session.upload_id, parts, content_type, attempt)
            .await?;

        tracing::info!(
            upload_id = %session.upload_id,
            parts = parts.len(),
            "Completed multipart upload"
        );
        Ok(())
    }

    async fn run(
        &self,
        target: &UploadTarget,
        source: &UploadSource,
        size: u64,
        attempt: u32,
    ) -> Result<usize, UploadError> {
        let session = self.create(target, size, attempt).await?;
        let parts = self.upload_parts(&session, source).await?;
        self.complete(&session, &parts, attempt).await?;
        Ok(parts.len())
    }
}

#[async_trait]
impl UploadHandler for MultipartHandler {
    async fn upload(
        &self,
        target: &UploadTarget,
        source: &UploadSource,
        size: u64,
        attempt: u32,
    ) -> Result<(), UploadError> {
        let start_time = Instant::now();
        let result = self.run(target, source, size, attempt).await;

        metrics::record_upload_duration(
            &target.space_name,
            self.method(),
            start_time.elapsed().as_secs_f64(),
        );
        match result {
            Ok(parts) => {
                metrics::record_multipart_upload_success(&target.space_name, parts);
                metrics::record_upload_success(&target.space_name, size);
                Ok(())
            }
            Err(e) => {
                metrics::record_multipart_upload_failure(&target.space_name);
                metrics::record_upload_failure(&target.space_name);
                Err(e)
            }
        }
    }

    fn method(&self) -> &'static str {
        "multipart"
    }
}

/// Drain the job queue until it is closed or the group is cancelled.
async fn worker(
    id: usize,
    context: Arc<WorkerContext>,
    jobs: async_channel::Receiver<PartSpec>,
    results: mpsc::Sender<PartResult>,
    errors: mpsc::Sender<PartFailure>,
    quit: CancellationToken,
) {
    while let Ok(spec) = jobs.recv().await {
        if quit.is_cancelled() {
            tracing::debug!(worker = id, part_number = spec.number, "Skipping part after failure");
            break;
        }

        let outcome = match context.source.read_part(&spec).await {
            Ok(data) => {
                context
                    .retry
                    .run(|attempt| {
                        context.client.upload_part(
                            &context.target,
                            &context.upload_id,
                            spec.number,
                            Payload::Bytes(data.clone()),
                            attempt,
                        )
                    })
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(part) => {
                if results.send(part).await.is_err() {
                    break;
                }
            }
            Err(error) => {
                quit.cancel();
                let _ = errors
                    .send(PartFailure {
                        number: spec.number,
                        error,
                    })
                    .await;
                return;
            }
        }
    }
}
