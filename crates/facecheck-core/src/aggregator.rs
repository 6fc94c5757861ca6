//! Comparison aggregator.
//!
//! For a run with a selected reference, extracts attributes from every image
//! and compares every other image against the reference. Each extraction and
//! each comparison is an independent job on a bounded pool of blocking
//! workers. Per-image failures are recorded as [`Outcome::Failed`] and never
//! abort the batch; the run's results are replaced in one step once every job
//! has resolved or the deadline has passed.

use crate::capability::{AttributeExtractor, CapabilityError, FaceMatcher};
use crate::config::{AggregatorConfig, AnalysisConfig};
use crate::run::AnalysisRun;
use crate::types::{
    AttributeResult, ComparisonResult, FailureReason, ImageId, Outcome, UploadedImage,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregateError {
    #[error("no reference image selected")]
    NoReferenceSelected,
    #[error("analysis cancelled")]
    Cancelled,
}

/// Cancellation signal shared between the caller and a running aggregation.
///
/// Once cancelled, no new jobs are dispatched and results still in flight are
/// discarded. Calls already running on a worker are not interrupted.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Counts for one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateSummary {
    pub extracted: usize,
    pub extraction_failures: usize,
    pub compared: usize,
    pub comparison_failures: usize,
    /// Jobs that missed the deadline (included in the failure counts).
    pub timed_out: usize,
    pub elapsed_ms: u64,
}

/// A unit of work. Ordering puts all extractions before comparisons, each in
/// upload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Job {
    Extract(ImageId),
    Compare(ImageId),
}

enum JobOutput {
    Attributes(ImageId, Outcome<AttributeResult>),
    Comparison(ImageId, Outcome<ComparisonResult>),
}

impl JobOutput {
    fn job(&self) -> Job {
        match self {
            JobOutput::Attributes(id, _) => Job::Extract(*id),
            JobOutput::Comparison(id, _) => Job::Compare(*id),
        }
    }
}

/// Shared, read-only inputs for every job of one pass.
struct JobContext {
    extractor: Arc<dyn AttributeExtractor>,
    matcher: Arc<dyn FaceMatcher>,
    config: AnalysisConfig,
    reference: Arc<UploadedImage>,
}

enum Dispatch {
    Cancelled,
    Deadline,
    Permit(OwnedSemaphorePermit),
}

enum Collect {
    Cancelled,
    Deadline,
    Joined(Option<Result<JobOutput, JoinError>>),
}

/// Drives extractor and matcher calls for analysis runs.
///
/// Holds the process-wide capability instances; create one at startup and
/// reuse it for every run.
pub struct Aggregator {
    extractor: Arc<dyn AttributeExtractor>,
    matcher: Arc<dyn FaceMatcher>,
    workers: usize,
    timeout: Duration,
}

impl Aggregator {
    pub fn new(
        extractor: Arc<dyn AttributeExtractor>,
        matcher: Arc<dyn FaceMatcher>,
        config: &AggregatorConfig,
    ) -> Self {
        Self {
            extractor,
            matcher,
            workers: config.workers.max(1),
            timeout: config.timeout(),
        }
    }

    /// Override the per-run deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Compute attribute and comparison outcomes for every image in `run`.
    ///
    /// Overwrites any results from a previous pass. On `Cancelled` the run is
    /// left exactly as it was.
    pub async fn aggregate(
        &self,
        run: &mut AnalysisRun,
        cancel: &CancelToken,
    ) -> Result<AggregateSummary, AggregateError> {
        let reference_id = run.reference().ok_or(AggregateError::NoReferenceSelected)?;
        let reference = run
            .image(reference_id)
            .cloned()
            .ok_or(AggregateError::NoReferenceSelected)?;

        let started = Instant::now();
        let deadline = started + self.timeout;
        let ctx = Arc::new(JobContext {
            extractor: Arc::clone(&self.extractor),
            matcher: Arc::clone(&self.matcher),
            config: run.config.clone(),
            reference,
        });

        let jobs = plan_jobs(run.images(), reference_id);
        tracing::info!(
            run = %run.id,
            reference = %reference_id,
            jobs = jobs.len(),
            workers = self.workers,
            timeout_ms = self.timeout.as_millis() as u64,
            "aggregation started"
        );

        let mut pending: BTreeSet<Job> = jobs.iter().map(|(job, _)| *job).collect();
        let mut attributes = BTreeMap::new();
        let mut comparisons = BTreeMap::new();
        let mut timed_out = false;

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for (job, image) in jobs {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Dispatch::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Dispatch::Deadline,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => Dispatch::Permit(permit),
                    // The semaphore is never closed.
                    Err(_) => Dispatch::Deadline,
                },
            };
            let permit = match next {
                Dispatch::Permit(permit) => permit,
                Dispatch::Cancelled => return Err(cancelled(run)),
                Dispatch::Deadline => {
                    timed_out = true;
                    break;
                }
            };

            let ctx = Arc::clone(&ctx);
            tracing::debug!(?job, "dispatching job");
            tasks.spawn_blocking(move || {
                let _permit = permit;
                std::panic::catch_unwind(AssertUnwindSafe(|| execute(job, &image, &ctx)))
                    .unwrap_or_else(|_| panicked(job))
            });
        }

        // Drain finished jobs; ready results win over an expired deadline.
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => Collect::Cancelled,
                joined = tasks.join_next() => Collect::Joined(joined),
                _ = tokio::time::sleep_until(deadline) => Collect::Deadline,
            };
            match next {
                Collect::Cancelled => return Err(cancelled(run)),
                Collect::Deadline => {
                    timed_out = true;
                    break;
                }
                Collect::Joined(None) => break,
                Collect::Joined(Some(Ok(output))) => {
                    pending.remove(&output.job());
                    match output {
                        JobOutput::Attributes(id, outcome) => {
                            attributes.insert(id, outcome);
                        }
                        JobOutput::Comparison(id, outcome) => {
                            comparisons.insert(id, outcome);
                        }
                    }
                }
                Collect::Joined(Some(Err(err))) => {
                    tracing::error!(error = %err, "aggregation worker terminated");
                }
            }
        }
        // Dropping the set discards results still in flight.
        drop(tasks);

        let mut summary = AggregateSummary::default();
        for job in pending {
            let reason = if timed_out {
                summary.timed_out += 1;
                FailureReason::Timeout
            } else {
                match job {
                    Job::Extract(_) => FailureReason::ExtractionError("worker terminated".into()),
                    Job::Compare(_) => FailureReason::ComparisonError("worker terminated".into()),
                }
            };
            tracing::warn!(?job, %reason, "job did not complete");
            match job {
                Job::Extract(id) => {
                    attributes.insert(id, Outcome::Failed(reason));
                }
                Job::Compare(id) => {
                    comparisons.insert(id, Outcome::Failed(reason));
                }
            }
        }

        summary.extracted = attributes.values().filter(|o| o.is_ok()).count();
        summary.extraction_failures = attributes.len() - summary.extracted;
        summary.compared = comparisons.values().filter(|o| o.is_ok()).count();
        summary.comparison_failures = comparisons.len() - summary.compared;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        run.commit(attributes, comparisons);
        tracing::info!(
            run = %run.id,
            extracted = summary.extracted,
            extraction_failures = summary.extraction_failures,
            compared = summary.compared,
            comparison_failures = summary.comparison_failures,
            timed_out = summary.timed_out,
            elapsed_ms = summary.elapsed_ms,
            "aggregation finished"
        );
        Ok(summary)
    }
}

fn cancelled(run: &AnalysisRun) -> AggregateError {
    tracing::info!(run = %run.id, "aggregation cancelled; in-flight results discarded");
    AggregateError::Cancelled
}

/// One extraction per image, one comparison per non-reference image.
fn plan_jobs(images: &[Arc<UploadedImage>], reference: ImageId) -> Vec<(Job, Arc<UploadedImage>)> {
    let extractions = images
        .iter()
        .map(|img| (Job::Extract(img.id), Arc::clone(img)));
    let comparisons = images
        .iter()
        .filter(|img| img.id != reference)
        .map(|img| (Job::Compare(img.id), Arc::clone(img)));
    extractions.chain(comparisons).collect()
}

fn execute(job: Job, image: &UploadedImage, ctx: &JobContext) -> JobOutput {
    match job {
        Job::Extract(image_id) => {
            let outcome = match ctx.extractor.extract(image, &ctx.config) {
                Ok(attributes) => Outcome::Ok(AttributeResult {
                    image_id,
                    attributes,
                }),
                Err(err) => {
                    tracing::warn!(image = %image_id, error = %err, "attribute extraction failed");
                    Outcome::Failed(extraction_failure(err))
                }
            };
            JobOutput::Attributes(image_id, outcome)
        }
        Job::Compare(image_id) => {
            let reference = &ctx.reference;
            let outcome = match ctx.matcher.compare(image, reference, &ctx.config) {
                Ok(score) => Outcome::Ok(ComparisonResult {
                    image_id,
                    reference_id: reference.id,
                    distance: score.distance,
                    verified: score.verified,
                    threshold: ctx.config.threshold(),
                    metric: ctx.config.distance_metric,
                }),
                Err(err) => {
                    tracing::warn!(
                        image = %image_id,
                        reference = %reference.id,
                        error = %err,
                        "face comparison failed"
                    );
                    Outcome::Failed(comparison_failure(err))
                }
            };
            JobOutput::Comparison(image_id, outcome)
        }
    }
}

/// A job whose capability call panicked resolves as a failure of its own kind.
fn panicked(job: Job) -> JobOutput {
    tracing::error!(?job, "capability call panicked");
    let reason = "worker panicked".to_string();
    match job {
        Job::Extract(id) => {
            JobOutput::Attributes(id, Outcome::Failed(FailureReason::ExtractionError(reason)))
        }
        Job::Compare(id) => {
            JobOutput::Comparison(id, Outcome::Failed(FailureReason::ComparisonError(reason)))
        }
    }
}

fn extraction_failure(err: CapabilityError) -> FailureReason {
    match err {
        CapabilityError::Comparison(msg) => FailureReason::ExtractionError(msg),
        other => other.into(),
    }
}

fn comparison_failure(err: CapabilityError) -> FailureReason {
    match err {
        CapabilityError::Extraction(msg) => FailureReason::ComparisonError(msg),
        other => other.into(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::IngestLimits;
    use crate::ingest::{ingest, test_png, Upload};
    use crate::types::{FaceAttributes, Gender, Labeled, MatchScore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Deterministic backend: behaviour keyed by filename.
    #[derive(Default)]
    pub(crate) struct Scripted {
        pub no_face_extract: Vec<&'static str>,
        pub no_face_compare: Vec<&'static str>,
        pub panic_extract: Vec<&'static str>,
        pub slow: Vec<(&'static str, Duration)>,
        pub completed: Mutex<Vec<String>>,
        pub active: AtomicUsize,
        pub max_active: AtomicUsize,
    }

    impl Scripted {
        fn enter(&self, image: &UploadedImage) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if let Some((_, delay)) = self.slow.iter().find(|(name, _)| *name == image.filename) {
                std::thread::sleep(*delay);
            }
        }

        fn leave(&self, image: &UploadedImage) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.lock().unwrap().push(image.filename.clone());
        }
    }

    impl AttributeExtractor for Scripted {
        fn extract(
            &self,
            image: &UploadedImage,
            _config: &AnalysisConfig,
        ) -> Result<FaceAttributes, CapabilityError> {
            self.enter(image);
            if self.panic_extract.contains(&image.filename.as_str()) {
                panic!("extractor crashed on {}", image.filename);
            }
            let result = if self.no_face_extract.contains(&image.filename.as_str()) {
                Err(CapabilityError::NoFaceDetected)
            } else {
                Ok(FaceAttributes {
                    age: Some(20.0 + image.id.0 as f32),
                    gender: Some(Labeled { label: Gender::Woman, confidence: 0.9 }),
                    ..FaceAttributes::default()
                })
            };
            self.leave(image);
            result
        }
    }

    impl FaceMatcher for Scripted {
        fn compare(
            &self,
            probe: &UploadedImage,
            reference: &UploadedImage,
            config: &AnalysisConfig,
        ) -> Result<MatchScore, CapabilityError> {
            self.enter(probe);
            let result = if self.no_face_compare.contains(&probe.filename.as_str()) {
                Err(CapabilityError::NoFaceDetected)
            } else {
                let distance = probe.id.0.abs_diff(reference.id.0) as f32 * 0.25;
                Ok(MatchScore { distance, verified: distance <= config.threshold() })
            };
            self.leave(probe);
            result
        }
    }

    pub(crate) fn make_run(n: usize) -> AnalysisRun {
        let uploads = (0..n)
            .map(|i| Upload::new(format!("{}.png", i + 1), test_png(3, 3, i as u8 * 20)))
            .collect();
        AnalysisRun::new(
            ingest(uploads, &IngestLimits::default()).unwrap(),
            AnalysisConfig::default(),
        )
    }

    pub(crate) fn aggregator(backend: Arc<Scripted>, workers: usize) -> Aggregator {
        let config = AggregatorConfig { workers, timeout_secs: 10 };
        Aggregator::new(backend.clone(), backend, &config)
    }

    #[tokio::test]
    async fn test_requires_reference() {
        let mut run = make_run(2);
        let err = aggregator(Arc::new(Scripted::default()), 2)
            .aggregate(&mut run, &CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, AggregateError::NoReferenceSelected);
    }

    #[tokio::test]
    async fn test_three_images_reference_two_third_has_no_face() {
        let backend = Arc::new(Scripted {
            no_face_extract: vec!["3.png"],
            no_face_compare: vec!["3.png"],
            ..Scripted::default()
        });
        let mut run = make_run(3);
        run.select_reference(ImageId(1)).unwrap();

        let summary = aggregator(backend, 4)
            .aggregate(&mut run, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(run.attributes().len(), 3);
        assert!(run.attributes()[&ImageId(0)].is_ok());
        assert!(run.attributes()[&ImageId(1)].is_ok());
        assert_eq!(
            run.attributes()[&ImageId(2)],
            Outcome::Failed(FailureReason::NoFaceDetected)
        );

        let compared: Vec<_> = run.comparisons().keys().copied().collect();
        assert_eq!(compared, vec![ImageId(0), ImageId(2)]);
        let first = run.comparisons()[&ImageId(0)].ok().unwrap();
        assert_eq!(first.reference_id, ImageId(1));
        assert!((first.distance - 0.25).abs() < 1e-6);
        assert!(first.verified);
        assert_eq!(
            run.comparisons()[&ImageId(2)],
            Outcome::Failed(FailureReason::NoFaceDetected)
        );

        assert_eq!(summary.extracted, 2);
        assert_eq!(summary.extraction_failures, 1);
        assert_eq!(summary.compared, 1);
        assert_eq!(summary.comparison_failures, 1);
        assert!(run.is_finalized());
    }

    #[tokio::test]
    async fn test_comparison_count_excludes_reference() {
        for reference in 0..5u32 {
            let mut run = make_run(5);
            run.select_reference(ImageId(reference)).unwrap();
            aggregator(Arc::new(Scripted::default()), 3)
                .aggregate(&mut run, &CancelToken::new())
                .await
                .unwrap();
            assert_eq!(run.comparisons().len(), 4);
            assert!(!run.comparisons().contains_key(&ImageId(reference)));
            assert!(run
                .comparisons()
                .values()
                .all(|o| o.ok().unwrap().reference_id == ImageId(reference)));
        }
    }

    #[tokio::test]
    async fn test_extraction_and_comparison_are_independent() {
        let backend = Arc::new(Scripted {
            no_face_extract: vec!["1.png"],
            no_face_compare: vec!["3.png"],
            ..Scripted::default()
        });
        let mut run = make_run(3);
        run.select_reference(ImageId(1)).unwrap();
        aggregator(backend, 2)
            .aggregate(&mut run, &CancelToken::new())
            .await
            .unwrap();

        // #1: extraction failed, comparison succeeded
        assert!(!run.attributes()[&ImageId(0)].is_ok());
        assert!(run.comparisons()[&ImageId(0)].is_ok());
        // #3: extraction succeeded, comparison failed
        assert!(run.attributes()[&ImageId(2)].is_ok());
        assert!(!run.comparisons()[&ImageId(2)].is_ok());
    }

    #[tokio::test]
    async fn test_aggregation_is_idempotent() {
        let backend = Arc::new(Scripted {
            no_face_compare: vec!["2.png"],
            ..Scripted::default()
        });
        let aggregator = aggregator(backend, 4);
        let mut run = make_run(4);
        run.select_reference(ImageId(0)).unwrap();

        aggregator.aggregate(&mut run, &CancelToken::new()).await.unwrap();
        let first = (run.attributes().clone(), run.comparisons().clone());
        aggregator.aggregate(&mut run, &CancelToken::new()).await.unwrap();

        assert_eq!(run.attributes(), &first.0);
        assert_eq!(run.comparisons(), &first.1);
        assert_eq!(run.attributes().len(), 4);
        assert_eq!(run.comparisons().len(), 3);
    }

    #[tokio::test]
    async fn test_results_keep_upload_order_when_completion_differs() {
        let backend = Arc::new(Scripted {
            slow: vec![("1.png", Duration::from_millis(150))],
            ..Scripted::default()
        });
        let mut run = make_run(4);
        run.select_reference(ImageId(3)).unwrap();
        aggregator(backend.clone(), 8)
            .aggregate(&mut run, &CancelToken::new())
            .await
            .unwrap();

        let completed = backend.completed.lock().unwrap().clone();
        assert_eq!(completed.last().map(String::as_str), Some("1.png"));

        let order: Vec<_> = run.attributes().keys().copied().collect();
        assert_eq!(order, vec![ImageId(0), ImageId(1), ImageId(2), ImageId(3)]);
        let order: Vec<_> = run.comparisons().keys().copied().collect();
        assert_eq!(order, vec![ImageId(0), ImageId(1), ImageId(2)]);
    }

    #[tokio::test]
    async fn test_reselecting_reference_recomputes_comparisons() {
        let aggregator = aggregator(Arc::new(Scripted::default()), 4);
        let mut run = make_run(3);
        run.select_reference(ImageId(1)).unwrap();
        aggregator.aggregate(&mut run, &CancelToken::new()).await.unwrap();
        assert_eq!(run.comparisons().len(), 2);

        run.select_reference(ImageId(0)).unwrap();
        assert!(run.comparisons().is_empty());
        assert!(!run.is_finalized());

        aggregator.aggregate(&mut run, &CancelToken::new()).await.unwrap();
        let compared: Vec<_> = run.comparisons().keys().copied().collect();
        assert_eq!(compared, vec![ImageId(1), ImageId(2)]);
        assert!(run
            .comparisons()
            .values()
            .all(|o| o.ok().unwrap().reference_id == ImageId(0)));
        let third = run.comparisons()[&ImageId(2)].ok().unwrap();
        assert!((third.distance - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_reselecting_same_reference_keeps_results() {
        let aggregator = aggregator(Arc::new(Scripted::default()), 4);
        let mut run = make_run(2);
        run.select_reference(ImageId(0)).unwrap();
        aggregator.aggregate(&mut run, &CancelToken::new()).await.unwrap();
        run.select_reference(ImageId(0)).unwrap();
        assert_eq!(run.comparisons().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_jobs_time_out() {
        let backend = Arc::new(Scripted {
            slow: vec![("2.png", Duration::from_millis(600))],
            ..Scripted::default()
        });
        let mut run = make_run(3);
        run.select_reference(ImageId(0)).unwrap();
        let summary = aggregator(backend, 4)
            .with_timeout(Duration::from_millis(100))
            .aggregate(&mut run, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(run.attributes()[&ImageId(1)], Outcome::Failed(FailureReason::Timeout));
        assert_eq!(run.comparisons()[&ImageId(1)], Outcome::Failed(FailureReason::Timeout));
        assert!(run.attributes()[&ImageId(0)].is_ok());
        assert!(run.comparisons()[&ImageId(2)].is_ok());
        assert_eq!(summary.timed_out, 2);
        assert!(run.is_finalized());
    }

    #[tokio::test]
    async fn test_panicked_job_is_not_reported_as_timeout() {
        let backend = Arc::new(Scripted {
            panic_extract: vec!["2.png"],
            slow: vec![("3.png", Duration::from_millis(600))],
            ..Scripted::default()
        });
        let mut run = make_run(3);
        run.select_reference(ImageId(0)).unwrap();
        let summary = aggregator(backend, 4)
            .with_timeout(Duration::from_millis(150))
            .aggregate(&mut run, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(
            run.attributes()[&ImageId(1)],
            Outcome::Failed(FailureReason::ExtractionError("worker panicked".into()))
        );
        assert!(run.comparisons()[&ImageId(1)].is_ok());
        assert_eq!(run.attributes()[&ImageId(2)], Outcome::Failed(FailureReason::Timeout));
        assert_eq!(summary.timed_out, 2);
        assert_eq!(summary.extraction_failures, 2);
    }

    #[tokio::test]
    async fn test_undispatched_jobs_time_out() {
        // One worker stuck on a slow job: the remaining jobs never start.
        let backend = Arc::new(Scripted {
            slow: vec![("1.png", Duration::from_millis(400))],
            ..Scripted::default()
        });
        let mut run = make_run(3);
        run.select_reference(ImageId(0)).unwrap();
        let summary = aggregator(backend, 1)
            .with_timeout(Duration::from_millis(80))
            .aggregate(&mut run, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(run.attributes().len(), 3);
        assert_eq!(run.comparisons().len(), 2);
        assert_eq!(summary.timed_out, 5);
        assert!(run
            .attributes()
            .values()
            .all(|o| o.failure() == Some(&FailureReason::Timeout)));
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let backend = Arc::new(Scripted {
            slow: vec![
                ("1.png", Duration::from_millis(20)),
                ("2.png", Duration::from_millis(20)),
                ("3.png", Duration::from_millis(20)),
            ],
            ..Scripted::default()
        });
        let mut run = make_run(5);
        run.select_reference(ImageId(0)).unwrap();
        aggregator(backend.clone(), 2)
            .aggregate(&mut run, &CancelToken::new())
            .await
            .unwrap();
        assert!(backend.max_active.load(Ordering::SeqCst) <= 2);
        assert_eq!(backend.completed.lock().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_run_untouched() {
        let backend = Arc::new(Scripted::default());
        let mut run = make_run(2);
        run.select_reference(ImageId(0)).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = aggregator(backend.clone(), 2)
            .aggregate(&mut run, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, AggregateError::Cancelled);
        assert!(run.attributes().is_empty());
        assert!(backend.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_discards_late_results() {
        let mut run = make_run(3);
        run.select_reference(ImageId(0)).unwrap();
        aggregator(Arc::new(Scripted::default()), 2)
            .aggregate(&mut run, &CancelToken::new())
            .await
            .unwrap();
        let before = (run.attributes().clone(), run.comparisons().clone());

        let slow = Arc::new(Scripted {
            no_face_extract: vec!["1.png", "2.png", "3.png"],
            slow: vec![("2.png", Duration::from_millis(300))],
            ..Scripted::default()
        });
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = aggregator(slow, 1).aggregate(&mut run, &cancel).await.unwrap_err();
        assert_eq!(err, AggregateError::Cancelled);
        assert_eq!(run.attributes(), &before.0);
        assert_eq!(run.comparisons(), &before.1);
    }

    #[test]
    fn test_plan_jobs_skips_reference_comparison() {
        let run = make_run(3);
        let jobs: Vec<Job> = plan_jobs(run.images(), ImageId(1))
            .into_iter()
            .map(|(job, _)| job)
            .collect();
        assert_eq!(
            jobs,
            vec![
                Job::Extract(ImageId(0)),
                Job::Extract(ImageId(1)),
                Job::Extract(ImageId(2)),
                Job::Compare(ImageId(0)),
                Job::Compare(ImageId(2)),
            ]
        );
    }
}
