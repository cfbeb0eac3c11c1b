//! Bounded worker pool that runs one conversion job per document.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──▶ Dispatching ──▶ Draining ──▶ Done
//!           │ spawn W workers     │ queue closed,        │ every input has
//!           │ feed bounded queue  │ workers finish their │ exactly one record
//!           │                     │ current job          │ or is cancelled
//! ```
//!
//! `W = min(documents, max_concurrency)`. The job queue holds at most `W`
//! jobs, so dispatch never runs far ahead of the workers. Workers talk to
//! the dispatcher only through that queue and an outcome channel; there is
//! no other shared mutable state.
//!
//! ## Deadlines
//!
//! Workers check the request deadline before pulling a job and again after
//! claiming one. Each job runs under its own deadline (`job_timeout`,
//! clipped to the request deadline). An adapter that ignores its deadline is
//! abandoned after a short grace period, so the pool never outlives the
//! request by more than that.
//!
//! Dropping the [`Scheduler::run`] future cancels every in-flight job.

use crate::config::BatchConfig;
use crate::error::JobError;
use crate::output::{BatchOutcome, ConversionJob, InputDocument, JobOutcome, JobRecord, OutputDocument};
use crate::pipeline::adapter::ConversionAdapter;
use crate::progress::ProgressCallback;
use crate::workspace::Deadline;
use futures::future::join_all;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// How long an adapter may keep running after its deadline before the
/// worker gives up on it.
const ADAPTER_GRACE: Duration = Duration::from_millis(500);

/// Pool lifecycle, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Dispatching,
    Draining,
    Done,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Dispatching => "dispatching",
            SchedulerState::Draining => "draining",
            SchedulerState::Done => "done",
        })
    }
}

/// One pool per request. Cheap to build; holds no per-batch state.
#[derive(Clone)]
pub struct Scheduler {
    adapter: Arc<dyn ConversionAdapter>,
    max_concurrency: usize,
    job_timeout: Duration,
    progress: Option<ProgressCallback>,
}

impl Scheduler {
    pub fn new(adapter: Arc<dyn ConversionAdapter>, config: &BatchConfig) -> Self {
        Self {
            adapter,
            max_concurrency: config.max_concurrency.max(1),
            job_timeout: config.job_timeout,
            progress: config.progress_callback.clone(),
        }
    }

    /// Run every job and account for each input exactly once.
    ///
    /// Never fails: per-job errors are recorded in the outcome, and jobs
    /// the deadline prevented from running are listed as cancelled.
    pub async fn run(&self, jobs: Vec<ConversionJob>, deadline: &Deadline) -> BatchOutcome {
        let total = jobs.len();
        let mut state = SchedulerState::Idle;
        if let Some(ref cb) = self.progress {
            cb.on_batch_start(total);
        }
        if total == 0 {
            transition(&mut state, SchedulerState::Done);
            if let Some(ref cb) = self.progress {
                cb.on_batch_complete(0, 0, 0, 0);
            }
            return BatchOutcome::default();
        }

        let workers = total.min(self.max_concurrency);
        let catalog: Vec<InputDocument> = jobs.iter().map(|j| j.input.clone()).collect();

        // The pool gets its own child token so that dropping this future
        // (and with it the guard) stops every worker and converter.
        let pool_token = deadline.token().child_token();
        let pool_deadline = Deadline::new(deadline.at(), pool_token.clone());
        let _stop_on_drop = pool_token.drop_guard();

        let (job_tx, job_rx) = mpsc::channel::<ConversionJob>(workers);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel::<JobRecord>();

        transition(&mut state, SchedulerState::Dispatching);
        info!(
            documents = total,
            workers,
            remaining_ms = deadline.remaining().as_millis() as u64,
            "Starting worker pool"
        );
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    total,
                    adapter: Arc::clone(&self.adapter),
                    jobs: Arc::clone(&job_rx),
                    outcomes: outcome_tx.clone(),
                    deadline: pool_deadline.clone(),
                    job_timeout: self.job_timeout,
                    progress: self.progress.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(job_rx);
        drop(outcome_tx);

        let mut dispatched = 0usize;
        let mut dispatch_interrupted = false;
        for job in jobs {
            let permit = tokio::select! {
                biased;
                _ = pool_deadline.expired() => {
                    dispatch_interrupted = true;
                    break;
                }
                permit = job_tx.reserve() => permit,
            };
            match permit {
                Ok(permit) => {
                    permit.send(job);
                    dispatched += 1;
                }
                Err(_) => {
                    warn!(dispatched, "Every worker stopped before dispatch finished");
                    break;
                }
            }
        }
        drop(job_tx);

        transition(&mut state, SchedulerState::Draining);
        debug!(dispatched, total, "Queue closed; draining workers");
        let mut records: Vec<JobRecord> = UnboundedReceiverStream::new(outcome_rx).collect().await;

        for (id, joined) in join_all(handles).await.into_iter().enumerate() {
            if let Err(e) = joined {
                error!(worker = id, error = %e, "Worker task terminated abnormally");
            }
        }

        // Reconcile against the catalog: anything without a record was
        // either cut off by the deadline or lost with a crashed worker.
        let recorded: HashSet<usize> = records.iter().map(|r| r.input.id).collect();
        let missing: Vec<InputDocument> = catalog
            .into_iter()
            .filter(|doc| !recorded.contains(&doc.id))
            .collect();
        let deadline_hit = deadline.is_expired()
            && (!missing.is_empty()
                || records
                    .iter()
                    .any(|r| matches!(&r.outcome, JobOutcome::Failure(e) if e.is_interruption())));
        let interrupted = dispatch_interrupted || deadline_hit;

        let mut cancelled = Vec::new();
        for doc in missing {
            if interrupted {
                cancelled.push(doc);
            } else {
                error!(document = %doc.name, "No outcome recorded for document");
                records.push(JobRecord {
                    outcome: JobOutcome::Failure(JobError::WorkerLost {
                        document: doc.name.clone(),
                    }),
                    input: doc,
                    duration_ms: 0,
                });
            }
        }

        transition(&mut state, SchedulerState::Done);
        let outcome = BatchOutcome {
            total,
            records,
            cancelled,
            interrupted,
            workers,
        };
        let succeeded = outcome.successes().count();
        let failed = outcome.failures().count();
        info!(
            total,
            succeeded,
            failed,
            cancelled = outcome.cancelled.len(),
            interrupted,
            "Worker pool finished"
        );
        if let Some(ref cb) = self.progress {
            cb.on_batch_complete(total, succeeded, failed, outcome.cancelled.len());
        }
        outcome
    }
}

fn transition(state: &mut SchedulerState, next: SchedulerState) {
    debug!(from = %state, to = %next, "Scheduler state");
    *state = next;
}

struct Worker {
    id: usize,
    total: usize,
    adapter: Arc<dyn ConversionAdapter>,
    jobs: Arc<Mutex<mpsc::Receiver<ConversionJob>>>,
    outcomes: mpsc::UnboundedSender<JobRecord>,
    deadline: Deadline,
    job_timeout: Duration,
    progress: Option<ProgressCallback>,
}

impl Worker {
    async fn run(self) {
        let mut completed = 0usize;
        let mut succeeded = 0usize;
        loop {
            if self.deadline.is_expired() {
                debug!(worker = self.id, "Deadline reached; not pulling further jobs");
                break;
            }

            let next = {
                let mut queue = self.jobs.lock().await;
                tokio::select! {
                    biased;
                    _ = self.deadline.expired() => None,
                    job = queue.recv() => job,
                }
            };
            let Some(job) = next else { break };

            if self.deadline.is_expired() {
                debug!(worker = self.id, document = %job.input.name, "Deadline reached after claiming job; leaving it unrun");
                break;
            }

            let record = self.execute(job).await;
            completed += 1;
            if record.outcome.is_success() {
                succeeded += 1;
            }
            if self.outcomes.send(record).is_err() {
                break;
            }
        }
        debug!(worker = self.id, completed, succeeded, "Worker stopped");
    }

    async fn execute(&self, job: ConversionJob) -> JobRecord {
        let started = Instant::now();
        let document = job.input.name.clone();
        if let Some(ref cb) = self.progress {
            cb.on_job_start(&document, self.total);
        }
        debug!(worker = self.id, document = %document, "Job started");

        let job_deadline = self.deadline.child(self.job_timeout);
        let abandon = async {
            job_deadline.expired().await;
            tokio::time::sleep(ADAPTER_GRACE).await;
        };
        let result = tokio::select! {
            biased;
            result = self.adapter.convert(&job, &job_deadline) => result,
            _ = abandon => {
                warn!(worker = self.id, document = %document, adapter = self.adapter.name(), "Adapter ignored its deadline; abandoning job");
                Err(interruption(&job_deadline, &document, started))
            }
        };
        // Stop anything the adapter may have left running for this job.
        job_deadline.cancel();

        let outcome = match result {
            Ok(()) => verify_output(&job).await,
            Err(e) => {
                discard(&job).await;
                JobOutcome::Failure(e)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            JobOutcome::Success(out) => {
                debug!(worker = self.id, document = %document, bytes = out.size, elapsed_ms, "Job succeeded");
                if let Some(ref cb) = self.progress {
                    cb.on_job_complete(&document, self.total, out.size);
                }
            }
            JobOutcome::Failure(e) => {
                warn!(worker = self.id, document = %document, elapsed_ms, error = %e, "Job failed");
                if let Some(ref cb) = self.progress {
                    cb.on_job_error(&document, self.total, &e.to_string());
                }
            }
        }
        job.complete(outcome, elapsed_ms)
    }
}

fn interruption(deadline: &Deadline, document: &str, started: Instant) -> JobError {
    if deadline.is_cancelled() {
        JobError::Cancelled {
            document: document.to_string(),
        }
    } else {
        JobError::Timeout {
            document: document.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// The adapter reported success; only a non-empty file counts.
async fn verify_output(job: &ConversionJob) -> JobOutcome {
    let document = job.input.name.clone();
    match tokio::fs::metadata(&job.output_path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => JobOutcome::Success(OutputDocument {
            name: job.entry_name.clone(),
            source: document,
            path: job.output_path.clone(),
            size: meta.len(),
        }),
        Ok(_) => {
            discard(job).await;
            JobOutcome::Failure(JobError::EmptyOutput { document })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            JobOutcome::Failure(JobError::EmptyOutput { document })
        }
        Err(e) => JobOutcome::Failure(JobError::Io {
            document,
            detail: format!("inspecting converter output: {e}"),
        }),
    }
}

/// Remove whatever a failed job left at its output path.
async fn discard(job: &ConversionJob) {
    match tokio::fs::remove_file(&job.output_path).await {
        Ok(()) => debug!(document = %job.input.name, "Removed output of failed job"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(document = %job.input.name, error = %e, "Failed to remove output of failed job"),
    }
}
