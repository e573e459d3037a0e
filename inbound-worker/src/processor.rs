//! Polling loop over the job queue
//!
//! Each tick fetches up to `batch_size` pending jobs, oldest first, and
//! processes them one after another. A failed job has its attempt counter
//! bumped and stays pending until the counter reaches `max_attempts`, at which
//! point it is marked failed for good. There is no backoff; a pending job is
//! simply retried on the next tick that finds it.
//!
//! Ticks missed while a batch runs are skipped, the backlog lives in the job
//! store.

use std::{fmt, pin::pin, sync::Arc};

use inbound_common::{
    JobStatus, QueueJob, Signal, internal,
    tracing::{error, info, warn},
};
use inbound_store::{EmailStore, EventChannel, JobStore};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::MissedTickBehavior,
};

use crate::{
    WorkerConfig,
    error::WorkerError,
    process::{self, Handled},
};

/// Counts of what happened to the jobs of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub fetched: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    pub unknown: usize,
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched={} completed={} retried={} failed={} unknown={}",
            self.fetched, self.completed, self.retried, self.failed, self.unknown
        )
    }
}

enum Outcome {
    Completed,
    Unknown,
    Retry,
    Failed,
}

#[derive(Debug)]
pub struct JobProcessor {
    config: WorkerConfig,
    jobs: Arc<dyn JobStore>,
    emails: Arc<dyn EmailStore>,
    events: Arc<dyn EventChannel>,
}

impl JobProcessor {
    #[must_use]
    pub fn new(
        config: WorkerConfig,
        jobs: Arc<dyn JobStore>,
        emails: Arc<dyn EmailStore>,
        events: Arc<dyn EventChannel>,
    ) -> Self {
        Self {
            config,
            jobs,
            emails,
            events,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub(crate) fn emails(&self) -> &dyn EmailStore {
        self.emails.as_ref()
    }

    pub(crate) fn events(&self) -> &dyn EventChannel {
        self.events.as_ref()
    }

    /// Run the polling loop until a shutdown signal is received
    ///
    /// ## Graceful Shutdown
    ///
    /// A batch in flight when the signal arrives is given `shutdown_grace_ms`
    /// to finish. Jobs it does not get to stay pending.
    ///
    /// # Errors
    ///
    /// Never fails at present; failing batches are logged and retried on the
    /// next tick.
    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), WorkerError> {
        internal!(
            "Job processor starting, polling every {}ms",
            self.config.poll_interval_ms
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut batch = pin!(self.process_batch());

                    let result = loop {
                        tokio::select! {
                            result = &mut batch => break result,
                            sig = shutdown.recv() => {
                                if is_shutdown(&sig) {
                                    internal!(level = INFO, "Job processor received shutdown signal, finishing batch ...");
                                    match tokio::time::timeout(self.config.shutdown_grace(), batch).await {
                                        Ok(result) => log_batch(&result),
                                        Err(_) => warn!(
                                            "Shutdown grace of {}ms elapsed, unfinished jobs stay pending",
                                            self.config.shutdown_grace_ms
                                        ),
                                    }
                                    return Ok(());
                                }
                            }
                        }
                    };

                    log_batch(&result);
                }

                sig = shutdown.recv() => {
                    if is_shutdown(&sig) {
                        internal!(level = INFO, "Job processor shutdown complete");
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Fetch and process one batch of pending jobs
    ///
    /// # Errors
    ///
    /// Returns an error only when the batch cannot be fetched; failures of
    /// individual jobs are recorded on the jobs themselves.
    pub async fn process_batch(&self) -> Result<BatchReport, WorkerError> {
        let jobs = self.jobs.fetch_pending(self.config.batch_size).await?;
        let mut report = BatchReport {
            fetched: jobs.len(),
            ..BatchReport::default()
        };

        for job in jobs {
            match self.process(&job).await {
                Ok(Outcome::Completed) => report.completed += 1,
                Ok(Outcome::Unknown) => report.unknown += 1,
                Ok(Outcome::Retry) => report.retried += 1,
                Ok(Outcome::Failed) => report.failed += 1,
                Err(err) => {
                    // left pending, the next tick tries again
                    error!(job_id = %job.id, "Failed to record job outcome: {err}");
                    report.retried += 1;
                }
            }
        }

        Ok(report)
    }

    async fn process(&self, job: &QueueJob) -> Result<Outcome, WorkerError> {
        match process::process_job(self, job).await {
            Ok(handled) => {
                self.jobs.set_status(&job.id, JobStatus::Completed).await?;
                Ok(match handled {
                    Handled::Persisted { .. } => Outcome::Completed,
                    Handled::UnknownType(_) => Outcome::Unknown,
                })
            }
            Err(err) => {
                let attempts = self.jobs.increment_attempts(&job.id).await?;

                if attempts >= self.config.max_attempts {
                    self.jobs.set_status(&job.id, JobStatus::Failed).await?;
                    error!(job_id = %job.id, attempts, "Job failed permanently: {err}");
                    Ok(Outcome::Failed)
                } else {
                    warn!(job_id = %job.id, attempts, "Job failed, will retry: {err}");
                    Ok(Outcome::Retry)
                }
            }
        }
    }
}

const fn is_shutdown(signal: &Result<Signal, RecvError>) -> bool {
    matches!(
        signal,
        Ok(Signal::Shutdown | Signal::Finalised) | Err(RecvError::Closed)
    )
}

fn log_batch(result: &Result<BatchReport, WorkerError>) {
    match result {
        Ok(report) if report.fetched > 0 => info!("Processed job batch: {report}"),
        Ok(_) => {}
        Err(err) => error!("Failed to fetch pending jobs: {err}"),
    }
}
