//! Batch downloads with a bounded worker pool per registry

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::ruleset::cancel::CancellationToken;
use crate::ruleset::error::{BatchError, DownloadError, RegistryError};
use crate::ruleset::manager::RegistryManager;
use crate::ruleset::types::{ContentSelector, InstalledRuleset};

/// One ruleset to install
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub ruleset: String,
    pub version: String,
    pub registry: String,
    pub dest_dir: PathBuf,
    pub selector: ContentSelector,
    pub cancel: CancellationToken,
}

impl DownloadJob {
    pub fn new(registry: &str, ruleset: &str, version: &str, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            ruleset: ruleset.to_string(),
            version: version.to_string(),
            registry: registry.to_string(),
            dest_dir: dest_dir.into(),
            selector: ContentSelector::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_selector(mut self, selector: ContentSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn error(&self, source: RegistryError) -> DownloadError {
        DownloadError {
            registry: self.registry.clone(),
            ruleset: self.ruleset.clone(),
            version: self.version.clone(),
            source,
        }
    }
}

#[derive(Debug)]
pub struct DownloadResult {
    pub job: DownloadJob,
    pub outcome: Result<InstalledRuleset, DownloadError>,
}

impl DownloadResult {
    /// A job that failed before it could be scheduled
    pub fn failed(job: DownloadJob, source: RegistryError) -> Self {
        let outcome = Err(job.error(source));
        Self { job, outcome }
    }
}

pub struct ConcurrentDownloader {
    manager: Arc<RegistryManager>,
}

impl ConcurrentDownloader {
    pub fn new(manager: Arc<RegistryManager>) -> Self {
        Self { manager }
    }

    /// Run every job, at most `concurrency_limit(registry)` at a time per
    /// registry. `on_complete` is called once per job as it finishes; results
    /// come back in completion order.
    pub async fn download_all<F>(
        &self,
        jobs: Vec<DownloadJob>,
        mut on_complete: F,
    ) -> Vec<DownloadResult>
    where
        F: FnMut(&DownloadResult),
    {
        let mut semaphores: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut pending = HashMap::new();
        let mut set = JoinSet::new();

        for job in jobs {
            let semaphore = semaphores
                .entry(job.registry.clone())
                .or_insert_with(|| {
                    let limit = self.manager.concurrency_limit(&job.registry);
                    debug!("Worker pool for '{}': {}", job.registry, limit);
                    Arc::new(Semaphore::new(limit))
                })
                .clone();
            let manager = Arc::clone(&self.manager);
            let task_job = job.clone();

            let handle = set.spawn(async move {
                let outcome = run_job(&manager, &semaphore, &task_job).await;
                DownloadResult {
                    job: task_job,
                    outcome,
                }
            });
            pending.insert(handle.id(), job);
        }

        let mut results = Vec::with_capacity(pending.len());
        while let Some(joined) = set.join_next_with_id().await {
            let result = match joined {
                Ok((id, result)) => {
                    pending.remove(&id);
                    result
                }
                Err(e) => {
                    let Some(job) = pending.remove(&e.id()) else {
                        error!("Download task failed: {}", e);
                        continue;
                    };
                    error!("Download task for {} failed: {}", job.ruleset, e);
                    let registry = job.registry.clone();
                    DownloadResult::failed(
                        job,
                        RegistryError::Unavailable {
                            registry,
                            reason: format!("download task failed: {}", e),
                        },
                    )
                }
            };
            on_complete(&result);
            results.push(result);
        }

        results
    }
}

async fn run_job(
    manager: &RegistryManager,
    semaphore: &Semaphore,
    job: &DownloadJob,
) -> Result<InstalledRuleset, DownloadError> {
    let work = async {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| job.error(RegistryError::Cancelled))?;
        manager
            .download(
                &job.registry,
                &job.ruleset,
                &job.version,
                &job.dest_dir,
                &job.selector,
            )
            .await
    };

    tokio::select! {
        biased;
        _ = job.cancel.cancelled() => {
            info!("Cancelled {}/{}@{}", job.registry, job.ruleset, job.version);
            Err(job.error(RegistryError::Cancelled))
        }
        result = work => result,
    }
}

/// How a batch went overall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Success,
    Partial,
    Failure,
}

#[derive(Debug)]
pub struct BatchSummary {
    pub total: usize,
    pub installed: Vec<InstalledRuleset>,
    pub failures: Vec<DownloadError>,
}

impl BatchSummary {
    pub fn from_results(results: Vec<DownloadResult>) -> Self {
        let total = results.len();
        let mut installed = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result.outcome {
                Ok(ruleset) => installed.push(ruleset),
                Err(e) => failures.push(e),
            }
        }
        Self {
            total,
            installed,
            failures,
        }
    }

    pub fn outcome(&self) -> BatchOutcome {
        if self.failures.is_empty() {
            BatchOutcome::Success
        } else if self.installed.is_empty() {
            BatchOutcome::Failure
        } else {
            BatchOutcome::Partial
        }
    }

    /// Error only when nothing was installed
    pub fn into_result(self) -> Result<Self, BatchError> {
        if self.total > 0 && self.installed.is_empty() {
            return Err(BatchError { total: self.total });
        }
        Ok(self)
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome() {
            BatchOutcome::Success => {
                write!(f, "Installed {}/{} rulesets", self.installed.len(), self.total)?
            }
            BatchOutcome::Partial => write!(
                f,
                "Installed {}/{} rulesets; {} failed:",
                self.installed.len(),
                self.total,
                self.failures.len()
            )?,
            BatchOutcome::Failure => write!(f, "All {} downloads failed:", self.total)?,
        }
        for failure in &self.failures {
            write!(f, "\n  - {}", failure)?;
        }
        Ok(())
    }
}
