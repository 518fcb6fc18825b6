//! Background job tracking for a sandbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::task::AbortHandle;

use sbx_core::error::{Error, Result};

/// Last observed state of a background job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobStatus {
    Running,
    Exited { exit_code: i32 },
    Killed,
    Failed { message: String },
}

/// One tracked background job.
pub struct BackgroundJob {
    pub job_id: String,
    pub command: Vec<String>,
    pub started_at: String,
    status: Arc<Mutex<JobStatus>>,
    abort: AbortHandle,
}

impl BackgroundJob {
    pub fn status(&self) -> JobStatus {
        self.status.lock().expect("job status lock").clone()
    }

    pub fn is_running(&self) -> bool {
        self.status() == JobStatus::Running
    }
}

/// Shared writable handle for the task executing the job.
#[derive(Clone)]
pub struct JobStatusHandle(Arc<Mutex<JobStatus>>);

impl JobStatusHandle {
    pub fn finish(&self, status: JobStatus) {
        let mut current = self.0.lock().expect("job status lock");
        // A kill that raced completion keeps the first terminal status.
        if *current == JobStatus::Running {
            *current = status;
        }
    }
}

/// Per-sandbox job table. Lives inside the sandbox mutex.
#[derive(Default)]
pub struct JobTable {
    jobs: HashMap<String, BackgroundJob>,
}

impl JobTable {
    /// Register a spawned job and hand back the status handle for its task.
    pub fn insert(
        &mut self,
        job_id: String,
        command: Vec<String>,
        abort: AbortHandle,
    ) -> JobStatusHandle {
        let status = Arc::new(Mutex::new(JobStatus::Running));
        self.jobs.insert(
            job_id.clone(),
            BackgroundJob {
                job_id,
                command,
                started_at: sbx_core::time::utc_now(),
                status: status.clone(),
                abort,
            },
        );
        JobStatusHandle(status)
    }

    /// Swap in the real abort handle once the job's task has been spawned.
    pub fn set_abort(&mut self, job_id: &str, abort: AbortHandle) {
        if let Some(job) = self.jobs.get_mut(job_id) {
            job.abort = abort;
        }
    }

    /// Stop a job. Idempotent: stopping a finished job reports its last
    /// observed status.
    pub fn stop(&mut self, job_id: &str) -> Result<JobStatus> {
        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| Error::not_found(format!("No job {:?}", job_id)))?;
        let current = job.status();
        if current == JobStatus::Running {
            job.abort.abort();
            let mut status = job.status.lock().expect("job status lock");
            *status = JobStatus::Killed;
            Ok(JobStatus::Killed)
        } else {
            Ok(current)
        }
    }

    pub fn get(&self, job_id: &str) -> Option<&BackgroundJob> {
        self.jobs.get(job_id)
    }

    pub fn any_running(&self) -> bool {
        self.jobs.values().any(|j| j.is_running())
    }

    /// Abort every running job (sandbox teardown).
    pub fn stop_all(&mut self) {
        for job in self.jobs.values() {
            if job.is_running() {
                job.abort.abort();
                let mut status = job.status.lock().expect("job status lock");
                *status = JobStatus::Killed;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackgroundJob> {
        self.jobs.values()
    }
}
