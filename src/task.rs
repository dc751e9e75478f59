//! Task lifecycle: the entry points the agent framework drives
//!
//! `is_enabled` inspects the server contact response and keeps the task
//! alive only when at least one valid job came back. `run` hands the jobs
//! to the scheduler. `abort` flips the cooperative abort flag and, when a
//! job is currently being reported, closes it with an END message so the
//! server is not left waiting.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::config::AgentConfig;
use crate::discovery::ProbeEngine;
use crate::error::Result;
use crate::job::{jobs_from_contact, ContactResponse, Job};
use crate::report::{Message, ReportSink};
use crate::scheduler::{ScanSummary, Scheduler};

pub struct DiscoveryTask {
    config: AgentConfig,
    jobs: Vec<Job>,
    abort: Arc<AtomicBool>,
    current_pid: Arc<AtomicU32>,
}

impl DiscoveryTask {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            jobs: Vec::new(),
            abort: Arc::new(AtomicBool::new(false)),
            current_pid: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Parse the contact response into jobs. Returns false (task stays
    /// disabled) when nothing valid was assigned.
    pub fn is_enabled(&mut self, contact: &ContactResponse) -> bool {
        self.jobs = jobs_from_contact(contact);
        if self.jobs.is_empty() {
            debug!("no valid discovery job assigned, task disabled");
            false
        } else {
            info!("{} discovery job(s) assigned", self.jobs.len());
            true
        }
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Shared flag observed by the scheduler between dispatches; signal
    /// handlers set it
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    /// Run all assigned jobs to completion or abort
    pub async fn run(
        &self,
        engine: Arc<ProbeEngine>,
        sink: Arc<dyn ReportSink>,
    ) -> Result<ScanSummary> {
        let scheduler = Scheduler::new(
            engine,
            sink,
            self.abort.clone(),
            self.config.effective_target_expiration(),
            self.current_pid.clone(),
        );
        scheduler.run(self.jobs.clone()).await
    }

    /// Teardown entry point for the outer framework. Closes the job
    /// currently being reported, if any, with an END message.
    pub async fn abort(&self, sink: &Arc<dyn ReportSink>) {
        self.abort.store(true, Ordering::SeqCst);
        let pid = self.current_pid.load(Ordering::SeqCst);
        if pid != 0 {
            if let Err(e) = sink.send(&Message::End { pid }).await {
                debug!("job {pid}: sending END on abort failed: {e}");
            }
        }
    }
}
