//! Job model: validation of server-issued discovery assignments
//!
//! The management server answers the agent contact with a list of options.
//! Each option carrying a `PARAM` with a `PID` and at least one usable
//! range becomes a [`Job`]. Anything malformed is logged and dropped; a
//! run with no surviving job disables the task.

use std::collections::HashSet;
use std::sync::Arc;

use log::{debug, warn};
use serde::Deserialize;

use crate::error::{DiscoveryError, Result};
use crate::range::RangeSpec;

/// SNMP credential as delivered by the server. Unique per `ID`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Credential {
    #[serde(rename = "ID")]
    pub id: String,

    /// "1", "2c" or "3"
    #[serde(rename = "VERSION", default)]
    pub version: String,

    #[serde(rename = "COMMUNITY")]
    pub community: Option<String>,

    #[serde(rename = "USERNAME")]
    pub username: Option<String>,

    #[serde(rename = "AUTHPASSWORD")]
    pub auth_password: Option<String>,

    #[serde(rename = "AUTHPROTOCOL")]
    pub auth_protocol: Option<String>,

    #[serde(rename = "PRIVPASSWORD")]
    pub priv_password: Option<String>,

    #[serde(rename = "PRIVPROTOCOL")]
    pub priv_protocol: Option<String>,
}

/// Job parameters; the first `PARAM` record of an option is used
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Param {
    #[serde(rename = "PID")]
    pub pid: Option<u32>,

    #[serde(rename = "THREADS_DISCOVERY")]
    pub threads: Option<u32>,

    #[serde(rename = "TIMEOUT")]
    pub timeout: Option<u64>,
}

/// One named option block of the contact response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskOption {
    #[serde(rename = "NAME", default)]
    pub name: String,

    #[serde(rename = "RANGEIP", default)]
    pub ranges: Vec<RangeSpec>,

    #[serde(rename = "PARAM", default)]
    pub params: Vec<Param>,

    #[serde(rename = "AUTHENTICATION", default)]
    pub credentials: Vec<Credential>,
}

/// Parsed contact response from the management server
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactResponse {
    #[serde(rename = "OPTION", default)]
    pub options: Vec<TaskOption>,
}

impl ContactResponse {
    /// Options registered under the given task name
    pub fn options_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a TaskOption> {
        self.options.iter().filter(move |o| o.name == name)
    }
}

/// A validated discovery assignment
#[derive(Debug, Clone)]
pub struct Job {
    /// Server-side process number; unique within a run and stable for the
    /// lifetime of the job
    pub pid: u32,

    /// Per-job in-flight cap
    pub max_threads: u32,

    /// Per-address timeout in seconds, also used for deadline arithmetic
    pub timeout: u64,

    pub credentials: Arc<Vec<Credential>>,

    pub ranges: Vec<RangeSpec>,
}

impl Job {
    /// Validate one option into a job. Ranges missing either bound are
    /// dropped with a warning; without a `PID` or any usable range the
    /// whole option is rejected.
    pub fn from_option(option: &TaskOption) -> Result<Job> {
        let Some(param) = option.params.first() else {
            return Err(DiscoveryError::InvalidJob("no PARAM record".to_string()));
        };
        let Some(pid) = param.pid else {
            return Err(DiscoveryError::InvalidJob("no PID defined".to_string()));
        };

        let mut ranges = Vec::new();
        for spec in &option.ranges {
            if spec.ip_start.is_none() || spec.ip_end.is_none() {
                warn!("job {pid}: range {} has no IP bounds, skipped", spec.label());
                continue;
            }
            ranges.push(spec.clone());
        }
        if ranges.is_empty() {
            return Err(DiscoveryError::InvalidJob(format!(
                "job {pid}: no valid range"
            )));
        }

        Ok(Job {
            pid,
            max_threads: param.threads.unwrap_or(1).max(1),
            timeout: param.timeout.unwrap_or(1).max(1),
            credentials: Arc::new(option.credentials.clone()),
            ranges,
        })
    }
}

/// Build the job list from a contact response. Duplicate pids keep the
/// first occurrence.
pub fn jobs_from_contact(contact: &ContactResponse) -> Vec<Job> {
    let mut jobs = Vec::new();
    let mut seen = HashSet::new();
    for option in contact.options_by_name("NETDISCOVERY") {
        let job = match Job::from_option(option) {
            Ok(job) => job,
            Err(e) => {
                debug!("discovery option skipped: {e}");
                continue;
            }
        };
        if !seen.insert(job.pid) {
            warn!("duplicate job pid {}, keeping the first", job.pid);
            continue;
        }
        jobs.push(job);
    }
    jobs
}
