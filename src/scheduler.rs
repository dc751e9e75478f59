//! Multi-job scheduler: bounded worker pool with per-job in-flight caps
//!
//! A run has three phases. Phase A sizes every range in parallel and
//! short-circuits jobs with nothing to scan. Phase B derives the global
//! deadline from the address count and the per-address budget. Phase C is
//! the supervisor loop: it dispatches addresses in ascending pid order
//! (one per job per pass, so concurrent jobs progress fairly), caps
//! in-flight work globally and per job, reaps worker completions from a
//! channel, and reacts to the abort flag or the deadline between
//! dispatches. In-flight probes are never cancelled; on abort they finish
//! after the EXIT messages and their results are counted as missed.

use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::discovery::{AddressTask, DeviceRecord, ProbeEngine};
use crate::error::Result;
use crate::job::{Credential, Job};
use crate::range::{IpRange, RangeSpec};
use crate::report::{Message, ReportSink};

const IDLE_SLEEP: Duration = Duration::from_millis(50);
const EXPIRATION_LOG_INTERVAL: Duration = Duration::from_secs(600);

/// Counters reported at the end of a run
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub total_addresses: u64,
    pub scanned: u64,
    pub devices: u64,
    /// In-flight probes whose results were dropped by an abort
    pub missed: u64,
    pub aborted: bool,
}

/// A range annotated with its live address iterator
struct ScanRange {
    ports: Arc<Vec<u16>>,
    domains: Arc<Vec<String>>,
    entity: Option<String>,
    walk: Option<PathBuf>,
    iter: IpRange,
}

impl ScanRange {
    fn new(spec: RangeSpec, iter: IpRange) -> Self {
        Self {
            ports: Arc::new(spec.ports),
            domains: Arc::new(spec.domains),
            entity: spec.entity,
            walk: spec.walk,
            iter,
        }
    }
}

/// Scheduler-private per-job state
struct JobQueue {
    max_in_queue: usize,
    in_queue: usize,
    timeout: u64,
    credentials: Arc<Vec<Credential>>,
    ranges: VecDeque<ScanRange>,
    size: u64,
    done: u64,
    started: bool,
}

impl JobQueue {
    fn from_job(job: &Job) -> Self {
        Self {
            max_in_queue: job.max_threads as usize,
            in_queue: 0,
            timeout: job.timeout,
            credentials: job.credentials.clone(),
            ranges: VecDeque::new(),
            size: 0,
            done: 0,
            started: false,
        }
    }

    /// Pull the next address, dropping exhausted ranges as they empty
    fn next_task(&mut self, pid: u32) -> Option<AddressTask> {
        while let Some(range) = self.ranges.front_mut() {
            if let Some(ip) = range.iter.next() {
                return Some(AddressTask {
                    pid,
                    ip,
                    timeout: self.timeout,
                    credentials: self.credentials.clone(),
                    ports: range.ports.clone(),
                    domains: range.domains.clone(),
                    entity: range.entity.clone(),
                    walk: range.walk.clone(),
                });
            }
            self.ranges.pop_front();
        }
        None
    }
}

/// Drives a set of jobs to completion against a probe engine and a report
/// sink. Owns nothing between runs; every `run` call is independent.
pub struct Scheduler {
    engine: Arc<ProbeEngine>,
    sink: Arc<dyn ReportSink>,
    abort: Arc<AtomicBool>,
    target_expiration: u64,
    current_pid: Arc<AtomicU32>,
}

impl Scheduler {
    pub fn new(
        engine: Arc<ProbeEngine>,
        sink: Arc<dyn ReportSink>,
        abort: Arc<AtomicBool>,
        target_expiration: u64,
        current_pid: Arc<AtomicU32>,
    ) -> Self {
        Self {
            engine,
            sink,
            abort,
            target_expiration,
            current_pid,
        }
    }

    pub async fn run(&self, jobs: Vec<Job>) -> Result<ScanSummary> {
        let mut summary = ScanSummary::default();
        let sink = self.sink.clone();

        // Phase A: size every range in parallel
        let mut queues = size_jobs(&jobs).await;

        // jobs with nothing to scan still announce themselves
        let empty_pids: Vec<u32> = queues
            .iter()
            .filter(|(_, q)| q.size == 0)
            .map(|(&pid, _)| pid)
            .collect();
        for pid in empty_pids {
            info!("job {pid}: no address to scan");
            deliver(&sink, Message::Start { pid }).await;
            deliver(&sink, Message::BlockSize { pid, count: 0 }).await;
            deliver(&sink, Message::End { pid }).await;
            deliver(&sink, Message::End { pid }).await;
            queues.remove(&pid);
        }
        if queues.is_empty() {
            return Ok(summary);
        }

        // Phase B: derive the deadline from what the run could cost
        let total: u64 = queues.values().map(|q| q.size).sum();
        let min_timeout: u64 = 1 + queues.values().map(|q| q.size * q.timeout).sum::<u64>();
        let budget = expiration_budget(total, min_timeout, self.target_expiration);
        let deadline = Instant::now() + Duration::from_secs(budget);
        summary.total_addresses = total;
        let eta = chrono::Local::now() + chrono::TimeDelta::seconds(budget.min(i64::MAX as u64) as i64);
        info!(
            "scanning {} address(es) over {} job(s), expiration at {}",
            total,
            queues.len(),
            eta.format("%Y-%m-%d %H:%M:%S")
        );

        // Phase C: bounded worker pool fed in ascending pid order. The
        // pool must admit every job's own cap at once, bounded by the
        // number of addresses left to scan.
        let cap_sum: u64 = queues.values().map(|q| q.max_in_queue as u64).sum();
        let workers = cap_sum.min(total).max(1) as usize;
        let semaphore = Arc::new(Semaphore::new(workers));
        let (tx, mut rx) = mpsc::unbounded_channel::<(u32, Option<DeviceRecord>)>();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut last_expiration_log = Instant::now();
        let mut aborted = false;

        loop {
            while let Ok((pid, found)) = rx.try_recv() {
                reap(&mut queues, &sink, &mut summary, pid, found).await;
            }
            if queues.is_empty() {
                break;
            }
            if self.abort.load(Ordering::SeqCst) {
                info!("abort requested, stopping dispatch");
                aborted = true;
                break;
            }
            if Instant::now() >= deadline {
                warn!("discovery expiration reached, aborting remaining jobs");
                aborted = true;
                break;
            }
            if last_expiration_log.elapsed() >= EXPIRATION_LOG_INTERVAL {
                info!(
                    "discovery still running, expiration {}",
                    format_remaining(deadline - Instant::now())
                );
                last_expiration_log = Instant::now();
            }

            let mut dispatched = false;
            for (&pid, queue) in queues.iter_mut() {
                if queue.in_queue >= queue.max_in_queue {
                    continue;
                }
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    break;
                };
                let Some(task) = queue.next_task(pid) else {
                    continue;
                };
                if !queue.started {
                    queue.started = true;
                    self.current_pid.store(pid, Ordering::SeqCst);
                    deliver(&sink, Message::Start { pid }).await;
                    deliver(&sink, Message::BlockSize { pid, count: queue.size }).await;
                }
                queue.in_queue += 1;

                let engine = self.engine.clone();
                let tx = tx.clone();
                handles.push(tokio::spawn(async move {
                    debug!("job {}: scanning {}", task.pid, task.ip);
                    let found = engine.probe(&task).await;
                    let _ = tx.send((task.pid, found));
                    drop(permit);
                }));
                dispatched = true;
            }

            if !dispatched {
                sleep(IDLE_SLEEP).await;
            }
        }
        drop(tx);

        if aborted {
            summary.aborted = true;
            summary.missed = queues.values().map(|q| q.in_queue as u64).sum();
            let pids: Vec<u32> = queues.keys().copied().collect();
            for pid in pids {
                deliver(&sink, Message::Exit { pid }).await;
            }
        }

        // in-flight probes run to completion either way
        for handle in handles {
            let _ = handle.await;
        }
        if summary.missed > 0 {
            warn!("{} devices scan result missed", summary.missed);
        }
        self.current_pid.store(0, Ordering::SeqCst);

        info!(
            "discovery finished: {}/{} address(es) scanned, {} device(s) found",
            summary.scanned, summary.total_addresses, summary.devices
        );
        Ok(summary)
    }
}

/// Phase A: spawn one sizing task per range and fold the results back
/// into per-job queues, keeping range order within each job.
async fn size_jobs(jobs: &[Job]) -> BTreeMap<u32, JobQueue> {
    let mut queues: BTreeMap<u32, JobQueue> = jobs
        .iter()
        .map(|job| (job.pid, JobQueue::from_job(job)))
        .collect();

    let mut sizers = Vec::new();
    for job in jobs {
        for spec in &job.ranges {
            let pid = job.pid;
            let spec = spec.clone();
            sizers.push(tokio::spawn(async move {
                match spec.iter() {
                    Ok(iter) => {
                        let size = iter.len();
                        debug!("job {pid}: range {} has {size} address(es)", spec.label());
                        (pid, Some((ScanRange::new(spec, iter), size)))
                    }
                    Err(e) => {
                        warn!("job {pid}: range {} skipped: {e}", spec.label());
                        (pid, None)
                    }
                }
            }));
        }
    }

    for result in futures::future::join_all(sizers).await {
        let Ok((pid, sized)) = result else { continue };
        let Some((range, size)) = sized else { continue };
        if let Some(queue) = queues.get_mut(&pid) {
            queue.size += size;
            queue.ranges.push_back(range);
        }
    }
    queues
}

async fn deliver(sink: &Arc<dyn ReportSink>, message: Message) {
    let kind = message.kind();
    let pid = message.pid();
    if let Err(e) = sink.send(&message).await {
        warn!("job {pid}: sending {kind} failed: {e}");
    }
}

/// Handle one worker completion: bookkeeping, DEVICE emission, and the
/// double END when the job drains.
async fn reap(
    queues: &mut BTreeMap<u32, JobQueue>,
    sink: &Arc<dyn ReportSink>,
    summary: &mut ScanSummary,
    pid: u32,
    found: Option<DeviceRecord>,
) {
    let finished = {
        let Some(queue) = queues.get_mut(&pid) else {
            return;
        };
        queue.in_queue = queue.in_queue.saturating_sub(1);
        queue.done += 1;
        queue.done == queue.size
    };

    summary.scanned += 1;
    if let Some(device) = found {
        summary.devices += 1;
        deliver(sink, Message::Device { pid, device }).await;
    }

    if finished {
        deliver(sink, Message::End { pid }).await;
        queues.remove(&pid);
        deliver(sink, Message::End { pid }).await;
        info!("job {pid} completed");
    }
}

/// Seconds until the effective deadline: the per-address budget across
/// the whole run, never less than the sum of declared job timeouts.
pub(crate) fn expiration_budget(total: u64, min_timeout: u64, target_expiration: u64) -> u64 {
    let per_address = target_expiration.max(crate::config::DEFAULT_TARGET_EXPIRATION);
    (total * per_address).max(min_timeout)
}

/// Human-readable time-to-deadline for the periodic progress log
pub(crate) fn format_remaining(remaining: Duration) -> String {
    let minutes = remaining.as_secs() / 60;
    if minutes > 120 {
        format!("{:.1} hours", minutes as f64 / 60.0)
    } else if minutes >= 60 {
        format!("{:.1} hour", minutes as f64 / 60.0)
    } else if minutes >= 10 {
        format!("{minutes} minutes")
    } else if minutes >= 2 {
        "few minutes".to_string()
    } else {
        "soon".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_honors_floor_and_min_timeout() {
        // floored per-address budget dominates
        assert_eq!(expiration_budget(10, 1, 5), 600);
        // configured budget above the floor
        assert_eq!(expiration_budget(10, 1, 100), 1000);
        // declared job timeouts win when larger
        assert_eq!(expiration_budget(2, 100_000, 60), 100_000);
    }

    #[test]
    fn budget_never_below_either_bound() {
        for (total, min_timeout, target) in [(1, 1, 0), (100, 7000, 60), (0, 1, 60)] {
            let budget = expiration_budget(total, min_timeout, target);
            assert!(budget >= total * target.max(60));
            assert!(budget >= min_timeout);
        }
    }

    #[test]
    fn remaining_time_buckets() {
        assert_eq!(format_remaining(Duration::from_secs(10 * 3600)), "10.0 hours");
        assert_eq!(format_remaining(Duration::from_secs(3 * 3600)), "3.0 hours");
        assert_eq!(format_remaining(Duration::from_secs(5400)), "1.5 hour");
        assert_eq!(format_remaining(Duration::from_secs(30 * 60)), "30 minutes");
        assert_eq!(format_remaining(Duration::from_secs(5 * 60)), "few minutes");
        assert_eq!(format_remaining(Duration::from_secs(90)), "soon");
        assert_eq!(format_remaining(Duration::from_secs(0)), "soon");
    }

    #[test]
    fn queue_walks_ranges_in_order() {
        let job = Job {
            pid: 1,
            max_threads: 1,
            timeout: 1,
            credentials: Arc::new(Vec::new()),
            ranges: Vec::new(),
        };
        let mut queue = JobQueue::from_job(&job);
        for (start, end) in [("10.0.0.1", "10.0.0.2"), ("10.0.1.1", "10.0.1.1")] {
            let iter = IpRange::new(start, end).unwrap();
            queue.size += iter.len();
            queue.ranges.push_back(ScanRange::new(
                RangeSpec {
                    ip_start: Some(start.to_string()),
                    ip_end: Some(end.to_string()),
                    ..Default::default()
                },
                iter,
            ));
        }

        let ips: Vec<Ipv4Addr> = std::iter::from_fn(|| queue.next_task(1).map(|t| t.ip)).collect();
        let expected: Vec<Ipv4Addr> = ["10.0.0.1", "10.0.0.2", "10.0.1.1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(ips, expected);
    }
}
