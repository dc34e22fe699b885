//! Accounting and job-completion sinks.
//!
//! The storage backends are external collaborators; the controller
//! talks to them through these traits. The default accounting sink
//! only logs and hands out row handles; the default completion sink is
//! the flatfile writer (one formatted record per finished job).

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::constants::INFINITE;
use crate::job::JobRecord;

/// Accounting storage sink. `job_start` returns the backend row handle
/// stored as the job's `db_index`; a zero `db_index` on a later call
/// means "create a fresh record" (requeue semantics).
pub trait JobAcctSink: Send + Sync {
    fn job_start(&self, cluster: &str, job: &JobRecord) -> u32;
    fn job_complete(&self, job: &JobRecord);
    fn job_suspend(&self, job: &JobRecord);
}

/// Completion logger sink ("jobcomp").
pub trait JobCompSink: Send + Sync {
    fn record(&self, job: &JobRecord);
}

/// Log-only accounting sink.
#[derive(Default)]
pub struct LogAcctSink {
    next_index: AtomicU32,
}

impl JobAcctSink for LogAcctSink {
    fn job_start(&self, cluster: &str, job: &JobRecord) -> u32 {
        let idx = self.next_index.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "acct: start job {} on cluster {} (db_index {})",
            job.job_id, cluster, idx
        );
        idx
    }

    fn job_complete(&self, job: &JobRecord) {
        debug!(
            "acct: complete job {} state {} exit {}",
            job.job_id, job.state, job.exit_code
        );
    }

    fn job_suspend(&self, job: &JobRecord) {
        debug!("acct: suspend/resume job {} state {}", job.job_id, job.state);
    }
}

fn fmt_time(t: u32) -> String {
    if t == 0 {
        return "Unknown".to_string();
    }
    DateTime::<Utc>::from_timestamp(t as i64, 0)
        .map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

fn fmt_limit(minutes: u32) -> String {
    if minutes == INFINITE {
        "UNLIMITED".to_string()
    } else {
        minutes.to_string()
    }
}

/// Flatfile completion sink: appends one record per finished job.
pub struct FlatfileJobComp {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl FlatfileJobComp {
    pub fn new(path: PathBuf) -> FlatfileJobComp {
        FlatfileJobComp {
            path,
            file: Mutex::new(None),
        }
    }
}

impl JobCompSink for FlatfileJobComp {
    fn record(&self, job: &JobRecord) {
        let line = format!(
            "JobId={} UserId={} GroupId={} Name={} JobState={} Partition={} \
             TimeLimit={} StartTime={} EndTime={} NodeList={} NodeCnt={} ExitCode={}\n",
            job.job_id,
            job.user_id,
            job.group_id,
            job.name.as_deref().unwrap_or("unknown"),
            job.state,
            job.partition,
            fmt_limit(job.time_limit),
            fmt_time(job.start_time),
            fmt_time(job.end_time),
            job.nodes.as_deref().unwrap_or("(null)"),
            job.node_cnt,
            job.exit_code,
        );
        let mut guard = self.file.lock();
        if guard.is_none() {
            match OpenOptions::new().create(true).append(true).open(&self.path) {
                Ok(f) => *guard = Some(f),
                Err(e) => {
                    error!("jobcomp: cannot open {}: {}", self.path.display(), e);
                    return;
                }
            }
        }
        if let Some(f) = guard.as_mut() {
            if let Err(e) = f.write_all(line.as_bytes()) {
                error!("jobcomp: write failed: {}", e);
                *guard = None;
            }
        }
    }
}

/// Discarding completion sink, for configurations without a jobcomp
/// destination.
pub struct NullJobComp;

impl JobCompSink for NullJobComp {
    fn record(&self, _job: &JobRecord) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BaseState, JobState};

    #[test]
    fn test_log_sink_hands_out_indices() {
        let sink = LogAcctSink::default();
        let job = JobRecord::new(1);
        let a = sink.job_start("c", &job);
        let b = sink.job_start("c", &job);
        assert!(b > a);
    }

    #[test]
    fn test_flatfile_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobcomp.log");
        let sink = FlatfileJobComp::new(path.clone());

        let mut job = JobRecord::new(7);
        job.partition = "debug".into();
        job.name = Some("test".into());
        job.state = JobState::new(BaseState::Complete);
        job.nodes = Some("n[0-1]".into());
        job.node_cnt = 2;
        sink.record(&job);
        sink.record(&job);

        let data = std::fs::read_to_string(&path).unwrap();
        assert_eq!(data.lines().count(), 2);
        assert!(data.contains("JobId=7"));
        assert!(data.contains("JobState=COMPLETE"));
        assert!(data.contains("NodeList=n[0-1]"));
    }
}
