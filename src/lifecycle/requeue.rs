//! Requeue: return a batch job to PENDING for another start.
//!
//! The old incarnation is closed out in accounting (it reads as
//! cancelled), the nodes are deallocated, and the record is reset so
//! the next start creates a fresh accounting row. Node-failure
//! requeues cap retries through `batch_flag`: a second launch failure
//! forces the job to FAILED.

use tracing::{error, info};

use crate::config::Config;
use crate::controller::Controller;
use crate::error::{SchedError, SchedResult};
use crate::job::table::JobTable;
use crate::job::{BaseState, JobId, JobState};
use crate::lifecycle::{deallocate_nodes, job_completion_logger};
use crate::node::NodeRegistry;
use crate::{now, UnixTime};

/// Reset a record back to PENDING after its allocation was torn down.
/// `node_fail` marks the node-failure path, which preserves suspended
/// time accounting and primes a checkpoint restart if one exists.
pub fn reset_for_requeue(
    ctl: &Controller,
    jobs: &mut JobTable,
    job_id: JobId,
    now_t: UnixTime,
    node_fail: bool,
) {
    let assoc_id = {
        let Some(job) = jobs.find_mut(job_id) else { return };
        job.db_index = 0;
        job.state = JobState::new(BaseState::Pending);
        if job.node_cnt > 0 {
            job.state.set_completing();
        }
        job.restart_cnt += 1;
        if !node_fail {
            job.pre_sus_time = 0;
            job.suspend_time = 0;
            job.tot_sus_time = 0;
        }
        // restart from the most recent periodic checkpoint when one
        // was being taken
        let prime_restart =
            node_fail && job.ckpt_interval > 0 && job.ckpt_time > 0;
        if let Some(details) = &mut job.details {
            // a restarted job must look like a new submission
            details.submit_time = now_t;
            if prime_restart {
                if let Some(ckpt_dir) = details.ckpt_dir.clone() {
                    details.restart_dir = Some(format!("{}/{}", ckpt_dir, job_id));
                }
            }
        }
        job.assoc_id
    };
    // the completion logger removed the submit; put it back
    ctl.assoc.lock().add_job_submit(assoc_id);
    jobs.set_default_priority(job_id);
}

/// Requeue path taken when a batch launch fails outright (the node
/// never ran the job). One retry only.
pub fn requeue_after_failure(
    ctl: &Controller,
    jobs: &mut JobTable,
    job_id: JobId,
    now_t: UnixTime,
    comp_flag: bool,
) {
    let assoc_id = {
        let Some(job) = jobs.find_mut(job_id) else { return };
        job.end_time = now_t;
        // close the old incarnation as a node failure
        job.state = JobState::new(BaseState::NodeFail);
        job.assoc_id
    };
    job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
    {
        let job = jobs.find_mut(job_id).expect("job present");
        job.db_index = 0;
        if let Some(details) = &mut job.details {
            // distinct submit time so accounting sees a new record
            details.submit_time = now_t + 1;
        }
        job.batch_flag += 1; // only one retry
        job.restart_cnt += 1;
        job.state = JobState::new(BaseState::Pending);
        if comp_flag {
            job.state.set_completing();
        }
    }
    ctl.assoc.lock().add_job_submit(assoc_id);
}

/// Admin/user requeue of a running, suspended, or pending batch job.
pub fn job_requeue(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    uid: u32,
    job_id: JobId,
) -> SchedResult<()> {
    let now_t = now();
    let (user_id, state, batch_flag, requeue_enabled, suspend_time) = {
        let job = jobs.find(job_id).ok_or(SchedError::InvalidJobId)?;
        (
            job.user_id,
            job.state,
            job.batch_flag,
            job.details.as_ref().map(|d| d.requeue > 0).unwrap_or(false),
            job.suspend_time,
        )
    };

    if user_id != uid && !cfg.is_super_user(uid) {
        return Err(SchedError::AccessDenied);
    }
    if state.is_finished() {
        return Err(SchedError::AlreadyDone);
    }
    if !requeue_enabled {
        return Err(SchedError::Disabled);
    }
    if state.is_completing() {
        return Err(SchedError::TransitionStateNoUpdate);
    }
    if state.is_pending() {
        return Ok(()); // nothing else to do
    }
    if batch_flag == 0 {
        return Err(SchedError::BatchOnly);
    }
    if !state.is_suspended() && !state.is_running() {
        error!("job_requeue: job {} in unexpected state {}", job_id, state);
        return Err(SchedError::TransitionStateNoUpdate);
    }

    let mut suspended = false;
    if state.is_suspended() {
        let job = jobs.find_mut(job_id).expect("job present");
        ctl.acct.job_suspend(job);
        suspended = true;
    }

    {
        let job = jobs.find_mut(job_id).expect("job present");
        job.time_last_active = now_t;
        job.end_time = if suspended { suspend_time } else { now_t };
        // the accounting logs should read as a cancellation
        job.state = JobState::new(BaseState::Cancelled);
        if let Some(details) = &mut job.details {
            details.req_node_layout = None;
        }
    }
    deallocate_nodes(ctl, jobs, nodes, job_id, false, suspended);
    job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
    reset_for_requeue(ctl, jobs, job_id, now_t, false);
    info!("requeued job {} by uid {}", job_id, uid);
    Ok(())
}
