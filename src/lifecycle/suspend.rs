//! Suspend and resume.
//!
//! Suspension atomically releases the job's node claims, notifies
//! every node agent, and starts the suspended clock; resume is the
//! strict inverse and pushes the end time out by the suspended
//! duration so the job keeps its full wall-clock allowance. Preemption
//! (gang) suspends are distinguished from admin suspends only by
//! clearing the priority, which preserves admin-hold semantics across
//! gang cycles.

use tracing::debug;

use crate::agent::{AgentRequest, AgentTarget};
use crate::codec::msg::{Message, SuspendMsg, RESUME_JOB, SUSPEND_JOB};
use crate::config::Config;
use crate::constants::INFINITE;
use crate::controller::Controller;
use crate::error::{SchedError, SchedResult};
use crate::job::table::JobTable;
use crate::job::{BaseState, JobId, JobState};
use crate::node::NodeRegistry;
use crate::now;

/// Send the suspend/resume RPC to every allocated node. Deliberately
/// not retried: gang cycles can quickly pile up a huge agent backlog.
fn suspend_rpc(ctl: &Controller, nodes: &NodeRegistry, jobs: &JobTable, job_id: JobId, op: u16) {
    let Some(job) = jobs.find(job_id) else { return };
    let Some(bitmap) = &job.node_bitmap else { return };
    let targets: Vec<AgentTarget> = bitmap
        .iter_set()
        .map(|i| AgentTarget {
            name: nodes.get(i).name.clone(),
            addr: nodes.get(i).addr,
        })
        .collect();
    ctl.agent.queue_request(AgentRequest {
        msg: Message::RequestSuspend(SuspendMsg { op, job_id }),
        targets,
        retry: false,
    });
}

/// Perform a suspend or resume operation. `clear_prio` marks a
/// preemption-driven operation (the gang scheduler) rather than an
/// admin/user one.
pub fn job_suspend(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    sus: &SuspendMsg,
    uid: u32,
    clear_prio: bool,
) -> SchedResult<()> {
    if !cfg.is_super_user(uid) {
        return Err(SchedError::AccessDenied);
    }
    let job_id = sus.job_id;
    let state = jobs.find(job_id).ok_or(SchedError::InvalidJobId)?.state;
    if state.is_pending() {
        return Err(SchedError::JobPending);
    }
    if state.is_finished() {
        return Err(SchedError::AlreadyDone);
    }

    let now_t = now();
    match sus.op {
        SUSPEND_JOB => {
            if !state.is_running() {
                return Err(SchedError::Disabled);
            }
            {
                let exclusive = jobs.find(job_id).expect("job present").exclusive();
                let bitmap = jobs
                    .find(job_id)
                    .and_then(|j| j.node_bitmap.clone())
                    .ok_or(SchedError::Disabled)?;
                nodes.suspend_release(&bitmap, exclusive);
            }
            suspend_rpc(ctl, nodes, jobs, job_id, SUSPEND_JOB);
            let job = jobs.find_mut(job_id).expect("job present");
            job.state = JobState::new(BaseState::Suspended);
            if clear_prio {
                job.priority = 0;
            }
            // bank the run interval that just ended
            if job.suspend_time > 0 {
                job.pre_sus_time += now_t.saturating_sub(job.suspend_time);
            } else {
                job.pre_sus_time += now_t.saturating_sub(job.start_time);
            }
            debug!("suspended job {}", job_id);
        }
        RESUME_JOB => {
            if !state.is_suspended() {
                return Err(SchedError::Disabled);
            }
            {
                let exclusive = jobs.find(job_id).expect("job present").exclusive();
                let bitmap = jobs
                    .find(job_id)
                    .and_then(|j| j.node_bitmap.clone())
                    .ok_or(SchedError::Disabled)?;
                // fails without side effects if any node went DOWN
                nodes.resume_reacquire(&bitmap, exclusive)?;
            }
            suspend_rpc(ctl, nodes, jobs, job_id, RESUME_JOB);
            {
                let job = jobs.find_mut(job_id).expect("job present");
                job.state = JobState::new(BaseState::Running);
                job.tot_sus_time += now_t.saturating_sub(job.suspend_time);
                if job.time_limit != INFINITE {
                    // restore the unconsumed wall-clock allowance
                    job.end_time =
                        now_t + job.time_limit.saturating_mul(60) - job.pre_sus_time;
                }
            }
            jobs.set_default_priority(job_id);
            debug!("resumed job {}", job_id);
        }
        _ => return Err(SchedError::Disabled),
    }

    let job = jobs.find_mut(job_id).expect("job present");
    job.time_last_active = now_t;
    job.suspend_time = now_t;
    ctl.acct.job_suspend(job);
    Ok(())
}
