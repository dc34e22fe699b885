//! Time-limit and health enforcement.
//!
//! Runs on a fixed tick over every job: clears CONFIGURING once nodes
//! have registered, enforces the inactivity limit, the wall-clock
//! limit (with over-run grace), reservation expiry, and the
//! association usage limits, warns interactive clients shortly before
//! expiry, and escalates stuck completions.

use tracing::{debug, info};

use crate::assoc::UsageBreach;
use crate::config::Config;
use crate::constants::{INFINITE, PERIODIC_TIMEOUT};
use crate::controller::Controller;
use crate::job::table::JobTable;
use crate::job::{BaseState, JobId, JobState, StateReason};
use crate::lifecycle::{deallocate_nodes, job_completion_logger, job_epilog_complete, SIGKILL};
use crate::node::NodeRegistry;
use crate::{now, srun};

/// One enforcement pass. `tick_secs` is the elapsed time charged to
/// association usage counters.
pub fn job_time_limit(ctl: &Controller, tick_secs: u32) {
    let cfg = ctl.config.read();
    let mut jobs = ctl.jobs.write();
    let mut nodes = ctl.nodes.write();
    let parts = ctl.parts.read();

    let now_t = now();
    let inactive_cutoff = now_t.saturating_sub(cfg.inactive_limit);
    let over_run_cutoff = |end_time: u32| now_t >= end_time.saturating_add(cfg.over_run_secs());

    for job_id in jobs.ids() {
        // settle CONFIGURING once every allocated node has checked in
        let clear_configuring = {
            let Some(job) = jobs.find(job_id) else { continue };
            job.state.is_configuring()
                && (!job.is_running()
                    || job
                        .node_bitmap
                        .as_ref()
                        .map(|bm| {
                            !bm.overlaps(&nodes.power_bitmap)
                                && bm.iter_set().all(|i| {
                                    nodes.get(i).state != crate::node::NodeState::Unknown
                                })
                        })
                        .unwrap_or(true))
        };
        if clear_configuring {
            debug!("configuration for job {} is complete", job_id);
            jobs.find_mut(job_id).expect("job present").state.clear_configuring();
        }

        // pick system-held jobs back up once nodes return to service
        {
            let needs_prio = {
                let Some(job) = jobs.find(job_id) else { continue };
                job.priority == 1 && !job.is_finished() && !job.direct_set_prio
            };
            if needs_prio {
                jobs.set_default_priority(job_id);
            }
        }

        // escalate completions that never drain
        {
            let stuck = {
                let Some(job) = jobs.find(job_id) else { continue };
                job.is_completing()
                    && job.end_time > 0
                    && now_t > job.end_time + cfg.kill_wait + cfg.epilog_max
            };
            if stuck {
                let Some(job) = jobs.find(job_id) else { continue };
                let names: Vec<String> = job
                    .node_bitmap
                    .as_ref()
                    .map(|bm| bm.iter_set().map(|i| nodes.get(i).name.clone()).collect())
                    .unwrap_or_default();
                for name in names {
                    info!(
                        "node {} stuck completing job {}, setting DOWN",
                        name, job_id
                    );
                    nodes.set_down(&name, "Epilog never completed");
                    job_epilog_complete(ctl, &cfg, &mut jobs, &mut nodes, job_id, &name, 0);
                }
                continue;
            }
        }

        let (running, assoc_id, end_time, time_limit, step_cnt, part_root_only, resv_id) = {
            let Some(job) = jobs.find(job_id) else { continue };
            (
                job.is_running(),
                job.assoc_id,
                job.end_time,
                job.time_limit,
                job.steps.len(),
                job.part_idx.map(|i| parts.get(i).root_only).unwrap_or(false),
                job.resv_id,
            )
        };
        if !running {
            continue;
        }

        // a job with live steps is active by definition
        if step_cnt > 0 {
            jobs.find_mut(job_id).expect("job present").time_last_active = now_t;
        }

        if cfg.inactive_limit > 0 && !part_root_only {
            let inactive = jobs
                .find(job_id)
                .map(|j| j.time_last_active <= inactive_cutoff)
                .unwrap_or(false);
            if inactive {
                info!("inactivity time limit reached for JobId={}", job_id);
                job_timed_out(ctl, &cfg, &mut jobs, &mut nodes, job_id);
                let job = jobs.find_mut(job_id).expect("job present");
                job.state_reason = StateReason::InactiveLimit;
                job.state_desc = None;
                continue;
            }
        }

        if time_limit != INFINITE && over_run_cutoff(end_time) {
            info!("time limit exhausted for JobId={}", job_id);
            job_timed_out(ctl, &cfg, &mut jobs, &mut nodes, job_id);
            let job = jobs.find_mut(job_id).expect("job present");
            job.state_reason = StateReason::Timeout;
            job.state_desc = None;
            continue;
        }

        if resv_id != 0 && ctl.resv.lock().ended(resv_id) {
            info!("reservation ended for JobId={}", job_id);
            job_timed_out(ctl, &cfg, &mut jobs, &mut nodes, job_id);
            let job = jobs.find_mut(job_id).expect("job present");
            job.state_reason = StateReason::Timeout;
            job.state_desc = None;
            continue;
        }

        // association usage: charge this tick, then walk the chain
        if assoc_id != 0 {
            let (cpu_mins, total_procs, run_mins) = {
                let job = jobs.find(job_id).expect("job present");
                (
                    job.cpu_usage_mins(now_t),
                    job.total_procs.max(1),
                    (now_t.saturating_sub(job.start_time).saturating_sub(job.tot_sus_time)) / 60,
                )
            };
            let breach = {
                let mut assoc = ctl.assoc.lock();
                assoc.accrue_usage(
                    assoc_id,
                    tick_secs as u64 * total_procs as u64,
                    tick_secs as u64,
                );
                let wall_limit_hit = assoc
                    .max_wall_pj(assoc_id)
                    .map(|limit| run_mins >= limit)
                    .unwrap_or(false);
                if wall_limit_hit {
                    Some(UsageBreach::MaxWallPerJob)
                } else {
                    assoc.check_usage(assoc_id, cpu_mins)
                }
            };
            if let Some(breach) = breach {
                info!("JobId={} timed out on association limit {:?}", job_id, breach);
                job_timed_out(ctl, &cfg, &mut jobs, &mut nodes, job_id);
                let job = jobs.find_mut(job_id).expect("job present");
                job.state_reason = StateReason::Timeout;
                job.state_desc = None;
                continue;
            }
        }

        // give the client warning of a pending timeout
        if time_limit != INFINITE && end_time <= now_t + PERIODIC_TIMEOUT * 2 {
            let job = jobs.find(job_id).expect("job present");
            srun::srun_timeout(ctl, job);
        }
    }
}

/// Terminate a job that exhausted a limit: graceful kill first, the
/// hard terminate follows from the completing sweep.
pub fn job_timed_out(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    job_id: JobId,
) {
    let has_details = jobs
        .find(job_id)
        .map(|j| j.details.is_some())
        .unwrap_or(false);
    if !has_details {
        let _ = crate::lifecycle::job_signal(ctl, cfg, jobs, nodes, job_id, SIGKILL, false, 0);
        return;
    }
    let now_t = now();
    {
        let job = jobs.find_mut(job_id).expect("job present");
        job.end_time = now_t;
        job.time_last_active = now_t;
        job.state = JobState::new(BaseState::Timeout);
        job.state.set_completing();
        job.exit_code = job.exit_code.max(1);
    }
    deallocate_nodes(ctl, jobs, nodes, job_id, true, false);
    job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
}
