//! Job lifecycle controller.
//!
//! Every state transition flows through here: submission, start,
//! completion in all its flavors, cancellation, node failure handling,
//! requeue, suspend/resume, checkpoint/restart, and purge. Each
//! transition stamps the job table's update time, writes the
//! completion sink, and keeps the accounting sink in step.

pub mod checkpoint;
pub mod requeue;
pub mod suspend;
pub mod timelimit;

use tracing::{debug, error, info, warn};

use crate::agent::{mail_job_info, AgentRequest, AgentTarget, MAIL_JOB_END, MAIL_JOB_FAIL};
use crate::codec::msg::{JobDescMsg, KillJobMsg, Message, NodeRegistrationMsg, UpdateJobTimeMsg};
use crate::config::{Config, ENFORCE_ASSOCS, ENFORCE_LIMITS};
use crate::constants::{INFINITE, MAX_STR_LEN, NO_VAL};
use crate::controller::Controller;
use crate::error::{SchedError, SchedResult};
use crate::job::table::JobTable;
use crate::job::{
    parse_dependency, BaseState, JobDetails, JobId, JobRecord, JobState, StateReason,
};
use crate::node::NodeRegistry;
use crate::partition::PartTable;
use crate::sched::{self, select::SelectMode};
use crate::{now, srun};

pub const SIGKILL: u16 = 9;

/// Outcome of a submit/allocate request.
pub struct AllocateOutcome {
    pub job_id: JobId,
    /// The job started immediately (interactive allocations).
    pub started: bool,
}

/// Log the completion of a job: policy counters, notifications, the
/// jobcomp sink, and accounting closure.
pub fn job_completion_logger(ctl: &Controller, job: &mut JobRecord) {
    ctl.assoc.lock().remove_job_submit(job.assoc_id);

    // CONFIGURING would confuse every later display of the job
    job.state.clear_configuring();

    srun::srun_job_complete(ctl, job);

    match job.state.base {
        BaseState::Complete | BaseState::Cancelled => {
            if job.mail_type & MAIL_JOB_END != 0 {
                mail_job_info(ctl, job, MAIL_JOB_END);
            }
        }
        _ => {
            if job.mail_type & MAIL_JOB_FAIL != 0 {
                mail_job_info(ctl, job, MAIL_JOB_FAIL);
            } else if job.mail_type & MAIL_JOB_END != 0 {
                mail_job_info(ctl, job, MAIL_JOB_END);
            }
        }
    }

    ctl.jobcomp.record(job);

    let cluster = ctl.cluster_name();
    if job.assoc_id == 0 {
        // accounting may have been enabled after the job started
        let found = ctl.assoc.lock().fill_in(
            0,
            job.user_id,
            job.account.as_deref(),
            Some(&job.partition),
            false,
        );
        if let Some(id) = found {
            job.assoc_id = id;
            job.db_index = ctl.acct.job_start(&cluster, job);
        }
    }
    if job.nodes.is_none() && job.db_index == 0 {
        // the job was never eligible; record it anyway
        job.db_index = ctl.acct.job_start(&cluster, job);
    }
    ctl.acct.job_complete(job);
    metrics::counter!("jobs_completed_total").increment(1);
}

/// Release a job's allocation: completing-side node bookkeeping plus
/// the terminate RPC fan-out. `timeout_kill` selects the graceful
/// KILL_TIMELIMIT RPC over immediate termination.
pub fn deallocate_nodes(
    ctl: &Controller,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    job_id: JobId,
    timeout_kill: bool,
    suspended: bool,
) {
    let (bitmap, exclusive, targets, kill_msg) = {
        let Some(job) = jobs.find_mut(job_id) else { return };
        let Some(bitmap) = job.node_bitmap.clone() else {
            job.state.clear_completing();
            return;
        };
        job.state.set_completing();
        let exclusive = job.exclusive();
        let targets: Vec<AgentTarget> = bitmap
            .iter_set()
            .map(|i| AgentTarget {
                name: nodes.get(i).name.clone(),
                addr: nodes.get(i).addr,
            })
            .collect();
        let kill_msg = KillJobMsg {
            job_id,
            job_uid: job.user_id,
            nodes: job.nodes.clone(),
            end_time: job.end_time,
        };
        (bitmap, exclusive, targets, kill_msg)
    };

    {
        let Some(job) = jobs.find_mut(job_id) else { return };
        job.nodes_completing = Some(nodes.bitmap_to_names(&bitmap));
    }

    if suspended {
        nodes.mark_completing_only(&bitmap);
    } else {
        nodes.begin_completing(&bitmap, exclusive);
    }

    {
        let job = jobs.find(job_id).expect("job present");
        ctl.licenses.lock().release(&job.license_list);
    }

    let msg = if timeout_kill {
        Message::RequestKillTimelimit(kill_msg)
    } else {
        Message::RequestTerminateJob(kill_msg)
    };
    ctl.agent.queue_request(AgentRequest {
        msg,
        targets,
        retry: true,
    });
}

/// Validate string sizes on an incoming descriptor so a hostile client
/// cannot balloon controller memory.
fn validate_desc_strings(desc: &JobDescMsg) -> SchedResult<()> {
    let too_long = [
        desc.name.as_deref(),
        desc.account.as_deref(),
        desc.alloc_node.as_deref(),
        desc.comment.as_deref(),
        desc.work_dir.as_deref(),
        desc.stdout.as_deref(),
        desc.stderr.as_deref(),
        desc.stdin.as_deref(),
        desc.partition.as_deref(),
        desc.network.as_deref(),
        desc.licenses.as_deref(),
        desc.wckey.as_deref(),
        desc.mail_user.as_deref(),
    ]
    .iter()
    .any(|s| s.map(|v| v.len() > MAX_STR_LEN).unwrap_or(false));
    if too_long {
        return Err(SchedError::PathnameTooLong);
    }
    Ok(())
}

fn parse_features(spec: &str) -> Vec<String> {
    spec.split(['&', ','])
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Create a job record from a submit descriptor: resolve and validate
/// the partition, access, association policy, node lists, licenses,
/// features, dependencies, and reservation; persist batch inputs; and
/// insert the record in PENDING.
pub fn job_create(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &NodeRegistry,
    parts: &PartTable,
    desc: &mut JobDescMsg,
    submit_uid: u32,
    will_run: bool,
) -> SchedResult<JobId> {
    validate_desc_strings(desc)?;

    let part_idx = parts.resolve(desc.partition.as_deref())?;
    let part = parts.get(part_idx);

    // partition node-count window
    if desc.min_nodes == NO_VAL {
        desc.min_nodes = part.min_nodes;
    } else if cfg.enforce_part_limits
        && part.max_nodes != INFINITE
        && desc.min_nodes > part.max_nodes
    {
        info!(
            "job_create: min nodes {} above partition {} max {}",
            desc.min_nodes, part.name, part.max_nodes
        );
        return Err(SchedError::TooManyRequestedNodes);
    }
    if desc.max_nodes != NO_VAL
        && desc.max_nodes != 0
        && cfg.enforce_part_limits
        && desc.max_nodes < part.min_nodes
    {
        return Err(SchedError::TooManyRequestedNodes);
    }

    // time limit window
    if desc.time_limit == NO_VAL && part.default_time != INFINITE {
        desc.time_limit = part.default_time;
    }
    if cfg.enforce_part_limits
        && desc.time_limit != NO_VAL
        && part.max_time != INFINITE
        && desc.time_limit > part.max_time
    {
        info!("job_create: time limit {} above partition max", desc.time_limit);
        return Err(SchedError::InvalidTimeLimit);
    }

    // memory policy
    if desc.job_min_memory == 0 {
        desc.job_min_memory = cfg.def_mem_per_task;
    }
    if cfg.max_mem_per_task > 0 && desc.job_min_memory > cfg.max_mem_per_task {
        return Err(SchedError::InvalidTaskMemory);
    }

    // partition access
    if desc.user_id == 0 && part.disable_root_jobs {
        warn!("job_create: root jobs disabled in partition {}", part.name);
        return Err(SchedError::UserIdMissing);
    }
    if part.root_only && submit_uid != 0 {
        info!(
            "job_create: uid {} denied access to root-only partition {}",
            submit_uid, part.name
        );
        return Err(SchedError::AccessDenied);
    }

    // association resolution and accounting policy
    let assoc_id = {
        let assoc = ctl.assoc.lock();
        let enforce = cfg.accounting_enforce & ENFORCE_ASSOCS != 0;
        match assoc.fill_in(
            0,
            desc.user_id,
            desc.account.as_deref(),
            Some(&part.name),
            enforce,
        ) {
            Some(id) => {
                if desc.account.is_none() {
                    desc.account = assoc.get(id).map(|r| r.acct.clone());
                }
                if cfg.accounting_enforce & ENFORCE_LIMITS != 0 {
                    assoc.validate_policy(desc, part.max_time, id)?;
                }
                id
            }
            None if enforce => {
                info!(
                    "job_create: no association for uid {} account {:?}",
                    desc.user_id, desc.account
                );
                return Err(SchedError::InvalidAccount);
            }
            None => 0,
        }
    };

    // requested / excluded node lists
    let mut req_bitmap = None;
    if let Some(req) = desc.req_nodes.as_deref() {
        let mut bm = nodes.name_list_to_bitmap(req)?;
        if desc.contiguous != 0 {
            bm.fill_gaps();
        }
        if !bm.is_subset_of(&part.node_bitmap) {
            info!(
                "job_create: requested nodes {} not in partition {}",
                req, part.name
            );
            return Err(SchedError::NodesNotInPartition);
        }
        let cnt = bm.count() as u32;
        if cnt > desc.min_nodes {
            desc.min_nodes = cnt;
        }
        if cnt > desc.num_procs {
            desc.num_procs = cnt;
        }
        if desc.max_nodes != NO_VAL && desc.max_nodes != 0 && desc.min_nodes > desc.max_nodes {
            desc.max_nodes = desc.min_nodes;
        }
        req_bitmap = Some(bm);
    }
    let mut exc_bitmap = None;
    if let Some(exc) = desc.exc_nodes.as_deref() {
        exc_bitmap = Some(nodes.name_list_to_bitmap(exc)?);
    }
    if let (Some(req), Some(exc)) = (&req_bitmap, &exc_bitmap) {
        if req.overlaps(exc) {
            info!("job_create: required and excluded node lists overlap");
            return Err(SchedError::InvalidNodeName);
        }
    }
    if desc.min_nodes == NO_VAL {
        desc.min_nodes = 1;
    }

    // capacity sanity against the partition
    if part.state_up && desc.num_procs > part.total_cpus {
        info!(
            "job_create: {} cpus requested of partition {} ({})",
            desc.num_procs, part.name, part.total_cpus
        );
        return Err(SchedError::TooManyRequestedCpus);
    }
    if part.state_up && desc.min_nodes > part.total_nodes {
        info!(
            "job_create: {} nodes requested of partition {} ({})",
            desc.min_nodes, part.name, part.total_nodes
        );
        return Err(SchedError::TooManyRequestedNodes);
    }
    if desc.max_nodes != NO_VAL && desc.max_nodes != 0 && desc.max_nodes < desc.min_nodes {
        return Err(SchedError::TooManyRequestedNodes);
    }

    // features must exist somewhere in the cluster
    let feature_list = match desc.features.as_deref() {
        Some(spec) => {
            let list = parse_features(spec);
            let refs: Vec<&str> = list.iter().map(|s| s.as_str()).collect();
            if !nodes.features_known(&refs) {
                return Err(SchedError::InvalidFeature);
            }
            list
        }
        None => Vec::new(),
    };

    // licenses
    let license_list = ctl.licenses.lock().validate(desc.licenses.as_deref())?;

    // reservation
    let resv_id = match desc.reservation.as_deref() {
        Some(name) => ctl
            .resv
            .lock()
            .validate_job_resv(name, desc.user_id, desc.account.as_deref())?,
        None => 0,
    };

    // dependency list (targets resolved lazily at evaluation time)
    let depend_list = match desc.dependency.as_deref() {
        Some(spec) => parse_dependency(spec, 0)?,
        None => Vec::new(),
    };

    // build the record
    let job_id = if desc.job_id != NO_VAL && submit_uid == 0 {
        // forced id (checkpoint restart); must be free
        if jobs.find(desc.job_id).is_some() {
            return Err(SchedError::Disabled);
        }
        let rec = JobRecord::new(desc.job_id);
        jobs.insert(rec)?;
        desc.job_id
    } else {
        jobs.create()?.job_id
    };
    desc.job_id = job_id;

    let now_t = now();
    {
        let job = jobs.find_mut(job_id).expect("just created");
        job.assoc_id = assoc_id;
        job.user_id = desc.user_id;
        job.group_id = desc.group_id;
        job.name = desc.name.clone();
        job.wckey = desc.wckey.clone();
        job.account = desc.account.clone();
        job.comment = desc.comment.clone();
        job.network = desc.network.clone();
        job.licenses = desc.licenses.clone();
        job.license_list = license_list;
        job.partition = part.name.clone();
        job.part_idx = Some(part_idx);
        job.num_procs = desc.num_procs.max(1);
        job.time_limit = desc.time_limit;
        job.kill_on_node_fail = desc.kill_on_node_fail.min(1);
        job.priority = desc.priority;
        job.direct_set_prio = desc.priority != NO_VAL && submit_uid == 0;
        job.resv_name = desc.reservation.clone();
        job.resv_id = resv_id;
        job.mail_type = desc.mail_type;
        job.mail_user = desc.mail_user.clone();
        job.ckpt_interval = desc.ckpt_interval;
        job.alloc_node = desc.alloc_node.clone();
        job.alloc_sid = desc.alloc_sid;
        job.resp_host = desc.resp_host.clone();
        job.alloc_resp_port = desc.alloc_resp_port;
        job.other_port = desc.other_port;
        job.select_blob = desc.select_blob.clone();
        job.spank_env = desc.spank_env.clone();

        let requeue = if desc.requeue == NO_VAL as u16 {
            cfg.job_requeue as u16
        } else {
            desc.requeue.min(1)
        };
        job.details = Some(JobDetails {
            submit_time: now_t,
            begin_time: desc.begin_time,
            min_nodes: desc.min_nodes,
            max_nodes: if desc.max_nodes == NO_VAL { 0 } else { desc.max_nodes },
            num_tasks: desc.num_tasks.max(1),
            cpus_per_task: desc.cpus_per_task.max(1),
            ntasks_per_node: desc.ntasks_per_node,
            requeue,
            shared: if part.shared { desc.shared } else { 0 },
            contiguous: desc.contiguous,
            nice: desc.nice,
            overcommit: desc.overcommit,
            open_mode: desc.open_mode,
            prolog_running: 0,
            acctg_freq: desc.acctg_freq,
            task_dist: desc.task_dist,
            job_min_procs: desc.job_min_procs,
            job_min_memory: desc.job_min_memory,
            job_min_tmp_disk: desc.job_min_tmp_disk,
            req_nodes: desc.req_nodes.clone(),
            req_node_bitmap: req_bitmap,
            req_node_layout: None,
            exc_nodes: desc.exc_nodes.clone(),
            exc_node_bitmap: exc_bitmap,
            features: desc.features.clone(),
            feature_list,
            dependency: desc.dependency.clone(),
            depend_list,
            argv: desc.argv.clone(),
            env_sup: desc.spank_env.clone(),
            stderr: desc.stderr.clone(),
            stdin: desc.stdin.clone(),
            stdout: desc.stdout.clone(),
            work_dir: desc.work_dir.clone(),
            ckpt_dir: desc.ckpt_dir.clone(),
            restart_dir: desc.restart_dir.clone(),
            cpu_bind: desc.cpu_bind.clone(),
            cpu_bind_type: desc.cpu_bind_type,
            mem_bind: desc.mem_bind.clone(),
            mem_bind_type: desc.mem_bind_type,
            multi_core: desc.multi_core.clone(),
        });
    }

    // persist batch inputs before the job can start anywhere
    if desc.script.is_some() && !will_run {
        if let Err(err) = crate::state::write_job_desc_files(cfg, job_id, desc) {
            error!("job_create: cannot write batch files for {}: {}", job_id, err);
            let job = jobs.find_mut(job_id).expect("job present");
            job.state = JobState::new(BaseState::Failed);
            job.exit_code = 1;
            job.state_reason = StateReason::System;
            job.start_time = now_t;
            job.end_time = now_t;
            return Err(SchedError::WritingToFile(err.to_string()));
        }
        jobs.find_mut(job_id).expect("job present").batch_flag = 1;
    }

    // partition may be unusable right now; queue at the bottom rather
    // than reject
    let mut fail_reason = StateReason::None;
    {
        let job = jobs.find(job_id).expect("job present");
        if part.max_nodes != INFINITE && desc.min_nodes > part.max_nodes {
            fail_reason = StateReason::PartNodeLimit;
        } else if desc.max_nodes != 0
            && desc.max_nodes != NO_VAL
            && desc.max_nodes < part.min_nodes
        {
            fail_reason = StateReason::PartNodeLimit;
        } else if !part.state_up {
            fail_reason = StateReason::PartDown;
        } else if job.time_limit != INFINITE
            && part.max_time != INFINITE
            && job.time_limit > part.max_time
        {
            fail_reason = StateReason::PartTimeLimit;
        }
    }
    if fail_reason != StateReason::None {
        // leave the job queued at the bottom; the caller reports the
        // warning code to the client
        let job = jobs.find_mut(job_id).expect("job present");
        job.priority = 1; // end of queue
        job.state_reason = fail_reason;
        job.state_desc = None;
    }

    debug!("job_create: job {} created for uid {}", job_id, desc.user_id);
    Ok(job_id)
}

/// Submit/allocate entry: create the record, then either leave it
/// queued or try to start it immediately.
#[allow(clippy::too_many_arguments)]
pub fn job_allocate(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    parts: &PartTable,
    desc: &mut JobDescMsg,
    submit_uid: u32,
    immediate: bool,
    will_run: bool,
    allocate: bool,
) -> SchedResult<AllocateOutcome> {
    let now_t = now();
    let job_id = job_create(ctl, cfg, jobs, nodes, parts, desc, submit_uid, will_run)?;

    // the partition cannot serve the job as configured: it stays
    // queued at the bottom, the client gets a warning code
    let part_unusable = {
        let job = jobs.find(job_id).expect("just created");
        matches!(
            job.state_reason,
            StateReason::PartNodeLimit | StateReason::PartTimeLimit | StateReason::PartDown
        )
    };
    if part_unusable {
        if immediate || will_run {
            let job = jobs.find_mut(job_id).expect("job present");
            job.state = JobState::new(BaseState::Failed);
            job.exit_code = 1;
            job.start_time = now_t;
            job.end_time = now_t;
            job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
        } else {
            let assoc_id = jobs.find(job_id).expect("job present").assoc_id;
            ctl.assoc.lock().add_job_submit(assoc_id);
        }
        return Err(SchedError::PartConfigUnavailable);
    }

    let independent = sched::job_independent(ctl, jobs, job_id);

    if jobs.find(job_id).map(|j| j.priority == NO_VAL).unwrap_or(false) {
        jobs.set_default_priority(job_id);
    }

    let licenses_free = {
        let job = jobs.find(job_id).expect("job present");
        ctl.licenses.lock().test(&job.license_list)
    };
    let independent = independent && licenses_free;

    // avoid fragmentation while another job is completing
    let too_fragmented = cfg.avoid_fragmentation
        && (submit_uid != 0 || desc.req_nodes.is_none())
        && independent
        && sched::job_is_completing(cfg, jobs);

    let top_prio = if independent && !too_fragmented {
        sched::top_priority(jobs, parts, job_id)
    } else {
        true // not runnable anyway, skip the scan
    };

    if immediate && (too_fragmented || !top_prio || !independent) {
        let job = jobs.find_mut(job_id).expect("job present");
        job.state = JobState::new(BaseState::Failed);
        job.exit_code = 1;
        job.state_reason = StateReason::BadConstraints;
        job.state_desc = None;
        job.start_time = now_t;
        job.end_time = now_t;
        job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
        return Err(if !independent {
            SchedError::Dependency
        } else if too_fragmented {
            SchedError::Fragmentation
        } else {
            SchedError::NotTopPriority
        });
    }

    let test_only = will_run || !allocate;
    let no_alloc = test_only || too_fragmented || !top_prio || !independent;
    let mode = if no_alloc { SelectMode::WillRun } else { SelectMode::Run };

    let select_result = sched::select_nodes(ctl, cfg, jobs, nodes, parts, job_id, mode);

    // probes are discarded by the caller and never count as submits
    if !will_run {
        let job = jobs.find(job_id).expect("job present");
        ctl.assoc.lock().add_job_submit(job.assoc_id);
    }

    match select_result {
        Ok(()) => Ok(AllocateOutcome {
            job_id,
            started: mode == SelectMode::Run,
        }),
        Err(err) if err.is_capacity() || err == SchedError::JobHeld => {
            if immediate {
                let job = jobs.find_mut(job_id).expect("job present");
                job.state = JobState::new(BaseState::Failed);
                job.exit_code = 1;
                job.state_reason = StateReason::BadConstraints;
                job.state_desc = None;
                job.start_time = now_t;
                job.end_time = now_t;
                job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
                Err(err)
            } else {
                // job stays queued; busy outcomes are not submit errors
                if matches!(err, SchedError::NodesBusy | SchedError::NodeConfigUnavailable) {
                    Ok(AllocateOutcome { job_id, started: false })
                } else {
                    Err(err)
                }
            }
        }
        Err(SchedError::AccountingPolicy) => {
            Ok(AllocateOutcome { job_id, started: false })
        }
        Err(err) => {
            // fundamental flaw in the request
            let job = jobs.find_mut(job_id).expect("job present");
            job.state = JobState::new(BaseState::Failed);
            job.exit_code = 1;
            job.state_reason = StateReason::BadConstraints;
            job.state_desc = None;
            job.start_time = now_t;
            job.end_time = now_t;
            job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
            Err(err)
        }
    }
}

/// Signal or cancel a job.
pub fn job_signal(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    job_id: JobId,
    signal: u16,
    batch_only: bool,
    uid: u32,
) -> SchedResult<()> {
    let now_t = now();
    let (user_id, state, suspend_time) = {
        let job = jobs.find(job_id).ok_or(SchedError::InvalidJobId)?;
        (job.user_id, job.state, job.suspend_time)
    };

    if user_id != uid && !cfg.is_super_user(uid) {
        error!("security violation: cancel RPC for job {} from uid {}", job_id, uid);
        return Err(SchedError::AccessDenied);
    }
    if state.is_finished() {
        return Err(SchedError::AlreadyDone);
    }

    if signal == SIGKILL {
        jobs.find_mut(job_id).expect("job present").requid = Some(uid);
    }

    // requeued job still completing its old allocation
    if state.is_pending() && state.is_completing() && signal == SIGKILL {
        let job = jobs.find_mut(job_id).expect("job present");
        job.state = JobState::new(BaseState::Cancelled);
        job.state.set_completing();
        debug!("job_signal: cancelled requeuing job {}", job_id);
        return Ok(());
    }

    if state.is_pending() && signal == SIGKILL {
        let job = jobs.find_mut(job_id).expect("job present");
        job.state = JobState::new(BaseState::Cancelled);
        job.start_time = now_t;
        job.end_time = now_t;
        srun::srun_allocate_abort(ctl, job);
        job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
        debug!("job_signal: cancelled pending job {}", job_id);
        return Ok(());
    }

    if state.is_suspended() && signal == SIGKILL {
        let job = jobs.find_mut(job_id).expect("job present");
        job.end_time = suspend_time;
        job.tot_sus_time += now_t.saturating_sub(suspend_time);
        job.state = JobState::new(BaseState::Cancelled);
        job.state.set_completing();
        ctl.acct.job_suspend(job);
        deallocate_nodes(ctl, jobs, nodes, job_id, false, true);
        job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
        debug!("job_signal: cancelled suspended job {}", job_id);
        return Ok(());
    }

    if state.is_running() {
        if signal == SIGKILL {
            let job = jobs.find_mut(job_id).expect("job present");
            job.time_last_active = now_t;
            job.end_time = now_t;
            job.state = JobState::new(BaseState::Cancelled);
            job.state.set_completing();
            deallocate_nodes(ctl, jobs, nodes, job_id, false, false);
            job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
        } else if batch_only {
            let job = jobs.find(job_id).expect("job present");
            if job.batch_flag == 0 {
                return Err(SchedError::BatchOnly);
            }
            signal_batch_job(ctl, nodes, job, signal);
        } else {
            let job = jobs.find(job_id).expect("job present");
            signal_job(ctl, nodes, job, signal);
        }
        debug!("job_signal: signal {} to running job {} ok", signal, job_id);
        return Ok(());
    }

    debug!(
        "job_signal: job {} cannot take signal {} in state {}",
        job_id, signal, state
    );
    Err(SchedError::TransitionStateNoUpdate)
}

/// Signal every task of a job on every allocated node.
fn signal_job(ctl: &Controller, nodes: &NodeRegistry, job: &JobRecord, signal: u16) {
    let Some(bitmap) = &job.node_bitmap else { return };
    let targets: Vec<AgentTarget> = bitmap
        .iter_set()
        .map(|i| AgentTarget {
            name: nodes.get(i).name.clone(),
            addr: nodes.get(i).addr,
        })
        .collect();
    ctl.agent.queue_request(AgentRequest {
        msg: Message::RequestSignalJob(crate::codec::msg::SignalJobMsg {
            job_id: job.job_id,
            signal: signal as u32,
        }),
        targets,
        retry: true,
    });
}

/// Signal only the batch shell on the lead node.
fn signal_batch_job(ctl: &Controller, nodes: &NodeRegistry, job: &JobRecord, signal: u16) {
    let Some(lead) = job.node_bitmap.as_ref().and_then(|b| b.first_set()) else {
        error!("signal_batch_job: job {} has no assigned nodes", job.job_id);
        return;
    };
    let node = nodes.get(lead);
    ctl.agent.queue_request(AgentRequest {
        msg: Message::RequestSignalTasks(crate::codec::msg::SignalTasksMsg {
            job_id: job.job_id,
            step_id: NO_VAL,
            signal: signal as u32,
        }),
        targets: vec![AgentTarget {
            name: node.name.clone(),
            addr: node.addr,
        }],
        retry: true,
    });
}

/// Note the termination of a job: normal exit, failure, cancellation
/// by return code, or requeue after a launch failure.
pub fn job_complete(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    job_id: JobId,
    uid: u32,
    mut requeue: bool,
    mut job_return_code: u32,
) -> SchedResult<()> {
    let now_t = now();
    info!("completing job {}", job_id);

    let (user_id, state, batch_flag, has_details, suspend_time, end_time) = {
        let job = jobs.find(job_id).ok_or(SchedError::InvalidJobId)?;
        (
            job.user_id,
            job.state,
            job.batch_flag,
            job.details.is_some(),
            job.suspend_time,
            job.end_time,
        )
    };

    if state.is_finished() {
        return Err(SchedError::AlreadyDone);
    }
    if user_id != uid && !cfg.is_super_user(uid) {
        error!(
            "security violation: JOB_COMPLETE for job {} from uid {}",
            job_id, uid
        );
        return Err(SchedError::UserIdMissing);
    }
    if state.is_completing() {
        return Ok(()); // avoid replay
    }

    let mut job_comp_flag = state.is_running();
    let mut suspended = false;
    if state.is_suspended() {
        let job = jobs.find_mut(job_id).expect("job present");
        ctl.acct.job_suspend(job);
        job_comp_flag = true;
        suspended = true;
    }

    if requeue && batch_flag > 1 {
        // already retried once, just kill it
        requeue = false;
        if job_return_code == 0 {
            job_return_code = 1;
        }
        info!("batch job launch failure, JobId={}", job_id);
    }

    if requeue && has_details && batch_flag > 0 {
        requeue::requeue_after_failure(ctl, jobs, job_id, now_t, job_comp_flag);
        info!("non-responding node, requeue JobId={}", job_id);
    } else if state.is_pending() && has_details && batch_flag > 0 {
        // duplicate cancel from a slow-responding node agent
        return Ok(());
    } else {
        {
            let job = jobs.find_mut(job_id).expect("job present");
            if job_return_code == NO_VAL {
                job.state = JobState::new(BaseState::Cancelled);
                job.requid = Some(uid);
            } else if job_return_code != 0 {
                job.state = JobState::new(BaseState::Failed);
                job.exit_code = job_return_code;
                job.state_reason = StateReason::ExitCode;
                job.state_desc = None;
            } else if job_comp_flag && end_time < now_t {
                // over the time limit
                job.state = JobState::new(BaseState::Timeout);
                job.exit_code = job.exit_code.max(1);
                job.state_reason = StateReason::Timeout;
                job.state_desc = None;
            } else {
                job.state = JobState::new(BaseState::Complete);
                job.exit_code = job_return_code;
            }
            if job_comp_flag {
                job.state.set_completing();
            }
            if suspended {
                job.end_time = suspend_time;
                job.tot_sus_time += now_t.saturating_sub(suspend_time);
            } else {
                job.end_time = now_t;
            }
        }
        job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
    }

    if job_comp_flag {
        deallocate_nodes(ctl, jobs, nodes, job_id, false, suspended);
    }
    debug!("job_complete for JobId={} successful", job_id);
    Ok(())
}

/// A node reported its epilog finished for a job. Returns true when
/// the job has fully left COMPLETING. Idempotent per (job, node): a
/// duplicate report finds the node already excised and changes
/// nothing.
pub fn job_epilog_complete(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    job_id: JobId,
    node_name: &str,
    return_code: u32,
) -> bool {
    let Some(job) = jobs.find(job_id) else {
        return true;
    };

    // A cold-started controller can hear an epilog for a job that no
    // longer looks running; don't corrupt a reused job id.
    if (job.is_pending() && !job.is_completing()) || job.node_bitmap.is_none() {
        let down = nodes
            .find(node_name)
            .map(|i| nodes.get(i).is_down())
            .unwrap_or(false);
        if down {
            debug!(
                "epilog complete for job {} from DOWN node {}",
                job_id, node_name
            );
        } else {
            error!(
                "epilog complete response for non-running job {}, controller and node agent out of sync",
                job_id
            );
        }
        return false;
    }

    if return_code != 0 {
        error!("epilog error on {}, setting DOWN", node_name);
        nodes.set_down(node_name, "Epilog error");
    }

    let Some(idx) = nodes.find(node_name) else {
        return false;
    };

    let was_allocated = {
        let job = jobs.find_mut(job_id).expect("job present");
        match &mut job.node_bitmap {
            Some(bm) if bm.test(idx) => {
                bm.clear(idx);
                job.node_cnt = job.node_cnt.saturating_sub(1);
                job.nodes_completing = None; // stale, rebuilt on save
                true
            }
            _ => false,
        }
    };
    if was_allocated {
        if return_code == 0 {
            nodes.make_idle(idx);
        } else {
            // set_down above already removed it from service; still
            // drop the completing claim
            nodes.make_idle(idx);
        }
    }

    let finished = {
        let job = jobs.find_mut(job_id).expect("job present");
        if job.node_cnt == 0 {
            job.state.clear_completing();
            job.steps.clear();
            job.node_bitmap = None;
            true
        } else {
            false
        }
    };

    if finished {
        let cluster = ctl.cluster_name();
        let job = jobs.find_mut(job_id).expect("job present");
        if job.is_pending() && job.batch_flag > 0 {
            info!("requeue batch job {}", job_id);
            if job.details.is_some() {
                // the relaunched credential must postdate the revoked
                // one and the node needs time to flush job I/O
                if let Some(d) = job.details.as_mut() {
                    d.begin_time = now() + 10;
                }
                job.start_time = 0;
                job.end_time = 0;
                job.db_index = ctl.acct.job_start(&cluster, job);
            }
        }
        let _ = cfg;
        return true;
    }
    false
}

/// Agent-context wrapper: epilog bookkeeping with lock acquisition and
/// a scheduler kick when the job fully completes.
pub fn handle_epilog_complete(ctl: &Controller, job_id: JobId, node_name: &str, rc: u32) {
    let completed = {
        let cfg = ctl.config.read();
        let mut jobs = ctl.jobs.write();
        let mut nodes = ctl.nodes.write();
        job_epilog_complete(ctl, &cfg, &mut jobs, &mut nodes, job_id, node_name, rc)
    };
    if completed {
        ctl.wake_scheduler();
    }
}

/// Agent-context wrapper for job_complete.
pub fn job_complete_locked(ctl: &Controller, job_id: JobId, uid: u32, requeue: bool, rc: u32) {
    let cfg = ctl.config.read();
    let mut jobs = ctl.jobs.write();
    let mut nodes = ctl.nodes.write();
    if let Err(err) = job_complete(ctl, &cfg, &mut jobs, &mut nodes, job_id, uid, requeue, rc) {
        debug!("deferred job_complete for {}: {}", job_id, err);
    }
}

/// Remove one node from a live job's allocation, keeping the job
/// running on the remainder.
pub fn excise_node_from_job(
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    job_id: JobId,
    node_idx: usize,
) {
    let Some(job) = jobs.find_mut(job_id) else { return };
    let exclusive = job.exclusive();
    let Some(bitmap) = &mut job.node_bitmap else { return };
    if !bitmap.test(node_idx) {
        return;
    }

    // node_addrs is parallel to the bitmap's set-bit order
    let pos = bitmap.iter_set().take_while(|&i| i < node_idx).count();
    bitmap.clear(node_idx);
    if pos < job.node_addrs.len() {
        job.node_addrs.remove(pos);
    }
    job.node_cnt = job.node_cnt.saturating_sub(1);
    let bm = bitmap.clone();
    job.nodes = Some(nodes.bitmap_to_names(&bm));
    nodes.release_one(node_idx, exclusive);
}

/// A node went DOWN: deallocate or kill every job touching it. Returns
/// the count of affected jobs. Implements the kill_on_node_fail /
/// multi-node-survival / batch-requeue split.
pub fn kill_running_job_by_node_name(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    node_name: &str,
) -> usize {
    let Some(node_idx) = nodes.find(node_name) else {
        return 0;
    };
    let now_t = now();
    let mut job_count = 0usize;

    for job_id in jobs.ids() {
        let (on_node, state, kill_on_node_fail, node_cnt, batch_flag, requeue_ok, suspend_time) = {
            let Some(job) = jobs.find(job_id) else { continue };
            let on_node = job
                .node_bitmap
                .as_ref()
                .map(|b| b.test(node_idx))
                .unwrap_or(false);
            (
                on_node,
                job.state,
                job.kill_on_node_fail,
                job.node_cnt,
                job.batch_flag,
                job.details.as_ref().map(|d| d.requeue > 0).unwrap_or(false),
                job.suspend_time,
            )
        };
        if !on_node {
            continue;
        }

        let mut suspended = false;
        if state.is_suspended() {
            let job = jobs.find_mut(job_id).expect("job present");
            ctl.acct.job_suspend(job);
            suspended = true;
        }

        if state.is_completing() {
            // already on the way out; just finish this node's share
            job_count += 1;
            job_epilog_complete(ctl, cfg, jobs, nodes, job_id, node_name, 0);
        } else if state.is_running() || suspended {
            job_count += 1;
            if kill_on_node_fail == 0 && node_cnt > 1 {
                // keep the job alive on its surviving nodes
                error!("removing failed node {} from job {}", node_name, job_id);
                {
                    let job = jobs.find(job_id).expect("job present");
                    srun::srun_node_fail(ctl, job, node_name);
                }
                kill_step_on_node(jobs, job_id, node_idx);
                excise_node_from_job(jobs, nodes, job_id, node_idx);
            } else if batch_flag > 0 && requeue_ok {
                {
                    let job = jobs.find(job_id).expect("job present");
                    srun::srun_node_fail(ctl, job, node_name);
                }
                info!("requeue job {} due to failure of node {}", job_id, node_name);
                {
                    let job = jobs.find_mut(job_id).expect("job present");
                    job.time_last_active = now_t;
                    if suspended {
                        job.end_time = suspend_time;
                        job.tot_sus_time += now_t.saturating_sub(suspend_time);
                    } else {
                        job.end_time = now_t;
                    }
                    job.state = JobState::new(BaseState::NodeFail);
                }
                deallocate_nodes(ctl, jobs, nodes, job_id, false, suspended);
                job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
                requeue::reset_for_requeue(ctl, jobs, job_id, now_t, true);
            } else {
                info!("killing job {} on failed node {}", job_id, node_name);
                {
                    let job = jobs.find(job_id).expect("job present");
                    srun::srun_node_fail(ctl, job, node_name);
                }
                {
                    let job = jobs.find_mut(job_id).expect("job present");
                    job.state = JobState::new(BaseState::NodeFail);
                    job.state.set_completing();
                    job.exit_code = job.exit_code.max(1);
                    job.state_reason = StateReason::DownNode;
                    job.state_desc = None;
                    if suspended {
                        job.end_time = suspend_time;
                        job.tot_sus_time += now_t.saturating_sub(suspend_time);
                    } else {
                        job.end_time = now_t;
                    }
                }
                deallocate_nodes(ctl, jobs, nodes, job_id, false, suspended);
                job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
            }
        }
    }
    job_count
}

/// Drop step records' claim on a failed node (steps without no_kill
/// lose the node; their processes are already gone with the node).
fn kill_step_on_node(jobs: &mut JobTable, job_id: JobId, node_idx: usize) {
    let Some(job) = jobs.find_mut(job_id) else { return };
    for step in &mut job.steps {
        if let Some(bm) = &mut step.node_bitmap {
            if bm.test(node_idx) && !step.no_kill {
                bm.clear(node_idx);
            }
        }
    }
}

/// A partition was deleted: kill every job bound to it.
pub fn kill_job_by_part_name(
    ctl: &Controller,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    part_name: &str,
) -> usize {
    let now_t = now();
    let mut count = 0usize;
    for job_id in jobs.ids() {
        let (matches, state, suspend_time) = {
            let Some(job) = jobs.find(job_id) else { continue };
            (job.partition == part_name, job.state, job.suspend_time)
        };
        if !matches {
            continue;
        }
        {
            let job = jobs.find_mut(job_id).expect("job present");
            job.part_idx = None;
        }

        let mut suspended = false;
        if state.is_suspended() {
            let job = jobs.find_mut(job_id).expect("job present");
            ctl.acct.job_suspend(job);
            suspended = true;
        }

        if state.is_running() || suspended {
            count += 1;
            info!("killing job {} on defunct partition {}", job_id, part_name);
            {
                let job = jobs.find_mut(job_id).expect("job present");
                job.state = JobState::new(BaseState::NodeFail);
                job.state.set_completing();
                job.exit_code = job.exit_code.max(1);
                job.state_reason = StateReason::DownPartition;
                job.state_desc = None;
                if suspended {
                    job.end_time = suspend_time;
                    job.tot_sus_time += now_t.saturating_sub(suspend_time);
                } else {
                    job.end_time = now_t;
                }
            }
            deallocate_nodes(ctl, jobs, nodes, job_id, false, suspended);
            job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
        } else if state.is_pending() {
            count += 1;
            info!("killing pending job {} on defunct partition {}", job_id, part_name);
            let job = jobs.find_mut(job_id).expect("job present");
            job.state = JobState::new(BaseState::Cancelled);
            job.start_time = now_t;
            job.end_time = now_t;
            job.exit_code = 1;
            job.state_reason = StateReason::DownPartition;
            job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
        }
    }
    count
}

/// An association was deleted: cancel its live jobs, re-homing each
/// job's record to the surviving parent for accounting.
pub fn job_cancel_by_assoc_id(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    assoc_id: u32,
) -> usize {
    let mut count = 0usize;
    for job_id in jobs.ids() {
        let (matches, finished) = {
            let Some(job) = jobs.find(job_id) else { continue };
            (job.assoc_id == assoc_id, job.is_finished())
        };
        if !matches {
            continue;
        }
        let parent = ctl.assoc.lock().parent_of(assoc_id);
        {
            let job = jobs.find_mut(job_id).expect("job present");
            job.assoc_id = parent.unwrap_or(0);
        }
        if finished {
            continue;
        }
        info!("association deleted, cancelling job {}", job_id);
        let _ = job_signal(ctl, cfg, jobs, nodes, job_id, SIGKILL, false, 0);
        let job = jobs.find_mut(job_id).expect("job present");
        job.state_reason = StateReason::BankAccount;
        job.state_desc = None;
        count += 1;
    }
    count
}

/// Report whether the allocated nodes of a job are ready for use.
pub fn job_node_ready(jobs: &JobTable, nodes: &NodeRegistry, job_id: JobId) -> SchedResult<u32> {
    let job = jobs.find(job_id).ok_or(SchedError::InvalidJobId)?;
    let mut ready: u32 = 0;
    let nodes_ready = match &job.node_bitmap {
        Some(bm) => bm
            .iter_set()
            .all(|i| !nodes.get(i).is_down() && nodes.get(i).state != crate::node::NodeState::Unknown),
        None => false,
    };
    if nodes_ready {
        ready |= 1;
    }
    if job.is_running() && !job.state.is_configuring() {
        ready |= 2;
    }
    Ok(ready)
}

/// Projected end time of a job, for client timeout displays.
pub fn job_end_time(jobs: &JobTable, job_id: JobId) -> SchedResult<crate::UnixTime> {
    let job = jobs.find(job_id).ok_or(SchedError::InvalidJobId)?;
    Ok(job.end_time)
}

/// Purge terminal jobs older than `min_job_age` whose completion has
/// fully drained: not COMPLETING, no steps, description files removed.
pub fn purge_old_jobs(ctl: &Controller) {
    let cfg = ctl.config.read();
    let mut jobs = ctl.jobs.write();
    let cutoff = now().saturating_sub(cfg.min_job_age);
    let mut purged = 0usize;

    for job_id in jobs.ids() {
        let purgeable = {
            let Some(job) = jobs.find(job_id) else { continue };
            job.is_finished()
                && !job.is_completing()
                && job.steps.is_empty()
                && job.end_time < cutoff
        };
        if !purgeable {
            continue;
        }
        crate::state::delete_job_desc_files(&cfg, job_id);
        jobs.purge(job_id);
        purged += 1;
    }
    if purged > 0 {
        debug!("purged {} old job records", purged);
    }
}

/// Rebuild the `nodes_completing` strings before a state save.
pub fn update_job_nodes_completing(jobs: &mut JobTable, nodes: &NodeRegistry) {
    for job_id in jobs.ids() {
        let bm = {
            let Some(job) = jobs.find(job_id) else { continue };
            if !job.is_completing() {
                continue;
            }
            match &job.node_bitmap {
                Some(bm) => bm.clone(),
                None => continue,
            }
        };
        let names = nodes.bitmap_to_names(&bm);
        jobs.find_mut(job_id).expect("job present").nodes_completing = Some(names);
    }
}

/// Push a changed end time out to the job's node agents.
pub fn xmit_new_end_time(ctl: &Controller, nodes: &NodeRegistry, job: &JobRecord) {
    let Some(bitmap) = &job.node_bitmap else { return };
    let targets: Vec<AgentTarget> = bitmap
        .iter_set()
        .map(|i| AgentTarget {
            name: nodes.get(i).name.clone(),
            addr: nodes.get(i).addr,
        })
        .collect();
    ctl.agent.queue_request(AgentRequest {
        msg: Message::RequestUpdateJobTime(UpdateJobTimeMsg {
            job_id: job.job_id,
            expiration_time: job.end_time,
        }),
        targets,
        retry: true,
    });
}

/// Validate a node's registration report against the controller's
/// view: abort jobs the node should not be running and requeue batch
/// jobs whose launch evidently never arrived.
pub fn validate_jobs_on_node(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    reg: &NodeRegistrationMsg,
) {
    let Some(node_idx) = nodes.find(&reg.node_name) else {
        error!("registration from unknown node {}", reg.node_name);
        return;
    };
    let node_addr = nodes.get(node_idx).addr;
    let now_t = now();

    // jobs the node claims but the controller does not
    for &job_id in &reg.job_ids {
        let known = jobs
            .find(job_id)
            .map(|j| {
                (j.is_running() || j.is_completing() || j.is_suspended())
                    && j.node_bitmap
                        .as_ref()
                        .map(|b| b.test(node_idx))
                        .unwrap_or(false)
            })
            .unwrap_or(false);
        if !known {
            error!(
                "node {} registered orphan job {}, aborting it",
                reg.node_name, job_id
            );
            ctl.agent.queue_request(AgentRequest {
                msg: Message::RequestAbortJob(KillJobMsg {
                    job_id,
                    job_uid: 0,
                    nodes: Some(reg.node_name.clone()),
                    end_time: now_t,
                }),
                targets: vec![AgentTarget {
                    name: reg.node_name.clone(),
                    addr: node_addr,
                }],
                retry: true,
            });
        }
    }

    // batch jobs the controller placed here that the node knows
    // nothing about: the launch never landed. Nodes waking from power
    // save get the longer grace.
    let launch_grace = if nodes.power_bitmap.test(node_idx) {
        cfg.batch_start_timeout + cfg.resume_timeout
    } else {
        cfg.batch_start_timeout
    };
    for job_id in jobs.ids() {
        let missing = {
            let Some(job) = jobs.find(job_id) else { continue };
            job.is_running()
                && !job.is_completing()
                && job.batch_flag > 0
                && job
                    .node_bitmap
                    .as_ref()
                    .map(|b| b.first_set() == Some(node_idx))
                    .unwrap_or(false)
                && !reg.job_ids.contains(&job_id)
                && now_t > job.start_time + launch_grace
        };
        if missing {
            error!(
                "batch job {} missing from node {}, requeueing",
                job_id, reg.node_name
            );
            let _ = job_complete(ctl, cfg, jobs, nodes, job_id, 0, true, 1);
        }
    }
}

/// Apply a client's UPDATE_JOB request. Most fields are mutable only
/// while the job is PENDING; the time limit can shrink (owner) or
/// grow (operator) on a live job, pushing the new expiry to the node
/// agents.
pub fn update_job(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    parts: &PartTable,
    desc: &JobDescMsg,
    uid: u32,
) -> SchedResult<()> {
    let job_id = desc.job_id;
    let super_user = cfg.is_super_user(uid);
    let (user_id, state) = {
        let job = jobs.find(job_id).ok_or(SchedError::InvalidJobId)?;
        (job.user_id, job.state)
    };
    if user_id != uid && !super_user {
        error!("security violation: UPDATE_JOB for {} from uid {}", job_id, uid);
        return Err(SchedError::AccessDenied);
    }
    if state.is_finished() {
        return Err(SchedError::AlreadyDone);
    }

    if desc.time_limit != NO_VAL {
        let old_limit = jobs.find(job_id).expect("job present").time_limit;
        let growing = old_limit != INFINITE
            && (desc.time_limit == INFINITE || desc.time_limit > old_limit);
        if growing && !super_user {
            return Err(SchedError::AccessDenied);
        }
        {
            let job = jobs.find_mut(job_id).expect("job present");
            job.time_limit = desc.time_limit;
            if job.is_running() || job.is_suspended() {
                job.end_time = job
                    .compute_end_time(job.start_time)
                    .saturating_add(job.tot_sus_time);
            }
        }
        let job = jobs.find(job_id).expect("job present");
        if job.is_running() {
            xmit_new_end_time(ctl, nodes, job);
        }
        info!("update_job: set time limit of job {} to {}", job_id, desc.time_limit);
    }

    if desc.priority != NO_VAL {
        if desc.priority == INFINITE {
            // release: recompute through the normal path
            let job = jobs.find_mut(job_id).expect("job present");
            job.direct_set_prio = false;
            jobs.set_default_priority(job_id);
        } else if super_user {
            let job = jobs.find_mut(job_id).expect("job present");
            job.priority = desc.priority;
            job.direct_set_prio = true;
            if desc.priority == 0 {
                job.state_reason = StateReason::Held;
            }
        } else if desc.priority == 0 && user_id == uid {
            // users may hold their own pending jobs
            if !state.is_pending() {
                return Err(SchedError::TransitionStateNoUpdate);
            }
            let job = jobs.find_mut(job_id).expect("job present");
            job.priority = 0;
            job.state_reason = StateReason::Held;
        } else {
            return Err(SchedError::AccessDenied);
        }
        info!("update_job: set priority of job {} to {:?}", job_id, desc.priority);
    }

    if desc.name.is_some() {
        jobs.find_mut(job_id).expect("job present").name = desc.name.clone();
    }
    if desc.comment.is_some() {
        jobs.find_mut(job_id).expect("job present").comment = desc.comment.clone();
    }

    if desc.requeue != NO_VAL as u16 {
        let job = jobs.find_mut(job_id).expect("job present");
        if let Some(d) = &mut job.details {
            d.requeue = desc.requeue.min(1);
        }
    }

    // pending-only updates below
    let pending_updates = desc.dependency.is_some()
        || desc.min_nodes != NO_VAL
        || (desc.max_nodes != NO_VAL && desc.max_nodes != 0)
        || desc.partition.is_some()
        || desc.begin_time != 0;
    if pending_updates {
        if !state.is_pending() {
            return Err(SchedError::TransitionStateNoUpdate);
        }

        if let Some(dep) = desc.dependency.as_deref() {
            let list = parse_dependency(dep, job_id)?;
            let job = jobs.find_mut(job_id).expect("job present");
            if let Some(d) = &mut job.details {
                d.dependency = Some(dep.to_string());
                d.depend_list = list;
            }
        }

        if desc.min_nodes != NO_VAL {
            let job = jobs.find_mut(job_id).expect("job present");
            if let Some(d) = &mut job.details {
                d.min_nodes = desc.min_nodes;
            }
        }
        if desc.max_nodes != NO_VAL && desc.max_nodes != 0 {
            let job = jobs.find_mut(job_id).expect("job present");
            if let Some(d) = &mut job.details {
                d.max_nodes = desc.max_nodes;
            }
        }

        if let Some(part_name) = desc.partition.as_deref() {
            let part_idx = parts.find(part_name).ok_or(SchedError::InvalidPartitionName)?;
            let job = jobs.find_mut(job_id).expect("job present");
            job.partition = part_name.to_string();
            job.part_idx = Some(part_idx);
            info!("update_job: moved job {} to partition {}", job_id, part_name);
        }

        if desc.begin_time != 0 {
            let job = jobs.find_mut(job_id).expect("job present");
            if let Some(d) = &mut job.details {
                d.begin_time = desc.begin_time;
            }
        }
    }

    Ok(())
}

/// Preempt a job with the configured removal mechanism. Suspension is
/// the gang scheduler's business, not this function's.
pub fn job_preempt_remove(ctl: &Controller, job_id: JobId) {
    use crate::config::PreemptMode;
    let mode = ctl.config.read().preempt_mode;
    let rc = match mode {
        PreemptMode::Requeue => {
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            requeue::job_requeue(ctl, &cfg, &mut jobs, &mut nodes, 0, job_id)
        }
        PreemptMode::Cancel => {
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            job_signal(ctl, &cfg, &mut jobs, &mut nodes, job_id, SIGKILL, false, 0)
        }
        PreemptMode::Checkpoint => {
            checkpoint::job_checkpoint_vacate(ctl, job_id)
        }
        PreemptMode::Off | PreemptMode::SuspendGang => {
            error!("job_preempt_remove called with preempt mode {:?}", mode);
            return;
        }
    };
    match rc {
        Ok(()) => info!("preempted job {} removed ({:?})", job_id, mode),
        Err(_) => {
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            match job_signal(ctl, &cfg, &mut jobs, &mut nodes, job_id, SIGKILL, false, 0) {
                Ok(()) => info!("preempted job {} had to be killed", job_id),
                Err(err) => info!("preempted job {} kill failure: {}", job_id, err),
            }
        }
    }
}
