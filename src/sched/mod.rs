//! The scheduler core.
//!
//! Builds a priority-ordered queue of pending jobs, gates each on
//! dependencies, reservations, and policy, asks the selection oracle
//! for nodes, and commits allocations. Head-of-line blocking is
//! topology aware: when the best job of a partition cannot be placed
//! because nodes are busy, that partition — and every partition whose
//! node set overlaps it — is skipped for the rest of the tick so the
//! nodes stay free for the waiting job.

pub mod select;

use tracing::{debug, info};

use crate::agent::{mail_job_info, AgentRequest, AgentTarget, MAIL_JOB_BEGIN};
use crate::codec::msg::{BatchJobLaunchMsg, Message, WillRunMsg};
use crate::config::Config;
use crate::constants::{INFINITE, NO_VAL};
use crate::controller::Controller;
use crate::error::{SchedError, SchedResult};
use crate::job::table::JobTable;
use crate::job::{BaseState, DependKind, JobId, JobState, StateReason};
use crate::node::NodeRegistry;
use crate::partition::PartTable;
use crate::sched::select::SelectMode;
use crate::{lifecycle, now, srun};

/// One candidate in the priority queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub job_priority: u32,
    pub part_priority: u16,
}

/// Dependency evaluation outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepState {
    /// All entries lifted.
    Clear,
    /// Some entry still waiting.
    Wait,
    /// An AFTER_OK/AFTER_NOT_OK entry is permanently unsatisfiable.
    Failed,
}

/// Evaluate a job's dependency list without mutating anything. Entries
/// whose referenced job is gone count as lifted.
pub fn dependency_state(jobs: &JobTable, job_id: JobId) -> DepState {
    let Some(job) = jobs.find(job_id) else {
        return DepState::Clear;
    };
    let Some(details) = &job.details else {
        return DepState::Clear;
    };
    for dep in &details.depend_list {
        let Some(target) = jobs.find(dep.job_id) else {
            continue; // referenced job purged: lifted
        };
        match dep.kind {
            DependKind::After => {
                if target.is_pending() {
                    return DepState::Wait;
                }
            }
            DependKind::AfterAny => {
                if !target.is_finished() {
                    return DepState::Wait;
                }
            }
            DependKind::AfterOk => {
                if !target.is_finished() {
                    return DepState::Wait;
                }
                if target.state.base != BaseState::Complete {
                    return DepState::Failed;
                }
            }
            DependKind::AfterNotOk => {
                if !target.is_finished() {
                    return DepState::Wait;
                }
                if target.state.base == BaseState::Complete {
                    return DepState::Failed;
                }
            }
        }
    }
    DepState::Clear
}

/// Determine whether a pending job is free of external holds: its
/// begin time has arrived, its reservation (if any) is active, and its
/// dependencies are lifted. The first time a job turns independent its
/// begin time is stamped and an eligible record goes to accounting, so
/// measured queue wait includes dependency hold. A job with a
/// definitively violated dependency is cancelled here.
pub fn job_independent(ctl: &Controller, jobs: &mut JobTable, job_id: JobId) -> bool {
    let now_t = now();

    let (begin_time, resv_id) = match jobs.find(job_id) {
        Some(job) => (
            job.details.as_ref().map(|d| d.begin_time).unwrap_or(0),
            job.resv_id,
        ),
        None => return false,
    };
    if begin_time > now_t {
        let job = jobs.find_mut(job_id).expect("job present");
        job.state_reason = StateReason::WaitTime;
        job.state_desc = None;
        return false;
    }
    let resv_ok = resv_id == 0 || ctl.resv.lock().active_now(resv_id);
    if !resv_ok {
        let job = jobs.find_mut(job_id).expect("job present");
        job.state_reason = StateReason::Reservation;
        job.state_desc = None;
        return false;
    }

    match dependency_state(jobs, job_id) {
        DepState::Clear => {
            let mut send_acct_rec = false;
            {
                let job = jobs.find_mut(job_id).expect("job present");
                if job.state_reason == StateReason::Dependency {
                    job.state_reason = StateReason::None;
                    job.state_desc = None;
                }
                if let Some(details) = &mut job.details {
                    if details.begin_time == 0 {
                        details.begin_time = now_t;
                        send_acct_rec = true;
                    }
                }
                if job.state_reason == StateReason::WaitTime {
                    job.state_reason = StateReason::None;
                    job.state_desc = None;
                    send_acct_rec = true;
                }
            }
            if send_acct_rec {
                // record eligibility so queue-wait time is honest
                let cluster = ctl.cluster_name();
                let job = jobs.find(job_id).expect("job present");
                ctl.acct.job_start(&cluster, job);
            }
            true
        }
        DepState::Wait => {
            let job = jobs.find_mut(job_id).expect("job present");
            job.state_reason = StateReason::Dependency;
            job.state_desc = None;
            false
        }
        DepState::Failed => {
            info!("dependency for job {} can never be satisfied, cancelling", job_id);
            let job = jobs.find_mut(job_id).expect("job present");
            job.state = JobState::new(BaseState::Cancelled);
            job.state_reason = StateReason::Dependency;
            job.state_desc = None;
            job.start_time = now_t;
            job.end_time = now_t;
            job.exit_code = job.exit_code.max(1);
            lifecycle::job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
            false
        }
    }
}

/// True while any job is still completing recently enough to matter
/// for fragmentation avoidance.
pub fn job_is_completing(cfg: &Config, jobs: &JobTable) -> bool {
    let recent = now().saturating_sub(cfg.kill_wait + 2);
    jobs.iter()
        .any(|j| j.is_completing() && j.end_time >= recent)
}

/// Build the (unsorted) candidate queue of schedulable pending jobs.
pub fn build_job_queue(ctl: &Controller, jobs: &mut JobTable, parts: &PartTable) -> Vec<QueueEntry> {
    let mut queue = Vec::new();
    for job_id in jobs.ids() {
        let skip = {
            let Some(job) = jobs.find(job_id) else { continue };
            !job.is_pending() || job.is_completing() || job.priority == 0
        };
        if skip {
            continue;
        }
        if !job_independent(ctl, jobs, job_id) {
            continue;
        }
        let Some(job) = jobs.find(job_id) else { continue };
        let part_priority = job
            .part_idx
            .map(|i| parts.get(i).priority)
            .unwrap_or(0);
        queue.push(QueueEntry {
            job_id,
            job_priority: job.priority,
            part_priority,
        });
    }
    queue
}

/// Sort by (partition priority, job priority), both descending; the
/// sort is stable so insertion order breaks ties.
pub fn sort_job_queue(queue: &mut [QueueEntry]) {
    queue.sort_by(|a, b| {
        (b.part_priority, b.job_priority).cmp(&(a.part_priority, a.job_priority))
    });
}

/// Stamp begin times for pending jobs that just became independent,
/// so accounting sees eligibility promptly even between schedule runs.
pub fn set_job_elig_time(ctl: &Controller) {
    let _cfg = ctl.config.read();
    let mut jobs = ctl.jobs.write();
    let _nodes = ctl.nodes.write();
    let parts = ctl.parts.read();

    for job_id in jobs.ids() {
        let eligible = {
            let Some(job) = jobs.find(job_id) else { continue };
            let Some(part_idx) = job.part_idx else { continue };
            let part = parts.get(part_idx);
            job.is_pending()
                && part.state_up
                && job
                    .details
                    .as_ref()
                    .map(|d| d.begin_time == 0)
                    .unwrap_or(false)
                && (job.time_limit == INFINITE
                    || part.max_time == INFINITE
                    || job.time_limit <= part.max_time)
        };
        if eligible {
            job_independent(ctl, &mut jobs, job_id);
        }
    }
}

fn add_failed_partition(part_idx: usize, parts: &PartTable, failed: &mut Vec<usize>) {
    failed.push(part_idx);
    let failed_bitmap = parts.get(part_idx).node_bitmap.clone();
    for (idx, part) in parts.iter() {
        if failed.contains(&idx) {
            continue;
        }
        if part.node_bitmap.overlaps(&failed_bitmap) {
            failed.push(idx);
        }
    }
}

/// One scheduler pass: attempt to start every runnable pending job in
/// priority order. Returns the number of jobs started.
pub fn schedule(ctl: &Controller) -> usize {
    let cfg = ctl.config.read();
    let mut jobs = ctl.jobs.write();
    let mut nodes = ctl.nodes.write();
    let parts = ctl.parts.read();

    // avoid landing low-priority jobs on fragments freed by a job that
    // is about to finish
    if cfg.avoid_fragmentation && job_is_completing(&cfg, &jobs) {
        debug!("schedule: deferring, a job is still completing");
        return 0;
    }

    let mut queue = build_job_queue(ctl, &mut jobs, &parts);
    if queue.is_empty() {
        return 0;
    }
    sort_job_queue(&mut queue);
    debug!("schedule: {} candidates", queue.len());

    let mut failed_parts: Vec<usize> = Vec::new();
    let mut started = 0usize;

    for entry in queue {
        let job_id = entry.job_id;
        let (part_idx, assoc_id, batch) = {
            let Some(job) = jobs.find(job_id) else { continue };
            if job.priority == 0 {
                continue; // held since the queue was built
            }
            let Some(part_idx) = job.part_idx else { continue };
            (part_idx, job.assoc_id, job.batch_flag > 0)
        };
        if failed_parts.contains(&part_idx) {
            continue;
        }

        // a deleted association invalidates the job outright
        let assoc_valid = {
            let assoc = ctl.assoc.lock();
            assoc_id == 0 || assoc.get(assoc_id).is_some()
        };
        if !assoc_valid {
            info!("schedule: job {} has invalid account", job_id);
            let job = jobs.find_mut(job_id).expect("job present");
            job.state = JobState::new(BaseState::Failed);
            job.exit_code = 1;
            job.state_reason = StateReason::BankAccount;
            job.state_desc = None;
            let t = now();
            job.start_time = t;
            job.end_time = t;
            lifecycle::job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
            continue;
        }

        match select_nodes(ctl, &cfg, &mut jobs, &mut nodes, &parts, job_id, SelectMode::Run) {
            Ok(()) => {
                let job = jobs.find(job_id).expect("job present");
                info!(
                    "schedule: JobId={} NodeList={}",
                    job_id,
                    job.nodes.as_deref().unwrap_or("")
                );
                if job.mail_type & MAIL_JOB_BEGIN != 0 {
                    mail_job_info(ctl, job, MAIL_JOB_BEGIN);
                }
                if batch {
                    launch_job(ctl, &cfg, &jobs, &nodes, job_id);
                } else {
                    srun::srun_allocate(ctl, job);
                }
                started += 1;
            }
            Err(SchedError::NodesBusy) => {
                if cfg.avoid_fragmentation {
                    add_failed_partition(part_idx, &parts, &mut failed_parts);
                }
            }
            Err(SchedError::PartConfigUnavailable) | Err(SchedError::NodeConfigUnavailable) => {
                let job = jobs.find_mut(job_id).expect("job present");
                job.state_reason = StateReason::Resources;
                job.state_desc = None;
            }
            Err(err) => {
                info!("schedule: JobId={} non-runnable: {}", job_id, err);
                let job = jobs.find_mut(job_id).expect("job present");
                job.state = JobState::new(BaseState::Failed);
                job.exit_code = 1;
                job.state_reason = StateReason::BadConstraints;
                job.state_desc = None;
                let t = now();
                job.start_time = t;
                job.end_time = t;
                lifecycle::job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
            }
        }
    }

    if started > 0 {
        metrics::counter!("jobs_started_total").increment(started as u64);
    }
    started
}

/// Ask the selection oracle for nodes and, in `Run` mode, commit the
/// allocation: bitmaps flipped, counters bumped, licenses taken, and
/// the job moved to RUNNING (CONFIGURING until every node has
/// registered).
pub fn select_nodes(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    parts: &PartTable,
    job_id: JobId,
    mode: SelectMode,
) -> SchedResult<()> {
    let (part_idx, min_nodes, max_nodes, req_bitmap, avail, license_list) = {
        let job = jobs.find(job_id).ok_or(SchedError::InvalidJobId)?;
        let part_idx = job.part_idx.ok_or(SchedError::InvalidPartitionName)?;
        let part = parts.get(part_idx);
        if !part.state_up {
            return Err(SchedError::PartConfigUnavailable);
        }
        let details = job.details.as_ref().ok_or(SchedError::Disabled)?;

        let mut avail = part.node_bitmap.clone();
        avail.and(&nodes.avail_bitmap);
        if !details.feature_list.is_empty() {
            let wanted: Vec<&str> = details.feature_list.iter().map(|s| s.as_str()).collect();
            avail.and(&nodes.feature_bitmap(&wanted));
        }
        if let Some(exc) = &details.exc_node_bitmap {
            avail.and_not(exc);
        }

        // reservations: a job inside one is confined to it; everyone
        // else keeps clear of active reservations
        {
            let resv = ctl.resv.lock();
            if job.resv_id != 0 {
                if let Some(r) = resv.find_by_id(job.resv_id) {
                    avail.and(&r.node_bitmap);
                }
            } else {
                let t = now();
                for r in resv.iter().filter(|r| r.active_at(t)) {
                    avail.and_not(&r.node_bitmap);
                }
            }
        }

        let min_nodes = details.min_nodes.max(part.min_nodes);
        let part_max = if part.max_nodes == INFINITE { u32::MAX } else { part.max_nodes };
        let max_nodes = if details.max_nodes == 0 || details.max_nodes == NO_VAL {
            part_max
        } else {
            details.max_nodes.min(part_max)
        };
        if min_nodes > max_nodes {
            return Err(SchedError::PartConfigUnavailable);
        }

        (
            part_idx,
            min_nodes,
            max_nodes,
            details.req_node_bitmap.clone(),
            avail,
            job.license_list.clone(),
        )
    };

    if mode == SelectMode::Run && !ctl.licenses.lock().test(&license_list) {
        return Err(SchedError::NodesBusy);
    }

    let alloc = {
        let job = jobs.find(job_id).expect("job present");
        let details = job.details.as_ref().expect("details present");
        ctl.selector.select(
            job,
            details,
            nodes,
            &avail,
            req_bitmap.as_ref(),
            min_nodes,
            max_nodes,
            mode,
            cfg.fast_schedule,
        )?
    };

    if mode != SelectMode::Run {
        return Ok(());
    }

    // commit
    ctl.licenses.lock().acquire(&license_list);
    let exclusive = jobs.find(job_id).expect("job present").exclusive();
    nodes.allocate(&alloc.node_bitmap, exclusive);

    let configuring = alloc
        .node_bitmap
        .iter_set()
        .any(|i| nodes.get(i).state == crate::node::NodeState::Unknown
            || nodes.power_bitmap.test(i));
    let node_names = nodes.bitmap_to_names(&alloc.node_bitmap);
    let node_addrs: Vec<_> = alloc.node_bitmap.iter_set().map(|i| nodes.get(i).addr).collect();

    let t = now();
    let job = jobs.find_mut(job_id).expect("job present");
    job.part_idx = Some(part_idx);
    job.node_cnt = alloc.node_bitmap.count() as u32;
    job.node_bitmap = Some(alloc.node_bitmap);
    job.nodes = Some(node_names);
    job.node_addrs = node_addrs;
    job.cpus_per_node = alloc.cpus_per_node;
    job.cpu_count_reps = alloc.cpu_count_reps;
    job.total_procs = alloc.total_procs;
    job.select_blob = select::LinearJobInfo {
        node_cnt: job.node_cnt,
        total_procs: job.total_procs,
    }
    .to_blob();
    job.state = JobState::new(BaseState::Running);
    if configuring {
        job.state.set_configuring();
    }
    job.state_reason = StateReason::None;
    job.state_desc = None;
    job.start_time = t;
    job.time_last_active = t;
    job.end_time = job.compute_end_time(t);
    job.next_step_id = 1;
    Ok(())
}

/// Issue the batch launch RPC to the lead node of an allocation.
pub fn launch_job(
    ctl: &Controller,
    cfg: &Config,
    jobs: &JobTable,
    nodes: &NodeRegistry,
    job_id: JobId,
) {
    let Some(job) = jobs.find(job_id) else { return };
    let Some(bitmap) = &job.node_bitmap else { return };
    let Some(lead) = bitmap.first_set() else { return };
    let lead_node = nodes.get(lead);

    let script = crate::state::read_job_script(cfg, job_id).unwrap_or_default();
    let mut environment = crate::state::read_job_env(cfg, job_id).unwrap_or_default();
    environment.push(format!("SLURM_JOBID={}", job_id));
    environment.push(format!("SLURM_UID={}", job.user_id));

    let details = job.details.as_ref();
    let launch = BatchJobLaunchMsg {
        job_id,
        step_id: NO_VAL,
        uid: job.user_id,
        gid: job.group_id,
        nprocs: details.map(|d| d.num_tasks).unwrap_or(job.num_procs),
        cpus_per_node: job.cpus_per_node.clone(),
        cpu_count_reps: job.cpu_count_reps.clone(),
        nodes: job.nodes.clone(),
        script: Some(script),
        stderr: details.and_then(|d| d.stderr.clone()),
        stdin: details.and_then(|d| d.stdin.clone()),
        stdout: details.and_then(|d| d.stdout.clone()),
        work_dir: details.and_then(|d| d.work_dir.clone()),
        restart_dir: details.and_then(|d| d.restart_dir.clone()),
        argv: details.map(|d| d.argv.clone()).unwrap_or_default(),
        environment,
        overcommit: details.map(|d| d.overcommit).unwrap_or(0),
        open_mode: details.map(|d| d.open_mode).unwrap_or(0),
        acctg_freq: details.map(|d| d.acctg_freq).unwrap_or(0),
        cred: make_job_cred(job),
        select_blob: job.select_blob.clone(),
    };

    ctl.agent.queue_request(AgentRequest {
        msg: Message::RequestBatchJobLaunch(launch),
        targets: vec![AgentTarget {
            name: lead_node.name.clone(),
            addr: lead_node.addr,
        }],
        retry: false,
    });
}

/// Minimal launch credential: the node agent's verifier is an external
/// collaborator, the controller only promises stable pack ordering.
fn make_job_cred(job: &crate::job::JobRecord) -> Vec<u8> {
    let mut buf = crate::codec::PackBuf::new();
    buf.pack_u32(job.job_id);
    buf.pack_u32(NO_VAL);
    buf.pack_u32(job.user_id);
    buf.pack_str(job.nodes.as_deref());
    buf.pack_time(now());
    buf.into_vec()
}

/// Will-run probe: would the job start now on the given nodes?
/// Builds the response without mutating live resource state.
pub fn job_start_data(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &NodeRegistry,
    parts: &PartTable,
    job_id: JobId,
    req_nodes: Option<&str>,
) -> SchedResult<WillRunMsg> {
    let avail = {
        let job = jobs.find(job_id).ok_or(SchedError::InvalidJobId)?;
        job.part_idx.ok_or(SchedError::InvalidPartitionName)?;
        if job.details.is_none() || !job.is_pending() {
            return Err(SchedError::Disabled);
        }
        match req_nodes {
            None | Some("") => nodes.avail_bitmap.clone(),
            Some(spec) => {
                let mut bm = nodes.name_list_to_bitmap(spec)?;
                bm.and(&nodes.avail_bitmap);
                bm
            }
        }
    };

    let (min_nodes, max_nodes, req_bitmap) = {
        let job = jobs.find(job_id).expect("job present");
        let part = parts.get(job.part_idx.expect("partition resolved"));
        let details = job.details.as_ref().expect("details present");
        let min_nodes = details.min_nodes.max(part.min_nodes);
        let part_max = if part.max_nodes == INFINITE { u32::MAX } else { part.max_nodes };
        let max_nodes = if details.max_nodes == 0 || details.max_nodes == NO_VAL {
            part_max
        } else {
            details.max_nodes.min(part_max)
        };
        if let Some(req) = &details.req_node_bitmap {
            if !req.is_subset_of(&avail) {
                return Err(SchedError::PartConfigUnavailable);
            }
        }
        (min_nodes, max_nodes, details.req_node_bitmap.clone())
    };

    let alloc = {
        let job = jobs.find(job_id).expect("job present");
        let details = job.details.as_ref().expect("details present");
        ctl.selector.select(
            job,
            details,
            nodes,
            &avail,
            req_bitmap.as_ref(),
            min_nodes,
            max_nodes,
            SelectMode::WillRun,
            cfg.fast_schedule,
        )
    }
    .map_err(|_| SchedError::NodeConfigUnavailable)?;

    Ok(WillRunMsg {
        job_id,
        start_time: now(),
        node_list: Some(nodes.bitmap_to_names(&alloc.node_bitmap)),
    })
}

/// Is any other runnable pending job entitled to nodes before this
/// one? Used by immediate-allocation requests.
pub fn top_priority(jobs: &JobTable, parts: &PartTable, job_id: JobId) -> bool {
    let Some(job) = jobs.find(job_id) else { return false };
    if job.priority == 0 {
        return false; // held
    }
    let Some(part_idx) = job.part_idx else { return true };
    let part = parts.get(part_idx);

    for other in jobs.iter() {
        if other.job_id == job_id || !other.is_pending() || other.priority == 0 {
            continue;
        }
        if dependency_state(jobs, other.job_id) != DepState::Clear {
            continue;
        }
        // different reservations never compete
        if other.resv_name.is_some() != job.resv_name.is_some() {
            continue;
        }
        if let (Some(a), Some(b)) = (&other.resv_name, &job.resv_name) {
            if a == b && other.priority > job.priority {
                return false;
            }
            continue;
        }
        match other.part_idx {
            Some(op) if op == part_idx => {
                if other.priority > job.priority {
                    return false;
                }
            }
            Some(op) => {
                let opart = parts.get(op);
                if !opart.node_bitmap.overlaps(&part.node_bitmap) {
                    continue;
                }
                if opart.priority > part.priority
                    || (opart.priority == part.priority && other.priority > job.priority)
                {
                    return false;
                }
            }
            None => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_orders_by_partition_then_job_priority() {
        let mut q = vec![
            QueueEntry { job_id: 1, job_priority: 50, part_priority: 1 },
            QueueEntry { job_id: 2, job_priority: 10, part_priority: 5 },
            QueueEntry { job_id: 3, job_priority: 99, part_priority: 1 },
            QueueEntry { job_id: 4, job_priority: 20, part_priority: 5 },
        ];
        sort_job_queue(&mut q);
        let ids: Vec<u32> = q.iter().map(|e| e.job_id).collect();
        assert_eq!(ids, vec![4, 2, 3, 1]);
    }

    #[test]
    fn test_sort_is_stable_for_ties() {
        let mut q = vec![
            QueueEntry { job_id: 7, job_priority: 10, part_priority: 1 },
            QueueEntry { job_id: 8, job_priority: 10, part_priority: 1 },
        ];
        sort_job_queue(&mut q);
        assert_eq!(q[0].job_id, 7);
        assert_eq!(q[1].job_id, 8);
    }
}
