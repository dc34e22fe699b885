//! Persistent job state.
//!
//! A single versioned file carries the job id sequence and every job
//! record (header, details sub-block, step sub-blocks). Writes land in
//! `.new`, are fsync'd, then shuffled into place with the previous
//! canonical file preserved as `.old`. Recovery falls back to `.old`,
//! refuses a version mismatch outright, and tolerates an undecodable
//! tail by truncating at the last good record.
//!
//! The same directory holds per-batch-job input files:
//! `job.<id>/environment` (a u32 count followed by NUL-terminated
//! strings) and `job.<id>/script` (a NUL-terminated blob).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::{debug, error, info, warn};

use crate::codec::msg::{JobDescMsg, MultiCore};
use crate::codec::{PackBuf, UnpackBuf};
use crate::config::Config;
use crate::constants::{DETAILS_FLAG, JOB_STATE_VERSION, NO_VAL, STEP_FLAG};
use crate::controller::Controller;
use crate::error::{SchedError, SchedResult};
use crate::job::table::JobTable;
use crate::job::{
    parse_dependency, BaseState, JobDetails, JobId, JobRecord, JobState, StateReason, StepRecord,
};
use crate::node::NodeRegistry;
use crate::partition::PartTable;
use crate::{lifecycle, now};

static LAST_SAVE_MTIME: AtomicI64 = AtomicI64::new(0);

fn state_file(cfg: &Config) -> PathBuf {
    Path::new(&cfg.state_save_location).join("job_state")
}

fn job_dir(cfg: &Config, job_id: JobId) -> PathBuf {
    Path::new(&cfg.state_save_location).join(format!("job.{}", job_id))
}

/// Write `data` to `path` with staging, fsync, and an `.old` backup of
/// the previous contents.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let new_path = path.with_extension("new");
    let old_path = path.with_extension("old");
    {
        let mut f = std::fs::File::create(&new_path)?;
        use std::io::Write;
        f.write_all(data)?;
        f.sync_all()?;
    }
    if path.exists() {
        let _ = std::fs::rename(path, &old_path);
    }
    std::fs::rename(&new_path, path)
}

/// Serialize one job record.
pub fn pack_job_state(job: &JobRecord, buf: &mut PackBuf) {
    buf.pack_u32(job.assoc_id);
    buf.pack_u32(job.job_id);
    buf.pack_u32(job.user_id);
    buf.pack_u32(job.group_id);
    buf.pack_u32(job.time_limit);
    buf.pack_u32(job.priority);
    buf.pack_u32(job.alloc_sid);
    buf.pack_u32(job.num_procs);
    buf.pack_u32(job.total_procs);
    buf.pack_u32(job.exit_code);
    buf.pack_u32(job.db_index);
    buf.pack_u32(job.resv_id);
    buf.pack_u32(job.next_step_id);
    buf.pack_u32(job.node_cnt);
    buf.pack_u32(job.requid.unwrap_or(NO_VAL));

    buf.pack_time(job.start_time);
    buf.pack_time(job.end_time);
    buf.pack_time(job.suspend_time);
    buf.pack_u32(job.pre_sus_time);
    buf.pack_u32(job.tot_sus_time);
    buf.pack_time(job.ckpt_time);

    buf.pack_u16(job.direct_set_prio as u16);
    buf.pack_u16(job.state.to_word());
    buf.pack_u16(job.kill_on_node_fail);
    buf.pack_u16(job.batch_flag);
    buf.pack_u16(job.mail_type);
    buf.pack_u16(job.qos);
    buf.pack_u16(job.state_reason as u16);
    buf.pack_u16(job.restart_cnt);
    buf.pack_u16(job.ckpt_interval);
    buf.pack_u16(job.ckpt_disabled as u16);

    buf.pack_str(job.state_desc.as_deref());
    buf.pack_str(job.resp_host.as_deref());
    buf.pack_u16(job.alloc_resp_port);
    buf.pack_u16(job.other_port);

    if job.is_completing() {
        buf.pack_str(job.nodes_completing.as_deref());
    }
    buf.pack_str(job.nodes.as_deref());
    buf.pack_str(Some(&job.partition));
    buf.pack_str(job.name.as_deref());
    buf.pack_str(job.wckey.as_deref());
    buf.pack_str(job.alloc_node.as_deref());
    buf.pack_str(job.account.as_deref());
    buf.pack_str(job.comment.as_deref());
    buf.pack_str(job.network.as_deref());
    buf.pack_str(job.licenses.as_deref());
    buf.pack_str(job.mail_user.as_deref());
    buf.pack_str(job.resv_name.as_deref());

    buf.pack_u32_array(&job.cpus_per_node);
    buf.pack_u32_array(&job.cpu_count_reps);
    buf.pack_mem(&job.select_blob);
    buf.pack_mem(&job.check_blob);
    buf.pack_str_array(&job.spank_env);

    match &job.details {
        Some(details) => {
            buf.pack_u16(DETAILS_FLAG);
            pack_job_details(details, buf);
        }
        None => buf.pack_u16(0),
    }

    for step in &job.steps {
        buf.pack_u16(STEP_FLAG);
        pack_step_state(step, buf);
    }
    buf.pack_u16(0); // terminator
}

fn pack_job_details(details: &JobDetails, buf: &mut PackBuf) {
    buf.pack_u32(details.min_nodes);
    buf.pack_u32(details.max_nodes);
    buf.pack_u32(details.num_tasks);

    buf.pack_u16(details.acctg_freq);
    buf.pack_u16(details.contiguous);
    buf.pack_u16(details.cpus_per_task);
    buf.pack_u16(details.nice);
    buf.pack_u16(details.ntasks_per_node);
    buf.pack_u16(details.requeue);
    buf.pack_u16(details.shared);
    buf.pack_u16(details.task_dist);

    buf.pack_str(details.cpu_bind.as_deref());
    buf.pack_u16(details.cpu_bind_type);
    buf.pack_str(details.mem_bind.as_deref());
    buf.pack_u16(details.mem_bind_type);

    buf.pack_u8(details.open_mode);
    buf.pack_u8(details.overcommit);
    buf.pack_u8(details.prolog_running);

    buf.pack_u32(details.job_min_procs);
    buf.pack_u32(details.job_min_memory);
    buf.pack_u32(details.job_min_tmp_disk);
    buf.pack_time(details.begin_time);
    buf.pack_time(details.submit_time);

    buf.pack_str(details.req_nodes.as_deref());
    buf.pack_str(details.exc_nodes.as_deref());
    buf.pack_str(details.features.as_deref());
    buf.pack_str(details.dependency.as_deref());

    buf.pack_str(details.stderr.as_deref());
    buf.pack_str(details.stdin.as_deref());
    buf.pack_str(details.stdout.as_deref());
    buf.pack_str(details.work_dir.as_deref());
    buf.pack_str(details.ckpt_dir.as_deref());
    buf.pack_str(details.restart_dir.as_deref());

    details.multi_core.pack(buf);
    buf.pack_str_array(&details.argv);
    buf.pack_str_array(&details.env_sup);
}

fn pack_step_state(step: &StepRecord, buf: &mut PackBuf) {
    buf.pack_u32(step.step_id);
    buf.pack_u32(step.num_tasks);
    buf.pack_time(step.start_time);
    buf.pack_str(step.name.as_deref());
    buf.pack_str(step.node_list.as_deref());
    buf.pack_str(step.ckpt_dir.as_deref());
    buf.pack_str(step.io_host.as_deref());
    buf.pack_u16(step.io_port);
    buf.pack_u16(step.no_kill as u16);
    buf.pack_u16(step.batch_step as u16);
    buf.pack_mem(&step.cred);
    buf.pack_u32_array(&step.cpus_per_node);
}

/// Deserialize one job record, with the validity tests the original
/// applies (a `batch_flag` above 2 is corruption, not data).
pub fn unpack_job_state(buf: &mut UnpackBuf) -> SchedResult<JobRecord> {
    let assoc_id = buf.unpack_u32()?;
    let job_id = buf.unpack_u32()?;
    let mut job = JobRecord::new(job_id);
    job.assoc_id = assoc_id;
    job.user_id = buf.unpack_u32()?;
    job.group_id = buf.unpack_u32()?;
    job.time_limit = buf.unpack_u32()?;
    job.priority = buf.unpack_u32()?;
    job.alloc_sid = buf.unpack_u32()?;
    job.num_procs = buf.unpack_u32()?;
    job.total_procs = buf.unpack_u32()?;
    job.exit_code = buf.unpack_u32()?;
    job.db_index = buf.unpack_u32()?;
    job.resv_id = buf.unpack_u32()?;
    job.next_step_id = buf.unpack_u32()?;
    job.node_cnt = buf.unpack_u32()?;
    job.requid = match buf.unpack_u32()? {
        NO_VAL => None,
        uid => Some(uid),
    };

    job.start_time = buf.unpack_time()?;
    job.end_time = buf.unpack_time()?;
    job.suspend_time = buf.unpack_time()?;
    job.pre_sus_time = buf.unpack_u32()?;
    job.tot_sus_time = buf.unpack_u32()?;
    job.ckpt_time = buf.unpack_time()?;

    job.direct_set_prio = buf.unpack_u16()? != 0;
    job.state = JobState::from_word(buf.unpack_u16()?)?;
    job.kill_on_node_fail = buf.unpack_u16()?;
    job.batch_flag = buf.unpack_u16()?;
    job.mail_type = buf.unpack_u16()?;
    job.qos = buf.unpack_u16()?;
    job.state_reason = StateReason::from_word(buf.unpack_u16()?);
    job.restart_cnt = buf.unpack_u16()?;
    job.ckpt_interval = buf.unpack_u16()?;
    job.ckpt_disabled = buf.unpack_u16()? != 0;

    job.state_desc = buf.unpack_str()?;
    job.resp_host = buf.unpack_str()?;
    job.alloc_resp_port = buf.unpack_u16()?;
    job.other_port = buf.unpack_u16()?;

    if job.is_completing() {
        job.nodes_completing = buf.unpack_str()?;
    }
    job.nodes = buf.unpack_str()?;
    job.partition = buf.unpack_str()?.unwrap_or_default();
    job.name = buf.unpack_str()?;
    job.wckey = buf.unpack_str()?;
    job.alloc_node = buf.unpack_str()?;
    job.account = buf.unpack_str()?;
    job.comment = buf.unpack_str()?;
    job.network = buf.unpack_str()?;
    job.licenses = buf.unpack_str()?;
    job.mail_user = buf.unpack_str()?;
    job.resv_name = buf.unpack_str()?;

    job.cpus_per_node = buf.unpack_u32_array()?;
    job.cpu_count_reps = buf.unpack_u32_array()?;
    job.select_blob = buf.unpack_mem()?;
    job.check_blob = buf.unpack_mem()?;
    job.spank_env = buf.unpack_str_array()?;

    // validity tests
    if job.job_id == 0 || job.job_id >= crate::constants::MIN_NOALLOC_JOB_ID {
        return Err(SchedError::Decode(format!("invalid job id {}", job.job_id)));
    }
    if job.batch_flag > 2 {
        return Err(SchedError::Decode(format!(
            "invalid batch_flag {} for job {}",
            job.batch_flag, job.job_id
        )));
    }
    if job.kill_on_node_fail > 1 {
        return Err(SchedError::Decode(format!(
            "invalid kill_on_node_fail for job {}",
            job.job_id
        )));
    }
    if job.partition.is_empty() {
        return Err(SchedError::Decode(format!("no partition for job {}", job.job_id)));
    }

    let details_flag = buf.unpack_u16()?;
    if details_flag == DETAILS_FLAG {
        job.details = Some(unpack_job_details(job.job_id, buf)?);
    } else if details_flag != 0 {
        return Err(SchedError::Decode("bad details marker".into()));
    }

    loop {
        match buf.unpack_u16()? {
            0 => break,
            STEP_FLAG => job.steps.push(unpack_step_state(buf)?),
            other => {
                return Err(SchedError::Decode(format!("bad step marker {:#06x}", other)));
            }
        }
    }

    job.time_last_active = now();
    Ok(job)
}

fn unpack_job_details(job_id: JobId, buf: &mut UnpackBuf) -> SchedResult<JobDetails> {
    let mut d = JobDetails::default();
    d.min_nodes = buf.unpack_u32()?;
    d.max_nodes = buf.unpack_u32()?;
    d.num_tasks = buf.unpack_u32()?;

    d.acctg_freq = buf.unpack_u16()?;
    d.contiguous = buf.unpack_u16()?;
    d.cpus_per_task = buf.unpack_u16()?;
    d.nice = buf.unpack_u16()?;
    d.ntasks_per_node = buf.unpack_u16()?;
    d.requeue = buf.unpack_u16()?;
    d.shared = buf.unpack_u16()?;
    d.task_dist = buf.unpack_u16()?;

    d.cpu_bind = buf.unpack_str()?;
    d.cpu_bind_type = buf.unpack_u16()?;
    d.mem_bind = buf.unpack_str()?;
    d.mem_bind_type = buf.unpack_u16()?;

    d.open_mode = buf.unpack_u8()?;
    d.overcommit = buf.unpack_u8()?;
    d.prolog_running = buf.unpack_u8()?;

    d.job_min_procs = buf.unpack_u32()?;
    d.job_min_memory = buf.unpack_u32()?;
    d.job_min_tmp_disk = buf.unpack_u32()?;
    d.begin_time = buf.unpack_time()?;
    d.submit_time = buf.unpack_time()?;

    d.req_nodes = buf.unpack_str()?;
    d.exc_nodes = buf.unpack_str()?;
    d.features = buf.unpack_str()?;
    d.dependency = buf.unpack_str()?;

    d.stderr = buf.unpack_str()?;
    d.stdin = buf.unpack_str()?;
    d.stdout = buf.unpack_str()?;
    d.work_dir = buf.unpack_str()?;
    d.ckpt_dir = buf.unpack_str()?;
    d.restart_dir = buf.unpack_str()?;

    d.multi_core = MultiCore::unpack(buf)?;
    d.argv = buf.unpack_str_array()?;
    d.env_sup = buf.unpack_str_array()?;

    if d.contiguous > 1 || d.requeue > 1 || d.overcommit > 1 || d.prolog_running > 1 {
        return Err(SchedError::Decode(format!("invalid details for job {}", job_id)));
    }

    if let Some(dep) = d.dependency.clone() {
        d.depend_list = parse_dependency(&dep, job_id).unwrap_or_default();
    }
    if let Some(features) = d.features.clone() {
        d.feature_list = features
            .split(['&', ','])
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
    }
    Ok(d)
}

fn unpack_step_state(buf: &mut UnpackBuf) -> SchedResult<StepRecord> {
    Ok(StepRecord {
        step_id: buf.unpack_u32()?,
        num_tasks: buf.unpack_u32()?,
        start_time: buf.unpack_time()?,
        name: buf.unpack_str()?,
        node_list: buf.unpack_str()?,
        ckpt_dir: buf.unpack_str()?,
        io_host: buf.unpack_str()?,
        io_port: buf.unpack_u16()?,
        no_kill: buf.unpack_u16()? != 0,
        batch_step: buf.unpack_u16()? != 0,
        cred: buf.unpack_mem()?,
        cpus_per_node: buf.unpack_u32_array()?,
        node_bitmap: None,
    })
}

/// Periodic checkpoint of the whole job table.
pub fn dump_all_job_state(ctl: &Controller) -> SchedResult<()> {
    // refresh completing-node strings first (they need node state)
    {
        let _cfg = ctl.config.read();
        let mut jobs = ctl.jobs.write();
        let nodes = ctl.nodes.read();
        lifecycle::update_job_nodes_completing(&mut jobs, &nodes);
    }

    let cfg = ctl.config.read();
    let jobs = ctl.jobs.read();

    let mut buf = PackBuf::with_capacity(1024 * 1024);
    buf.pack_str(Some(JOB_STATE_VERSION));
    buf.pack_time(now());
    buf.pack_u32(jobs.sequence());
    debug!("writing job id {} to job_state header", jobs.sequence());

    for job in jobs.iter() {
        pack_job_state(job, &mut buf);
    }
    drop(jobs);

    let path = state_file(&cfg);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    // a modification time that moved backwards means someone swapped
    // the state directory out from under us
    if let Ok(meta) = std::fs::metadata(&path) {
        if let Ok(mtime) = meta.modified() {
            let mtime = mtime
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let last = LAST_SAVE_MTIME.load(Ordering::Relaxed);
            if last != 0 && mtime + 10 < last {
                error!(
                    "the modification time of {} moved backwards by {}s; \
                     suspect clock change or wrong filesystem mounted",
                    path.display(),
                    last - mtime
                );
            }
        }
    }
    LAST_SAVE_MTIME.store(now() as i64, Ordering::Relaxed);

    write_file_atomic(&path, buf.as_slice())
        .map_err(|e| SchedError::WritingToFile(format!("{}: {}", path.display(), e)))
}

fn read_state_file(cfg: &Config) -> SchedResult<Vec<u8>> {
    let path = state_file(cfg);
    match std::fs::read(&path) {
        Ok(data) if data.len() >= 10 => Ok(data),
        other => {
            if let Ok(short) = other {
                error!("job state file too small ({} bytes)", short.len());
            }
            warn!("trying backup state save file, jobs may be lost");
            std::fs::read(path.with_extension("old"))
                .map_err(|e| SchedError::Internal(format!("no job state to recover: {}", e)))
        }
    }
}

/// Recover the job table from the state file. Returns the number of
/// jobs recovered. A version mismatch refuses the whole file; a
/// corrupt tail truncates recovery at the last good record.
pub fn load_all_job_state(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
) -> SchedResult<usize> {
    let data = read_state_file(cfg)?;
    let mut buf = UnpackBuf::new(&data);

    let ver = buf.unpack_str()?;
    if ver.as_deref() != Some(JOB_STATE_VERSION) {
        error!("cannot recover job state, incompatible version {:?}", ver);
        return Err(SchedError::VersionMismatch {
            got: 0,
            want: crate::constants::PROTOCOL_VERSION,
        });
    }
    let _save_time = buf.unpack_time()?;
    let saved_sequence = buf.unpack_u32()?;

    let mut count = 0usize;
    while buf.remaining() > 0 {
        match unpack_job_state(&mut buf) {
            Ok(job) => {
                let job_id = job.job_id;
                let finished = job.is_finished();
                let assoc_id = job.assoc_id;
                let priority = job.priority;
                if let Err(err) = jobs.insert(job) {
                    warn!("dropping recovered job {}: {}", job_id, err);
                    continue;
                }
                jobs.observe_priority(priority);
                if !finished {
                    ctl.assoc.lock().add_job_submit(assoc_id);
                }
                count += 1;
            }
            Err(err) => {
                error!("incomplete job state record: {}", err);
                info!("recovered information about {} jobs", count);
                jobs.restore_sequence(saved_sequence);
                return Ok(count);
            }
        }
    }
    jobs.restore_sequence(saved_sequence);
    info!("recovered information about {} jobs", count);
    Ok(count)
}

/// Read only the job id sequence from the state file header.
pub fn load_last_job_id(cfg: &Config) -> SchedResult<u32> {
    let data = read_state_file(cfg)?;
    let mut buf = UnpackBuf::new(&data);
    let ver = buf.unpack_str()?;
    if ver.as_deref() != Some(JOB_STATE_VERSION) {
        return Err(SchedError::VersionMismatch {
            got: 0,
            want: crate::constants::PROTOCOL_VERSION,
        });
    }
    let _ = buf.unpack_time()?;
    buf.unpack_u32()
}

/// Re-establish bitmaps and references after recovery: partition
/// pointers, node bitmaps (preferring the completing list), detail
/// bitmaps, node counters, and license claims. Jobs that cannot be
/// reconciled go NODE_FAIL.
pub fn reset_job_bitmaps(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    parts: &PartTable,
) {
    let now_t = now();
    for job_id in jobs.ids() {
        let mut job_fail = false;

        // partition pointer
        let part_idx = {
            let Some(job) = jobs.find(job_id) else { continue };
            match parts.find(&job.partition) {
                Some(idx) => Some(idx),
                None => {
                    error!("invalid partition ({}) for job {}", job.partition, job_id);
                    job_fail = true;
                    None
                }
            }
        };
        {
            let job = jobs.find_mut(job_id).expect("job present");
            job.part_idx = part_idx;
        }

        // node bitmap from the saved strings
        let bitmap = {
            let Some(job) = jobs.find(job_id) else { continue };
            let source = if job.is_completing() && job.nodes_completing.is_some() {
                job.nodes_completing.clone()
            } else {
                job.nodes.clone()
            };
            match source {
                Some(names) if !names.is_empty() => match nodes.name_list_to_bitmap(&names) {
                    Ok(bm) => Some(bm),
                    Err(_) => {
                        error!("invalid nodes ({}) for job {}", names, job_id);
                        job_fail = true;
                        None
                    }
                },
                _ => None,
            }
        };
        {
            let job = jobs.find_mut(job_id).expect("job present");
            job.node_bitmap = bitmap.clone();
            if let Some(bm) = &bitmap {
                job.node_cnt = bm.count() as u32;
                job.node_addrs = bm.iter_set().map(|i| nodes.get(i).addr).collect();
            }
        }

        // detail bitmaps and step bitmaps
        {
            let (req, exc) = {
                let job = jobs.find(job_id).expect("job present");
                match &job.details {
                    Some(d) => (d.req_nodes.clone(), d.exc_nodes.clone()),
                    None => (None, None),
                }
            };
            let req_bm = match req {
                Some(spec) => match nodes.name_list_to_bitmap(&spec) {
                    Ok(bm) => Some(bm),
                    Err(_) => {
                        error!("invalid req_nodes ({}) for job {}", spec, job_id);
                        job_fail = true;
                        None
                    }
                },
                None => None,
            };
            let exc_bm = exc.and_then(|spec| nodes.name_list_to_bitmap(&spec).ok());
            let job = jobs.find_mut(job_id).expect("job present");
            if let Some(d) = &mut job.details {
                d.req_node_bitmap = req_bm;
                d.exc_node_bitmap = exc_bm;
                d.req_node_layout = None; // regenerated at next start
            }
            let mut dead_steps = Vec::new();
            for step in &mut job.steps {
                match &step.node_list {
                    Some(list) => match nodes.name_list_to_bitmap(list) {
                        Ok(bm) => step.node_bitmap = Some(bm),
                        Err(_) => dead_steps.push(step.step_id),
                    },
                    None if !step.batch_step => dead_steps.push(step.step_id),
                    None => {}
                }
            }
            for sid in dead_steps {
                error!("missing node list for step {}.{}", job_id, sid);
                job.delete_step(sid);
            }
        }

        if job_fail {
            let job = jobs.find_mut(job_id).expect("job present");
            if job.is_pending() {
                job.start_time = now_t;
                job.end_time = now_t;
                job.state = JobState::new(BaseState::NodeFail);
            } else if job.is_running() {
                job.end_time = now_t;
                job.state = JobState::new(BaseState::NodeFail);
                job.state.set_completing();
            } else if job.is_suspended() {
                job.end_time = job.suspend_time;
                job.state = JobState::new(BaseState::NodeFail);
                job.state.set_completing();
                job.tot_sus_time += now_t.saturating_sub(job.suspend_time);
                ctl.acct.job_suspend(job);
            }
            job.exit_code = job.exit_code.max(1);
            job.state_reason = StateReason::DownNode;
            job.state_desc = None;
            lifecycle::job_completion_logger(ctl, jobs.find_mut(job_id).expect("job present"));
            continue;
        }

        // rebuild node counters and license claims for live work
        {
            let (state, bitmap, exclusive, license_list) = {
                let job = jobs.find(job_id).expect("job present");
                (
                    job.state,
                    job.node_bitmap.clone(),
                    job.exclusive(),
                    job.license_list.clone(),
                )
            };
            if let Some(bm) = bitmap {
                if state.is_completing() {
                    nodes.mark_completing_only(&bm);
                } else if state.is_running() {
                    nodes.allocate(&bm, exclusive);
                    ctl.licenses.lock().acquire(&license_list);
                }
            }
        }

        // licenses string was saved; the parsed list was not
        {
            let spec = jobs.find(job_id).expect("job present").licenses.clone();
            if let Ok(list) = crate::license::parse_spec(spec.as_deref()) {
                jobs.find_mut(job_id).expect("job present").license_list = list;
            }
        }

        // re-emit accounting records the backend may have missed
        {
            let cluster = ctl.cluster_name();
            let job = jobs.find_mut(job_id).expect("job present");
            if job.assoc_id != 0 && job.db_index == 0 && job.nodes.is_some() {
                debug!("restarting accounting records for job {}", job_id);
                job.db_index = ctl.acct.job_start(&cluster, job);
                if job.is_suspended() {
                    ctl.acct.job_suspend(job);
                }
            }
            if job.is_finished() {
                ctl.acct.job_complete(job);
            }
        }
    }
    let _ = cfg;
}

/// Persist a batch job's inputs: environment and script.
pub fn write_job_desc_files(cfg: &Config, job_id: JobId, desc: &JobDescMsg) -> std::io::Result<()> {
    let dir = job_dir(cfg, job_id);
    std::fs::create_dir_all(&dir)?;

    let mut env_data = Vec::new();
    env_data.extend_from_slice(&(desc.environment.len() as u32).to_be_bytes());
    for var in &desc.environment {
        env_data.extend_from_slice(var.as_bytes());
        env_data.push(0);
    }
    std::fs::write(dir.join("environment"), env_data)?;

    let mut script = desc.script.clone().unwrap_or_default().into_bytes();
    script.push(0);
    std::fs::write(dir.join("script"), script)
}

/// Load a batch job's script, without the trailing NUL.
pub fn read_job_script(cfg: &Config, job_id: JobId) -> SchedResult<String> {
    let mut data = std::fs::read(job_dir(cfg, job_id).join("script"))
        .map_err(|e| SchedError::Internal(format!("script for job {}: {}", job_id, e)))?;
    if data.last() == Some(&0) {
        data.pop();
    }
    String::from_utf8(data).map_err(|_| SchedError::Decode("script not UTF-8".into()))
}

/// Load a batch job's environment strings.
pub fn read_job_env(cfg: &Config, job_id: JobId) -> SchedResult<Vec<String>> {
    let data = std::fs::read(job_dir(cfg, job_id).join("environment"))
        .map_err(|e| SchedError::Internal(format!("environment for job {}: {}", job_id, e)))?;
    if data.len() < 4 {
        return Err(SchedError::Decode("environment file truncated".into()));
    }
    let count = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let mut out = Vec::with_capacity(count);
    let mut start = 4usize;
    for _ in 0..count {
        let end = data[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .ok_or_else(|| SchedError::Decode("environment string unterminated".into()))?;
        out.push(
            String::from_utf8(data[start..end].to_vec())
                .map_err(|_| SchedError::Decode("environment not UTF-8".into()))?,
        );
        start = end + 1;
    }
    Ok(out)
}

/// Remove a job's on-disk description files.
pub fn delete_job_desc_files(cfg: &Config, job_id: JobId) {
    let dir = job_dir(cfg, job_id);
    let _ = std::fs::remove_file(dir.join("environment"));
    let _ = std::fs::remove_file(dir.join("script"));
    let _ = std::fs::remove_dir(dir);
}

/// Reconcile on-disk `job.<id>` directories with the recovered table:
/// delete orphans, fail batch jobs whose inputs vanished.
pub fn sync_job_files(cfg: &Config, jobs: &mut JobTable) {
    let state_dir = Path::new(&cfg.state_save_location);
    let mut on_disk: Vec<JobId> = Vec::new();
    if let Ok(entries) = std::fs::read_dir(state_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id_str) = name.strip_prefix("job.") {
                if let Ok(id) = id_str.parse::<u32>() {
                    on_disk.push(id);
                }
            }
        }
    }

    for job_id in on_disk {
        let live_batch = jobs
            .find(job_id)
            .map(|j| j.batch_flag > 0 && !j.is_finished())
            .unwrap_or(false);
        if !live_batch {
            debug!("removing orphaned job files for {}", job_id);
            delete_job_desc_files(cfg, job_id);
        }
    }

    for job_id in jobs.ids() {
        let needs_files = {
            let Some(job) = jobs.find(job_id) else { continue };
            job.batch_flag > 0 && !job.is_finished() && !job.is_completing()
        };
        if needs_files && read_job_script(cfg, job_id).is_err() {
            error!("batch job {} lost its script file, failing it", job_id);
            let job = jobs.find_mut(job_id).expect("job present");
            job.state = JobState::new(BaseState::Failed);
            job.exit_code = job.exit_code.max(1);
            job.state_reason = StateReason::System;
            let t = now();
            if job.start_time == 0 {
                job.start_time = t;
            }
            job.end_time = t;
        }
    }
}
