//! Checkpoint and restart.
//!
//! For a batch job, CREATE/VACATE persist the job's own record into a
//! per-job checkpoint file: a versioned magic, the image directory,
//! the current node list, and a fully packed submit descriptor
//! reconstructed from the live record. RESTART re-submits from that
//! descriptor, forcing the original job id and priming `restart_dir`
//! so the node agent resumes from the image.

use tracing::{error, info};

use crate::codec::msg::{
    CheckpointMsg, CheckpointRespMsg, JobDescMsg, CHECK_ABLE, CHECK_CREATE, CHECK_DISABLE,
    CHECK_ENABLE, CHECK_ERROR, CHECK_RESTART, CHECK_VACATE,
};
use crate::codec::{PackBuf, UnpackBuf};
use crate::config::Config;
use crate::constants::{BATCH_SCRIPT_STEP, JOB_CKPT_VERSION, NO_VAL};
use crate::controller::Controller;
use crate::error::{SchedError, SchedResult};
use crate::job::table::JobTable;
use crate::job::{JobId, JobRecord};
use crate::lifecycle::{job_signal, SIGKILL};
use crate::node::NodeRegistry;
use crate::now;
use crate::partition::PartTable;

fn ckpt_file_path(cfg: &Config, job_id: JobId) -> std::path::PathBuf {
    std::path::Path::new(&cfg.job_ckpt_dir).join(format!("{}.ckpt", job_id))
}

/// Rebuild a submit descriptor from a live record, as the restart path
/// will need it. The allocating client is not expected to survive a
/// restart, so its response ports are not carried over.
fn copy_job_record_to_desc(cfg: &Config, job: &JobRecord) -> JobDescMsg {
    let details = job.details.as_ref();
    let mut desc = JobDescMsg {
        job_id: job.job_id,
        user_id: job.user_id,
        group_id: job.group_id,
        name: job.name.clone(),
        account: job.account.clone(),
        wckey: job.wckey.clone(),
        comment: job.comment.clone(),
        network: job.network.clone(),
        licenses: job.licenses.clone(),
        partition: Some(job.partition.clone()),
        reservation: job.resv_name.clone(),
        priority: job.priority,
        time_limit: job.time_limit,
        num_procs: job.num_procs,
        kill_on_node_fail: job.kill_on_node_fail,
        mail_type: job.mail_type,
        mail_user: job.mail_user.clone(),
        ckpt_interval: job.ckpt_interval,
        alloc_node: job.alloc_node.clone(),
        spank_env: job.spank_env.clone(),
        ..JobDescMsg::default()
    };
    if let Some(d) = details {
        desc.dependency = d.dependency.clone();
        desc.nice = d.nice;
        desc.min_nodes = d.min_nodes;
        desc.max_nodes = if d.max_nodes == 0 { NO_VAL } else { d.max_nodes };
        desc.req_nodes = d.req_nodes.clone();
        desc.exc_nodes = d.exc_nodes.clone();
        desc.features = d.features.clone();
        desc.shared = d.shared;
        desc.contiguous = d.contiguous;
        desc.requeue = d.requeue;
        desc.overcommit = d.overcommit;
        desc.open_mode = d.open_mode;
        desc.acctg_freq = d.acctg_freq;
        desc.begin_time = d.begin_time;
        desc.argv = d.argv.clone();
        desc.stderr = d.stderr.clone();
        desc.stdin = d.stdin.clone();
        desc.stdout = d.stdout.clone();
        desc.work_dir = d.work_dir.clone();
        desc.ckpt_dir = d.ckpt_dir.clone();
        desc.cpu_bind = d.cpu_bind.clone();
        desc.cpu_bind_type = d.cpu_bind_type;
        desc.mem_bind = d.mem_bind.clone();
        desc.mem_bind_type = d.mem_bind_type;
        desc.task_dist = d.task_dist;
        desc.cpus_per_task = d.cpus_per_task;
        desc.ntasks_per_node = d.ntasks_per_node;
        desc.num_tasks = d.num_tasks;
        desc.job_min_procs = d.job_min_procs;
        desc.job_min_memory = d.job_min_memory;
        desc.job_min_tmp_disk = d.job_min_tmp_disk;
        desc.multi_core = d.multi_core.clone();
    }
    desc.script = crate::state::read_job_script(cfg, job.job_id).ok();
    desc.environment = crate::state::read_job_env(cfg, job.job_id).unwrap_or_default();
    desc
}

/// Persist the checkpoint record file for a batch job.
fn checkpoint_job_record(cfg: &Config, job: &JobRecord, image_dir: &str) -> SchedResult<()> {
    let mut buf = PackBuf::with_capacity(4096);
    buf.pack_str(Some(JOB_CKPT_VERSION));
    buf.pack_str(Some(image_dir));
    buf.pack_str(job.nodes.as_deref());
    buf.pack_u16(job.restart_cnt);
    copy_job_record_to_desc(cfg, job).pack(&mut buf);

    let path = ckpt_file_path(cfg, job.job_id);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    crate::state::write_file_atomic(&path, buf.as_slice())
        .map_err(|e| SchedError::WritingToFile(e.to_string()))
}

/// Perform a checkpoint operation on a job.
pub fn job_checkpoint(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    ckpt: &CheckpointMsg,
    uid: u32,
) -> SchedResult<CheckpointRespMsg> {
    let job_id = ckpt.job_id;
    let (user_id, state, batch_flag, ckpt_disabled, ckpt_time, ckpt_dir) = {
        let job = jobs.find(job_id).ok_or(SchedError::InvalidJobId)?;
        (
            job.user_id,
            job.state,
            job.batch_flag,
            job.ckpt_disabled,
            job.ckpt_time,
            job.details.as_ref().and_then(|d| d.ckpt_dir.clone()),
        )
    };

    if user_id != uid && !cfg.is_super_user(uid) {
        return Err(SchedError::AccessDenied);
    }
    if state.is_pending() {
        return Err(SchedError::JobPending);
    }
    if state.is_suspended() {
        // the job can't get cycles to write an image while suspended
        return Err(SchedError::Disabled);
    }
    if !state.is_running() {
        return Err(SchedError::AlreadyDone);
    }

    match ckpt.op {
        CHECK_ABLE => Ok(CheckpointRespMsg {
            event_time: if ckpt_disabled { 0 } else { ckpt_time },
            error_code: if ckpt_disabled { SchedError::Disabled.code() } else { 0 },
            error_msg: None,
        }),
        CHECK_ERROR => Ok(CheckpointRespMsg {
            event_time: ckpt_time,
            error_code: 0,
            error_msg: None,
        }),
        CHECK_DISABLE => {
            jobs.find_mut(job_id).expect("job present").ckpt_disabled = true;
            Ok(CheckpointRespMsg::default())
        }
        CHECK_ENABLE => {
            jobs.find_mut(job_id).expect("job present").ckpt_disabled = false;
            Ok(CheckpointRespMsg::default())
        }
        CHECK_CREATE | CHECK_VACATE => {
            if ckpt_disabled {
                return Err(SchedError::Disabled);
            }
            if batch_flag == 0 {
                return Err(SchedError::BatchOnly);
            }
            let image_dir = match ckpt.image_dir.clone().or(ckpt_dir) {
                Some(d) => d,
                None => return Err(SchedError::Disabled),
            };
            {
                let job = jobs.find(job_id).expect("job present");
                checkpoint_job_record(cfg, job, &image_dir)?;
            }
            {
                let job = jobs.find_mut(job_id).expect("job present");
                job.ckpt_time = now();
            }
            info!(
                "checkpoint {} of job {} complete",
                if ckpt.op == CHECK_VACATE { "vacate" } else { "create" },
                job_id
            );
            if ckpt.op == CHECK_VACATE {
                job_signal(ctl, cfg, jobs, nodes, job_id, SIGKILL, false, uid)?;
            }
            Ok(CheckpointRespMsg {
                event_time: now(),
                error_code: 0,
                error_msg: None,
            })
        }
        CHECK_RESTART => Err(SchedError::Disabled), // separate entry point
        _ => Err(SchedError::Disabled),
    }
}

/// Vacate helper for the preemption path.
pub fn job_checkpoint_vacate(ctl: &Controller, job_id: JobId) -> SchedResult<()> {
    let cfg = ctl.config.read();
    let mut jobs = ctl.jobs.write();
    let mut nodes = ctl.nodes.write();
    let msg = CheckpointMsg {
        op: CHECK_VACATE,
        data: 0,
        job_id,
        step_id: BATCH_SCRIPT_STEP,
        image_dir: None,
    };
    job_checkpoint(ctl, &cfg, &mut jobs, &mut nodes, &msg, 0).map(|_| ())
}

/// Restart a batch job from its checkpoint record. Allowed for the
/// original owner or a super-user; partition-access checks are
/// deliberately relaxed so recovery is always possible.
pub fn job_restart(
    ctl: &Controller,
    cfg: &Config,
    jobs: &mut JobTable,
    nodes: &mut NodeRegistry,
    parts: &PartTable,
    ckpt: &CheckpointMsg,
    uid: u32,
) -> SchedResult<JobId> {
    if ckpt.step_id != BATCH_SCRIPT_STEP {
        return Err(SchedError::NotSupported);
    }
    if let Some(job) = jobs.find(ckpt.job_id) {
        if !job.is_finished() {
            return Err(SchedError::Disabled);
        }
    }

    let data = std::fs::read(ckpt_file_path(cfg, ckpt.job_id)).map_err(|e| {
        info!("no checkpoint record for job {}: {}", ckpt.job_id, e);
        SchedError::InvalidJobId
    })?;
    let mut buf = UnpackBuf::new(&data);

    let ver = buf.unpack_str()?;
    if ver.as_deref() != Some(JOB_CKPT_VERSION) {
        error!("cannot restart job {}: incompatible checkpoint version", ckpt.job_id);
        return Err(SchedError::VersionMismatch {
            got: 0,
            want: crate::constants::PROTOCOL_VERSION,
        });
    }
    let mut image_dir = buf.unpack_str()?.unwrap_or_default();
    let alloc_nodes = buf.unpack_str()?;
    let restart_cnt = buf.unpack_u16()?;
    let mut desc = JobDescMsg::unpack(&mut buf)?;

    if desc.job_id != ckpt.job_id {
        error!(
            "checkpoint record carries job id {} but {} was requested",
            desc.job_id, ckpt.job_id
        );
        return Err(SchedError::InvalidJobId);
    }
    if desc.user_id != uid && !cfg.is_super_user(uid) {
        error!(
            "security violation: uid {} cannot restart job {} of uid {}",
            uid, ckpt.job_id, desc.user_id
        );
        return Err(SchedError::AccessDenied);
    }

    if ckpt.data == 1 {
        // stick to the original nodes
        desc.req_nodes = alloc_nodes;
    }
    desc.open_mode = 1; // append to prior output
    desc.priority = NO_VAL;

    // an existing terminal record would collide with the forced id
    jobs.purge(ckpt.job_id);

    // submit_uid 0 forces the original job id and relaxes partition
    // access checks for recovery
    let outcome = crate::lifecycle::job_allocate(
        ctl, cfg, jobs, nodes, parts, &mut desc, 0, false, false, false,
    )?;

    if let Some(dir) = ckpt.image_dir.clone() {
        image_dir = dir;
    }
    let job = jobs.find_mut(outcome.job_id).expect("job just created");
    job.restart_cnt = restart_cnt + 1;
    if let Some(details) = &mut job.details {
        details.restart_dir = Some(format!("{}/{}", image_dir, ckpt.job_id));
    }
    info!("restarted job {} from checkpoint", outcome.job_id);
    Ok(outcome.job_id)
}
