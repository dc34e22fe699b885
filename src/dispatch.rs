//! The client-facing RPC dispatcher.
//!
//! One short-lived task per accepted connection: read a frame, map the
//! credential to a uid, take the locks the operation declares, call
//! into the scheduler or lifecycle controller, and send the encoded
//! reply. A malformed frame increments a counter and closes the
//! connection without touching any state. Reply-send failures are
//! logged but never roll back a completed transition.

use std::net::SocketAddrV4;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::codec::forward::ForwardSpec;
use crate::codec::header::{decode_frame_with_cred, encode_frame};
use crate::codec::msg::{
    BuildInfoMsg, JobInfoMsg, JobInfoView, Message, NodeInfoMsg, NodeInfoView, PartInfoMsg,
    PartInfoView, ResourceAllocationMsg, StepInfoMsg, StepInfoView, StepLayoutMsg,
    SubmitResponseMsg, WillRunMsg, CHECK_RESTART,
};
use crate::codec::{PackBuf, UnpackBuf};
use crate::config::{PreemptMode, PRIVATE_JOBS};
use crate::constants::NO_VAL;
use crate::controller::Controller;
use crate::error::{SchedError, SchedResult};
use crate::job::JobRecord;
use crate::transport::{read_frame, write_frame};
use crate::{lifecycle, now, sched, state};

/// Credential verification seam; the real verifier is an external
/// collaborator.
pub trait CredVerifier: Send + Sync {
    /// Map a credential blob to (uid, gid).
    fn verify(&self, cred: &[u8]) -> SchedResult<(u32, u32)>;
}

/// Trusting verifier: the credential is a packed (uid, gid) pair; an
/// empty credential is the controller or a node agent (root).
pub struct TrustingVerifier;

impl CredVerifier for TrustingVerifier {
    fn verify(&self, cred: &[u8]) -> SchedResult<(u32, u32)> {
        if cred.is_empty() {
            return Ok((0, 0));
        }
        let mut buf = UnpackBuf::new(cred);
        let uid = buf
            .unpack_u32()
            .map_err(|_| SchedError::InvalidJobCredential)?;
        let gid = buf
            .unpack_u32()
            .map_err(|_| SchedError::InvalidJobCredential)?;
        Ok((uid, gid))
    }
}

/// Pack a (uid, gid) credential the way `TrustingVerifier` expects.
pub fn pack_cred(uid: u32, gid: u32) -> Vec<u8> {
    let mut buf = PackBuf::new();
    buf.pack_u32(uid);
    buf.pack_u32(gid);
    buf.into_vec()
}

/// Accept loop. Returns only at shutdown.
pub async fn serve(ctl: Arc<Controller>) -> SchedResult<()> {
    let addr = ctl.config.read().listen_addr.clone();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| SchedError::Comm(format!("bind {}: {}", addr, e)))?;
    info!("listening on {}", addr);

    loop {
        if ctl.shutting_down() {
            return Ok(());
        }
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        let ctl = ctl.clone();
        let deadline = std::time::Duration::from_secs(
            ctl.config.read().client_deadline_secs() as u64,
        );
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, handle_connection(ctl, stream)).await {
                Ok(Err(err)) => debug!("connection from {} closed: {}", peer, err),
                Err(_) => warn!("connection from {} exceeded reply deadline", peer),
                Ok(Ok(())) => {}
            }
        });
    }
}

async fn handle_connection(ctl: Arc<Controller>, mut stream: TcpStream) -> SchedResult<()> {
    let frame = read_frame(&mut stream).await?;
    let (header, cred, msg) = match decode_frame_with_cred(&frame) {
        Ok(parts) => parts,
        Err(err) => {
            // B5: count it, close the connection, change nothing
            metrics::counter!("rpc_decode_errors_total").increment(1);
            return Err(err);
        }
    };

    let uid = match TrustingVerifier.verify(&cred) {
        Ok((uid, _gid)) => uid,
        Err(err) => {
            let reply = Message::rc(err.code());
            send_reply(&mut stream, &reply, header.orig_addr).await;
            return Err(SchedError::UserIdMissing);
        }
    };

    metrics::counter!("rpc_requests_total").increment(1);
    debug!("rpc {:?} from uid {}", header.msg_type, uid);

    let reply = dispatch(&ctl, msg, uid);
    send_reply(&mut stream, &reply, header.orig_addr).await;
    Ok(())
}

async fn send_reply(stream: &mut TcpStream, reply: &Message, orig: SocketAddrV4) {
    let frame = encode_frame(reply, ForwardSpec::default(), orig);
    if let Err(err) = write_frame(stream, &frame).await {
        // the client may have gone away mid-reply; state stands
        warn!("reply send failed: {}", err);
    }
}

fn rc_of(result: SchedResult<()>) -> Message {
    match result {
        Ok(()) => Message::rc(0),
        Err(err) => Message::rc(err.code()),
    }
}

/// Route one decoded message. Lock subsets per operation follow the
/// config → job → node → partition order throughout.
pub fn dispatch(ctl: &Arc<Controller>, msg: Message, uid: u32) -> Message {
    match msg {
        Message::RequestSubmitBatchJob(mut desc) => {
            desc.user_id = if uid != 0 { uid } else { desc.user_id };
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            let parts = ctl.parts.read();
            let immediate = desc.immediate != 0;
            match lifecycle::job_allocate(
                ctl, &cfg, &mut jobs, &mut nodes, &parts, &mut desc, uid, immediate, false, false,
            ) {
                Ok(outcome) => {
                    drop((cfg, jobs, nodes, parts));
                    ctl.wake_scheduler();
                    Message::ResponseSubmitBatchJob(SubmitResponseMsg {
                        job_id: outcome.job_id,
                        step_id: 0,
                        error_code: 0,
                    })
                }
                Err(SchedError::PartConfigUnavailable) => {
                    // queued anyway; the client sees the warning code
                    Message::ResponseSubmitBatchJob(SubmitResponseMsg {
                        job_id: desc.job_id,
                        step_id: 0,
                        error_code: SchedError::PartConfigUnavailable.code(),
                    })
                }
                Err(err) => Message::rc(err.code()),
            }
        }

        Message::RequestResourceAllocation(mut desc) => {
            desc.user_id = if uid != 0 { uid } else { desc.user_id };
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            let parts = ctl.parts.read();
            let immediate = desc.immediate != 0;
            match lifecycle::job_allocate(
                ctl, &cfg, &mut jobs, &mut nodes, &parts, &mut desc, uid, immediate, false, true,
            ) {
                Ok(outcome) => {
                    // an immediate start already populated the record;
                    // a queued allocation answers with empty fields and
                    // the grant follows over the srun channel
                    debug!(
                        "allocation for job {} started={}",
                        outcome.job_id, outcome.started
                    );
                    let job = jobs.find(outcome.job_id).expect("job present");
                    Message::ResponseResourceAllocation(allocation_view(job))
                }
                Err(err) => Message::rc(err.code()),
            }
        }

        Message::RequestJobWillRun(mut desc) => {
            desc.user_id = if uid != 0 { uid } else { desc.user_id };
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            let parts = ctl.parts.read();
            let req_nodes = desc.req_nodes.clone();
            match lifecycle::job_allocate(
                ctl, &cfg, &mut jobs, &mut nodes, &parts, &mut desc, uid, false, true, false,
            ) {
                Ok(outcome) => {
                    let resp = sched::job_start_data(
                        ctl,
                        &cfg,
                        &mut jobs,
                        &nodes,
                        &parts,
                        outcome.job_id,
                        req_nodes.as_deref(),
                    )
                    .unwrap_or(WillRunMsg {
                        job_id: outcome.job_id,
                        start_time: now(),
                        node_list: None,
                    });
                    jobs.purge(outcome.job_id);
                    Message::ResponseJobWillRun(resp)
                }
                Err(err) => Message::rc(err.code()),
            }
        }

        Message::RequestUpdateJob(desc) => {
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            let parts = ctl.parts.read();
            let result = lifecycle::update_job(ctl, &cfg, &mut jobs, &mut nodes, &parts, &desc, uid);
            drop((cfg, jobs, nodes, parts));
            if result.is_ok() {
                ctl.wake_scheduler();
            }
            rc_of(result)
        }

        Message::RequestCancelJobStep(cancel) => {
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            if cancel.step_id == NO_VAL {
                rc_of(lifecycle::job_signal(
                    ctl,
                    &cfg,
                    &mut jobs,
                    &mut nodes,
                    cancel.job_id,
                    cancel.signal,
                    cancel.batch_flag != 0,
                    uid,
                ))
            } else {
                rc_of(step_signal(
                    ctl, &cfg, &mut jobs, &nodes, cancel.job_id, cancel.step_id, cancel.signal, uid,
                ))
            }
        }

        Message::RequestSuspend(sus) => {
            let clear_prio = ctl.config.read().preempt_mode == PreemptMode::SuspendGang && uid == 0;
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            rc_of(lifecycle::suspend::job_suspend(
                ctl, &cfg, &mut jobs, &mut nodes, &sus, uid, clear_prio,
            ))
        }

        Message::RequestJobRequeue(req) => {
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            let result = lifecycle::requeue::job_requeue(
                ctl, &cfg, &mut jobs, &mut nodes, uid, req.job_id,
            );
            drop((cfg, jobs, nodes));
            if result.is_ok() {
                ctl.wake_scheduler();
            }
            rc_of(result)
        }

        Message::RequestCheckpoint(ckpt) => {
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            if ckpt.op == CHECK_RESTART {
                let parts = ctl.parts.read();
                match lifecycle::checkpoint::job_restart(
                    ctl, &cfg, &mut jobs, &mut nodes, &parts, &ckpt, uid,
                ) {
                    Ok(_) => {
                        drop((cfg, jobs, nodes, parts));
                        ctl.wake_scheduler();
                        Message::rc(0)
                    }
                    Err(err) => Message::rc(err.code()),
                }
            } else {
                match lifecycle::checkpoint::job_checkpoint(
                    ctl, &cfg, &mut jobs, &mut nodes, &ckpt, uid,
                ) {
                    Ok(resp) => Message::ResponseCheckpoint(resp),
                    Err(err) => Message::rc(err.code()),
                }
            }
        }

        Message::RequestJobReady(req) => {
            let _cfg = ctl.config.read();
            let jobs = ctl.jobs.read();
            let nodes = ctl.nodes.read();
            match lifecycle::job_node_ready(&jobs, &nodes, req.job_id) {
                Ok(ready) => Message::ResponseJobReady(crate::codec::msg::ReturnCodeMsg {
                    return_code: ready,
                }),
                Err(err) => Message::rc(err.code()),
            }
        }

        Message::RequestJobAllocationInfo(req) | Message::RequestJobAllocationInfoLite(req) => {
            let cfg = ctl.config.read();
            let jobs = ctl.jobs.read();
            match jobs.find(req.job_id) {
                Some(job) if job.user_id == uid || cfg.is_super_user(uid) => {
                    Message::ResponseResourceAllocation(allocation_view(job))
                }
                Some(_) => Message::rc(SchedError::AccessDenied.code()),
                None => Message::rc(SchedError::InvalidJobId.code()),
            }
        }

        Message::RequestJobEndTime(req) => {
            let _cfg = ctl.config.read();
            let jobs = ctl.jobs.read();
            match lifecycle::job_end_time(&jobs, req.job_id) {
                Ok(end) => Message::SrunTimeout(crate::codec::msg::SrunTimeoutMsg {
                    job_id: req.job_id,
                    step_id: NO_VAL,
                    timeout: end,
                }),
                Err(err) => Message::rc(err.code()),
            }
        }

        Message::RequestJobInfo(req) => {
            let cfg = ctl.config.read();
            let jobs = ctl.jobs.read();
            let hide_others = cfg.private_data & PRIVATE_JOBS != 0 && !cfg.is_super_user(uid);
            let views: Vec<JobInfoView> = jobs
                .iter()
                .filter(|j| !hide_others || j.user_id == uid)
                .map(job_info_view)
                .collect();
            let _ = req.last_update;
            Message::ResponseJobInfo(JobInfoMsg {
                last_update: jobs.last_job_update,
                jobs: views,
            })
        }

        Message::RequestJobStepInfo(req) => {
            let cfg = ctl.config.read();
            let jobs = ctl.jobs.read();
            let hide_others = cfg.private_data & PRIVATE_JOBS != 0 && !cfg.is_super_user(uid);
            let mut steps = Vec::new();
            for job in jobs.iter() {
                if req.job_id != NO_VAL && job.job_id != req.job_id {
                    continue;
                }
                if hide_others && job.user_id != uid {
                    continue;
                }
                for step in &job.steps {
                    if req.step_id != NO_VAL && step.step_id != req.step_id {
                        continue;
                    }
                    steps.push(StepInfoView {
                        job_id: job.job_id,
                        step_id: step.step_id,
                        user_id: job.user_id,
                        start_time: step.start_time,
                        num_tasks: step.num_tasks,
                        nodes: step.node_list.clone(),
                        name: step.name.clone(),
                        partition: Some(job.partition.clone()),
                    });
                }
            }
            Message::ResponseJobStepInfo(StepInfoMsg {
                last_update: jobs.last_job_update,
                steps,
            })
        }

        Message::RequestNodeInfo(_req) => {
            let _cfg = ctl.config.read();
            let nodes = ctl.nodes.read();
            let views: Vec<NodeInfoView> = nodes
                .iter()
                .map(|(_, n)| NodeInfoView {
                    name: n.name.clone(),
                    state: n.state_word(),
                    cpus: n.sched_cpus(true),
                    sockets: n.sockets,
                    cores: n.cores,
                    threads: n.threads,
                    real_memory: n.real_memory,
                    tmp_disk: n.tmp_disk,
                    weight: n.weight,
                    up_time: n.up_time,
                    features: if n.features.is_empty() {
                        None
                    } else {
                        Some(n.features.join(","))
                    },
                    reason: n.reason.clone(),
                })
                .collect();
            Message::ResponseNodeInfo(NodeInfoMsg {
                last_update: nodes.last_node_update,
                nodes: views,
            })
        }

        Message::RequestPartitionInfo(_req) => {
            let _cfg = ctl.config.read();
            let parts = ctl.parts.read();
            let views: Vec<PartInfoView> = parts
                .iter()
                .filter(|(_, p)| !p.hidden)
                .map(|(idx, p)| PartInfoView {
                    name: p.name.clone(),
                    max_time: p.max_time,
                    max_nodes: p.max_nodes,
                    min_nodes: p.min_nodes,
                    total_nodes: p.total_nodes,
                    total_cpus: p.total_cpus,
                    priority: p.priority,
                    default_part: (Some(idx) == parts.default_idx()) as u16,
                    hidden: p.hidden as u16,
                    root_only: p.root_only as u16,
                    shared: p.shared as u16,
                    state_up: p.state_up as u16,
                    nodes: Some(p.node_names.clone()),
                    allow_groups: if p.allow_groups.is_empty() {
                        None
                    } else {
                        Some(p.allow_groups.join(","))
                    },
                })
                .collect();
            Message::ResponsePartitionInfo(PartInfoMsg {
                last_update: parts.last_part_update,
                partitions: views,
            })
        }

        Message::RequestBuildInfo(_req) => {
            let cfg = ctl.config.read();
            Message::ResponseBuildInfo(BuildInfoMsg {
                last_update: now(),
                cluster_name: cfg.cluster_name.clone(),
                max_job_cnt: cfg.max_job_cnt,
                min_job_age: cfg.min_job_age,
                kill_wait: cfg.kill_wait,
                msg_timeout: cfg.msg_timeout,
                inactive_limit: cfg.inactive_limit,
                over_time_limit: cfg.over_time_limit,
                first_job_id: cfg.first_job_id,
                accounting_enforce: cfg.accounting_enforce,
                preempt_mode: cfg.preempt_mode as u16,
                fast_schedule: cfg.fast_schedule as u16,
                enforce_part_limits: cfg.enforce_part_limits as u16,
            })
        }

        Message::RequestStepLayout(req) => {
            let _cfg = ctl.config.read();
            let jobs = ctl.jobs.read();
            let Some(job) = jobs.find(req.job_id) else {
                return Message::rc(SchedError::InvalidJobId.code());
            };
            let Some(step) = job.find_step(req.step_id) else {
                return Message::rc(SchedError::InvalidJobId.code());
            };
            Message::ResponseStepLayout(StepLayoutMsg {
                job_id: job.job_id,
                step_id: step.step_id,
                node_list: step.node_list.clone(),
                node_cnt: step
                    .node_bitmap
                    .as_ref()
                    .map(|b| b.count() as u32)
                    .unwrap_or(0),
                task_cnt: step.num_tasks,
                tasks_per_node: step.cpus_per_node.clone(),
            })
        }

        Message::RequestStepComplete(comp) => {
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let Some(job) = jobs.find_mut(comp.job_id) else {
                return Message::rc(SchedError::InvalidJobId.code());
            };
            if job.user_id != uid && !cfg.is_super_user(uid) {
                return Message::rc(SchedError::AccessDenied.code());
            }
            if job.delete_step(comp.step_id) {
                debug!(
                    "step {}.{} complete rc={}",
                    comp.job_id, comp.step_id, comp.step_rc
                );
                Message::rc(0)
            } else {
                Message::rc(SchedError::InvalidJobId.code())
            }
        }

        Message::RequestCompleteJobAllocation(comp) => {
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            let result = lifecycle::job_complete(
                ctl, &cfg, &mut jobs, &mut nodes, comp.job_id, uid, false, comp.rc,
            );
            drop((cfg, jobs, nodes));
            if result.is_ok() {
                ctl.wake_scheduler();
            }
            rc_of(result)
        }

        Message::RequestCompleteBatchScript(comp) => {
            let requeue = comp.node_rc != 0;
            let result = {
                let cfg = ctl.config.read();
                let mut jobs = ctl.jobs.write();
                let mut nodes = ctl.nodes.write();
                nodes.node_did_resp(&comp.node_name);
                lifecycle::job_complete(
                    ctl, &cfg, &mut jobs, &mut nodes, comp.job_id, uid, requeue, comp.job_rc,
                )
            };
            if result.is_ok() {
                ctl.wake_scheduler();
            }
            rc_of(result)
        }

        Message::MessageEpilogComplete(epilog) => {
            lifecycle::handle_epilog_complete(
                ctl,
                epilog.job_id,
                &epilog.node_name,
                epilog.return_code,
            );
            Message::rc(0)
        }

        Message::NodeRegistration(reg) => {
            let cfg = ctl.config.read();
            let mut jobs = ctl.jobs.write();
            let mut nodes = ctl.nodes.write();
            match nodes.register(&reg, cfg.fast_schedule) {
                Ok(_) => {
                    lifecycle::validate_jobs_on_node(ctl, &cfg, &mut jobs, &mut nodes, &reg);
                    drop((cfg, jobs, nodes));
                    ctl.wake_scheduler();
                    Message::rc(0)
                }
                Err(err) => Message::rc(err.code()),
            }
        }

        Message::RequestStatJobAcct(req) => {
            let _cfg = ctl.config.read();
            let jobs = ctl.jobs.read();
            match jobs.find(req.job_id) {
                Some(job) => Message::ResponseStatJobAcct(crate::codec::msg::StatJobAcctMsg {
                    job_id: job.job_id,
                    step_id: req.step_id,
                    num_tasks: job
                        .find_step(req.step_id)
                        .map(|s| s.num_tasks)
                        .unwrap_or(0),
                    user_cpu_sec: 0,
                    sys_cpu_sec: 0,
                    max_rss: 0,
                }),
                None => Message::rc(SchedError::InvalidJobId.code()),
            }
        }

        Message::RequestFileBcast(bcast) => {
            // relay the block to every node of the owning job; the
            // controller itself stores nothing
            let _cfg = ctl.config.read();
            let jobs = ctl.jobs.read();
            let nodes = ctl.nodes.read();
            let owner = jobs.iter().find(|j| {
                j.user_id == bcast.uid && j.is_running() && j.node_bitmap.is_some()
            });
            match owner {
                Some(job) => {
                    let targets: Vec<_> = job
                        .node_bitmap
                        .as_ref()
                        .expect("checked above")
                        .iter_set()
                        .map(|i| crate::agent::AgentTarget {
                            name: nodes.get(i).name.clone(),
                            addr: nodes.get(i).addr,
                        })
                        .collect();
                    ctl.agent.queue_request(crate::agent::AgentRequest {
                        msg: Message::RequestFileBcast(bcast),
                        targets,
                        retry: true,
                    });
                    Message::rc(0)
                }
                None => Message::rc(SchedError::InvalidJobId.code()),
            }
        }

        Message::RequestJobId(_) => {
            // pid-to-job mapping is node-local knowledge
            Message::rc(SchedError::NotSupported.code())
        }

        Message::RequestPing => Message::rc(0),

        Message::RequestReconfigure => {
            if uid != 0 && !ctl.config.read().is_super_user(uid) {
                return Message::rc(SchedError::AccessDenied.code());
            }
            let first_job_id = ctl.config.read().first_job_id;
            ctl.jobs.write().reset_first_job_id(first_job_id);
            ctl.wake_scheduler();
            Message::rc(0)
        }

        Message::RequestShutdown(_) => {
            if uid != 0 && !ctl.config.read().is_super_user(uid) {
                return Message::rc(SchedError::AccessDenied.code());
            }
            if let Err(err) = state::dump_all_job_state(ctl) {
                error!("final state save failed: {}", err);
            }
            ctl.begin_shutdown();
            Message::rc(0)
        }

        other => {
            warn!("unexpected inbound rpc {:?}", other.msg_type());
            Message::rc(SchedError::NotSupported.code())
        }
    }
}

/// Signal one step's tasks on its nodes; SIGKILL also drops the step
/// record.
#[allow(clippy::too_many_arguments)]
fn step_signal(
    ctl: &Controller,
    cfg: &crate::config::Config,
    jobs: &mut crate::job::table::JobTable,
    nodes: &crate::node::NodeRegistry,
    job_id: u32,
    step_id: u32,
    signal: u16,
    uid: u32,
) -> SchedResult<()> {
    let (user_id, targets) = {
        let job = jobs.find(job_id).ok_or(SchedError::InvalidJobId)?;
        let step = job.find_step(step_id).ok_or(SchedError::InvalidJobId)?;
        let targets: Vec<crate::agent::AgentTarget> = step
            .node_bitmap
            .as_ref()
            .map(|bm| {
                bm.iter_set()
                    .map(|i| crate::agent::AgentTarget {
                        name: nodes.get(i).name.clone(),
                        addr: nodes.get(i).addr,
                    })
                    .collect()
            })
            .unwrap_or_default();
        (job.user_id, targets)
    };
    if user_id != uid && !cfg.is_super_user(uid) {
        return Err(SchedError::AccessDenied);
    }
    ctl.agent.queue_request(crate::agent::AgentRequest {
        msg: Message::RequestSignalTasks(crate::codec::msg::SignalTasksMsg {
            job_id,
            step_id,
            signal: signal as u32,
        }),
        targets,
        retry: true,
    });
    if signal == lifecycle::SIGKILL {
        jobs.find_mut(job_id)
            .ok_or(SchedError::InvalidJobId)?
            .delete_step(step_id);
    }
    Ok(())
}

fn allocation_view(job: &JobRecord) -> ResourceAllocationMsg {
    ResourceAllocationMsg {
        job_id: job.job_id,
        error_code: 0,
        node_list: job.nodes.clone(),
        cpus_per_node: job.cpus_per_node.clone(),
        cpu_count_reps: job.cpu_count_reps.clone(),
        node_cnt: job.node_cnt,
        node_addrs: job.node_addrs.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cred_round_trip() {
        let cred = pack_cred(1234, 100);
        assert_eq!(TrustingVerifier.verify(&cred).unwrap(), (1234, 100));
    }

    #[test]
    fn test_empty_cred_is_root() {
        assert_eq!(TrustingVerifier.verify(&[]).unwrap(), (0, 0));
    }

    #[test]
    fn test_truncated_cred_rejected() {
        assert!(TrustingVerifier.verify(&[0, 0, 1]).is_err());
    }
}

fn job_info_view(job: &JobRecord) -> JobInfoView {
    let details = job.details.as_ref();
    JobInfoView {
        job_id: job.job_id,
        user_id: job.user_id,
        group_id: job.group_id,
        job_state: job.state.to_word(),
        batch_flag: job.batch_flag,
        state_reason: job.state_reason as u16,
        exit_code: job.exit_code,
        num_procs: job.num_procs,
        num_nodes: job.node_cnt,
        time_limit: job.time_limit,
        submit_time: details.map(|d| d.submit_time).unwrap_or(0),
        start_time: job.start_time,
        end_time: job.end_time,
        suspend_time: job.suspend_time,
        pre_sus_time: job.pre_sus_time,
        priority: job.priority,
        nice: details.map(|d| d.nice).unwrap_or(crate::constants::NICE_OFFSET),
        restart_cnt: job.restart_cnt,
        partition: Some(job.partition.clone()),
        name: job.name.clone(),
        account: job.account.clone(),
        wckey: job.wckey.clone(),
        nodes: job.nodes.clone(),
        req_nodes: details.and_then(|d| d.req_nodes.clone()),
        exc_nodes: details.and_then(|d| d.exc_nodes.clone()),
        features: details.and_then(|d| d.features.clone()),
        dependency: details.and_then(|d| d.dependency.clone()),
        licenses: job.licenses.clone(),
        network: job.network.clone(),
        comment: job.comment.clone(),
        state_desc: job.state_desc.clone(),
        alloc_node: job.alloc_node.clone(),
        alloc_sid: job.alloc_sid,
        resv_name: job.resv_name.clone(),
    }
}

