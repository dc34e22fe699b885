//! Unsolicited notifications to allocating clients.
//!
//! Interactive jobs register a response host and ports at submit time;
//! the controller pushes allocation grants, pending-timeout warnings,
//! node failures, and completion notices to them through the agent so
//! client communication shares the fan-out, watchdog, and retry
//! machinery.

use std::net::{Ipv4Addr, SocketAddrV4};

use tracing::debug;

use crate::agent::{AgentRequest, AgentTarget};
use crate::codec::msg::{
    Message, ResourceAllocationMsg, SrunJobMsg, SrunNodeFailMsg, SrunTimeoutMsg,
};
use crate::constants::NO_VAL;
use crate::controller::Controller;
use crate::job::JobRecord;

fn client_target(job: &JobRecord, port: u16) -> Option<AgentTarget> {
    let host = job.resp_host.as_deref()?;
    if port == 0 {
        return None;
    }
    let ip: Ipv4Addr = host.parse().ok()?;
    Some(AgentTarget {
        name: host.to_string(),
        addr: SocketAddrV4::new(ip, port),
    })
}

fn queue_to_client(ctl: &Controller, job: &JobRecord, port: u16, msg: Message) {
    let Some(target) = client_target(job, port) else {
        debug!("job {} has no client endpoint for {:?}", job.job_id, msg.msg_type());
        return;
    };
    ctl.agent.queue_request(AgentRequest {
        msg,
        targets: vec![target],
        retry: false,
    });
}

/// Push the allocation grant to a waiting interactive client.
pub fn srun_allocate(ctl: &Controller, job: &JobRecord) {
    let msg = Message::ResponseResourceAllocation(ResourceAllocationMsg {
        job_id: job.job_id,
        error_code: 0,
        node_list: job.nodes.clone(),
        cpus_per_node: job.cpus_per_node.clone(),
        cpu_count_reps: job.cpu_count_reps.clone(),
        node_cnt: job.node_cnt,
        node_addrs: job.node_addrs.clone(),
    });
    queue_to_client(ctl, job, job.alloc_resp_port, msg);
}

/// Tell a client its pending allocation was cancelled.
pub fn srun_allocate_abort(ctl: &Controller, job: &JobRecord) {
    let msg = Message::SrunJobComplete(SrunJobMsg {
        job_id: job.job_id,
        step_id: NO_VAL,
    });
    queue_to_client(ctl, job, job.alloc_resp_port, msg);
}

/// Liveness probe toward the client.
pub fn srun_ping(ctl: &Controller, job: &JobRecord) {
    let msg = Message::SrunPing(SrunJobMsg {
        job_id: job.job_id,
        step_id: NO_VAL,
    });
    queue_to_client(ctl, job, job.other_port, msg);
}

/// Warn the client its job is approaching the time limit.
pub fn srun_timeout(ctl: &Controller, job: &JobRecord) {
    let msg = Message::SrunTimeout(SrunTimeoutMsg {
        job_id: job.job_id,
        step_id: NO_VAL,
        timeout: job.end_time,
    });
    queue_to_client(ctl, job, job.other_port, msg);
}

/// Tell the client one of its nodes failed.
pub fn srun_node_fail(ctl: &Controller, job: &JobRecord, node_name: &str) {
    let msg = Message::SrunNodeFail(SrunNodeFailMsg {
        job_id: job.job_id,
        step_id: NO_VAL,
        nodelist: Some(node_name.to_string()),
    });
    queue_to_client(ctl, job, job.other_port, msg);
}

/// Tell the client the whole job is done.
pub fn srun_job_complete(ctl: &Controller, job: &JobRecord) {
    let msg = Message::SrunJobComplete(SrunJobMsg {
        job_id: job.job_id,
        step_id: NO_VAL,
    });
    queue_to_client(ctl, job, job.other_port, msg);
}
