//! The message catalogue.
//!
//! Every RPC body in the system, with a dedicated pack/unpack per
//! variant and dispatch by the u16 type tag. Serialization only —
//! routing, state mutation, and authentication live elsewhere.

use std::net::SocketAddrV4;

use crate::codec::buffer::{PackBuf, UnpackBuf};
use crate::constants::NO_VAL;
use crate::error::{SchedError, SchedResult};
use crate::UnixTime;

/// Wire type tags. Grouped: 1xxx node control, 2xxx information,
/// 4xxx job control, 5xxx node-agent job operations, 7xxx srun
/// notifications, 8xxx generic responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    RequestNodeRegistrationStatus = 1001,
    MessageNodeRegistration = 1002,
    RequestReconfigure = 1003,
    RequestShutdown = 1005,
    RequestPing = 1008,

    RequestBuildInfo = 2001,
    ResponseBuildInfo = 2002,
    RequestJobInfo = 2003,
    ResponseJobInfo = 2004,
    RequestJobStepInfo = 2005,
    ResponseJobStepInfo = 2006,
    RequestNodeInfo = 2007,
    ResponseNodeInfo = 2008,
    RequestPartitionInfo = 2009,
    ResponsePartitionInfo = 2010,

    RequestResourceAllocation = 4001,
    ResponseResourceAllocation = 4002,
    RequestSubmitBatchJob = 4003,
    ResponseSubmitBatchJob = 4004,
    RequestBatchJobLaunch = 4005,
    RequestCancelJobStep = 4006,
    RequestUpdateJob = 4007,
    RequestJobWillRun = 4008,
    ResponseJobWillRun = 4009,
    RequestJobAllocationInfo = 4010,
    RequestJobAllocationInfoLite = 4011,
    RequestJobEndTime = 4012,
    RequestJobReady = 4014,
    ResponseJobReady = 4015,
    RequestSuspend = 4016,
    RequestJobRequeue = 4017,
    RequestCheckpoint = 4018,
    ResponseCheckpoint = 4019,
    RequestCompleteJobAllocation = 4020,
    RequestCompleteBatchScript = 4021,
    RequestStepLayout = 4022,
    ResponseStepLayout = 4023,
    RequestStepComplete = 4024,
    MessageEpilogComplete = 4025,
    RequestJobId = 4026,
    ResponseJobId = 4027,
    RequestFileBcast = 4028,
    RequestStatJobAcct = 4029,
    ResponseStatJobAcct = 4030,

    RequestLaunchTasks = 5001,
    RequestSignalTasks = 5002,
    RequestTerminateTasks = 5003,
    RequestSignalJob = 5004,
    RequestTerminateJob = 5005,
    RequestKillTimelimit = 5006,
    RequestUpdateJobTime = 5007,
    RequestAbortJob = 5008,

    SrunPing = 7001,
    SrunTimeout = 7002,
    SrunNodeFail = 7003,
    SrunJobComplete = 7004,

    ResponseReturnCode = 8001,
    ResponseForwardFailed = 8002,
}

impl TryFrom<u16> for MsgType {
    type Error = SchedError;

    fn try_from(v: u16) -> SchedResult<MsgType> {
        use MsgType::*;
        Ok(match v {
            1001 => RequestNodeRegistrationStatus,
            1002 => MessageNodeRegistration,
            1003 => RequestReconfigure,
            1005 => RequestShutdown,
            1008 => RequestPing,
            2001 => RequestBuildInfo,
            2002 => ResponseBuildInfo,
            2003 => RequestJobInfo,
            2004 => ResponseJobInfo,
            2005 => RequestJobStepInfo,
            2006 => ResponseJobStepInfo,
            2007 => RequestNodeInfo,
            2008 => ResponseNodeInfo,
            2009 => RequestPartitionInfo,
            2010 => ResponsePartitionInfo,
            4001 => RequestResourceAllocation,
            4002 => ResponseResourceAllocation,
            4003 => RequestSubmitBatchJob,
            4004 => ResponseSubmitBatchJob,
            4005 => RequestBatchJobLaunch,
            4006 => RequestCancelJobStep,
            4007 => RequestUpdateJob,
            4008 => RequestJobWillRun,
            4009 => ResponseJobWillRun,
            4010 => RequestJobAllocationInfo,
            4011 => RequestJobAllocationInfoLite,
            4012 => RequestJobEndTime,
            4014 => RequestJobReady,
            4015 => ResponseJobReady,
            4016 => RequestSuspend,
            4017 => RequestJobRequeue,
            4018 => RequestCheckpoint,
            4019 => ResponseCheckpoint,
            4020 => RequestCompleteJobAllocation,
            4021 => RequestCompleteBatchScript,
            4022 => RequestStepLayout,
            4023 => ResponseStepLayout,
            4024 => RequestStepComplete,
            4025 => MessageEpilogComplete,
            4026 => RequestJobId,
            4027 => ResponseJobId,
            4028 => RequestFileBcast,
            4029 => RequestStatJobAcct,
            4030 => ResponseStatJobAcct,
            5001 => RequestLaunchTasks,
            5002 => RequestSignalTasks,
            5003 => RequestTerminateTasks,
            5004 => RequestSignalJob,
            5005 => RequestTerminateJob,
            5006 => RequestKillTimelimit,
            5007 => RequestUpdateJobTime,
            5008 => RequestAbortJob,
            7001 => SrunPing,
            7002 => SrunTimeout,
            7003 => SrunNodeFail,
            7004 => SrunJobComplete,
            8001 => ResponseReturnCode,
            8002 => ResponseForwardFailed,
            other => return Err(SchedError::Decode(format!("unknown message type {}", other))),
        })
    }
}

/// Multi-core placement attributes of a job request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiCore {
    pub min_sockets: u16,
    pub max_sockets: u16,
    pub min_cores: u16,
    pub max_cores: u16,
    pub min_threads: u16,
    pub max_threads: u16,
    pub ntasks_per_socket: u16,
    pub ntasks_per_core: u16,
    pub plane_size: u16,
}

impl Default for MultiCore {
    fn default() -> Self {
        MultiCore {
            min_sockets: 1,
            max_sockets: u16::MAX,
            min_cores: 1,
            max_cores: u16::MAX,
            min_threads: 1,
            max_threads: u16::MAX,
            ntasks_per_socket: 0,
            ntasks_per_core: 0,
            plane_size: 0,
        }
    }
}

impl MultiCore {
    pub fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u16(self.min_sockets);
        buf.pack_u16(self.max_sockets);
        buf.pack_u16(self.min_cores);
        buf.pack_u16(self.max_cores);
        buf.pack_u16(self.min_threads);
        buf.pack_u16(self.max_threads);
        buf.pack_u16(self.ntasks_per_socket);
        buf.pack_u16(self.ntasks_per_core);
        buf.pack_u16(self.plane_size);
    }

    pub fn unpack(buf: &mut UnpackBuf) -> SchedResult<MultiCore> {
        Ok(MultiCore {
            min_sockets: buf.unpack_u16()?,
            max_sockets: buf.unpack_u16()?,
            min_cores: buf.unpack_u16()?,
            max_cores: buf.unpack_u16()?,
            min_threads: buf.unpack_u16()?,
            max_threads: buf.unpack_u16()?,
            ntasks_per_socket: buf.unpack_u16()?,
            ntasks_per_core: buf.unpack_u16()?,
            plane_size: buf.unpack_u16()?,
        })
    }
}

/// Job submission / allocation / update descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescMsg {
    /// NO_VAL asks the controller to assign an id.
    pub job_id: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub name: Option<String>,
    pub account: Option<String>,
    pub wckey: Option<String>,
    pub comment: Option<String>,
    pub network: Option<String>,
    pub licenses: Option<String>,
    pub partition: Option<String>,
    pub dependency: Option<String>,
    pub reservation: Option<String>,
    /// NO_VAL = computed; 0 = held.
    pub priority: u32,
    pub nice: u16,
    /// Minutes; NO_VAL or INFINITE = unlimited.
    pub time_limit: u32,
    pub num_procs: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub req_nodes: Option<String>,
    pub exc_nodes: Option<String>,
    pub features: Option<String>,
    pub shared: u16,
    pub contiguous: u16,
    pub requeue: u16,
    pub overcommit: u8,
    pub open_mode: u8,
    pub acctg_freq: u16,
    pub kill_on_node_fail: u16,
    pub immediate: u16,
    pub begin_time: UnixTime,
    pub argv: Vec<String>,
    pub environment: Vec<String>,
    pub script: Option<String>,
    pub stderr: Option<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub work_dir: Option<String>,
    pub ckpt_dir: Option<String>,
    pub restart_dir: Option<String>,
    pub ckpt_interval: u16,
    pub cpu_bind: Option<String>,
    pub cpu_bind_type: u16,
    pub mem_bind: Option<String>,
    pub mem_bind_type: u16,
    pub task_dist: u16,
    pub cpus_per_task: u16,
    pub ntasks_per_node: u16,
    pub num_tasks: u32,
    pub job_min_procs: u32,
    pub job_min_memory: u32,
    pub job_min_tmp_disk: u32,
    pub multi_core: MultiCore,
    pub mail_type: u16,
    pub mail_user: Option<String>,
    pub alloc_node: Option<String>,
    pub alloc_sid: u32,
    pub resp_host: Option<String>,
    pub alloc_resp_port: u16,
    pub other_port: u16,
    /// Opaque selection-plugin blob.
    pub select_blob: Vec<u8>,
    pub spank_env: Vec<String>,
}

impl Default for JobDescMsg {
    fn default() -> Self {
        JobDescMsg {
            job_id: NO_VAL,
            user_id: 0,
            group_id: 0,
            name: None,
            account: None,
            wckey: None,
            comment: None,
            network: None,
            licenses: None,
            partition: None,
            dependency: None,
            reservation: None,
            priority: NO_VAL,
            nice: crate::constants::NICE_OFFSET,
            time_limit: NO_VAL,
            num_procs: 1,
            min_nodes: 1,
            max_nodes: NO_VAL,
            req_nodes: None,
            exc_nodes: None,
            features: None,
            shared: 0,
            contiguous: 0,
            requeue: NO_VAL as u16,
            overcommit: 0,
            open_mode: 0,
            acctg_freq: 0,
            kill_on_node_fail: 1,
            immediate: 0,
            begin_time: 0,
            argv: Vec::new(),
            environment: Vec::new(),
            script: None,
            stderr: None,
            stdin: None,
            stdout: None,
            work_dir: None,
            ckpt_dir: None,
            restart_dir: None,
            ckpt_interval: 0,
            cpu_bind: None,
            cpu_bind_type: 0,
            mem_bind: None,
            mem_bind_type: 0,
            task_dist: 0,
            cpus_per_task: 1,
            ntasks_per_node: 0,
            num_tasks: 1,
            job_min_procs: 1,
            job_min_memory: 0,
            job_min_tmp_disk: 0,
            multi_core: MultiCore::default(),
            mail_type: 0,
            mail_user: None,
            alloc_node: None,
            alloc_sid: 0,
            resp_host: None,
            alloc_resp_port: 0,
            other_port: 0,
            select_blob: Vec::new(),
            spank_env: Vec::new(),
        }
    }
}

impl JobDescMsg {
    pub fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.user_id);
        buf.pack_u32(self.group_id);
        buf.pack_str(self.name.as_deref());
        buf.pack_str(self.account.as_deref());
        buf.pack_str(self.wckey.as_deref());
        buf.pack_str(self.comment.as_deref());
        buf.pack_str(self.network.as_deref());
        buf.pack_str(self.licenses.as_deref());
        buf.pack_str(self.partition.as_deref());
        buf.pack_str(self.dependency.as_deref());
        buf.pack_str(self.reservation.as_deref());
        buf.pack_u32(self.priority);
        buf.pack_u16(self.nice);
        buf.pack_u32(self.time_limit);
        buf.pack_u32(self.num_procs);
        buf.pack_u32(self.min_nodes);
        buf.pack_u32(self.max_nodes);
        buf.pack_str(self.req_nodes.as_deref());
        buf.pack_str(self.exc_nodes.as_deref());
        buf.pack_str(self.features.as_deref());
        buf.pack_u16(self.shared);
        buf.pack_u16(self.contiguous);
        buf.pack_u16(self.requeue);
        buf.pack_u8(self.overcommit);
        buf.pack_u8(self.open_mode);
        buf.pack_u16(self.acctg_freq);
        buf.pack_u16(self.kill_on_node_fail);
        buf.pack_u16(self.immediate);
        buf.pack_time(self.begin_time);
        buf.pack_str_array(&self.argv);
        buf.pack_str_array(&self.environment);
        buf.pack_str(self.script.as_deref());
        buf.pack_str(self.stderr.as_deref());
        buf.pack_str(self.stdin.as_deref());
        buf.pack_str(self.stdout.as_deref());
        buf.pack_str(self.work_dir.as_deref());
        buf.pack_str(self.ckpt_dir.as_deref());
        buf.pack_str(self.restart_dir.as_deref());
        buf.pack_u16(self.ckpt_interval);
        buf.pack_str(self.cpu_bind.as_deref());
        buf.pack_u16(self.cpu_bind_type);
        buf.pack_str(self.mem_bind.as_deref());
        buf.pack_u16(self.mem_bind_type);
        buf.pack_u16(self.task_dist);
        buf.pack_u16(self.cpus_per_task);
        buf.pack_u16(self.ntasks_per_node);
        buf.pack_u32(self.num_tasks);
        buf.pack_u32(self.job_min_procs);
        buf.pack_u32(self.job_min_memory);
        buf.pack_u32(self.job_min_tmp_disk);
        self.multi_core.pack(buf);
        buf.pack_u16(self.mail_type);
        buf.pack_str(self.mail_user.as_deref());
        buf.pack_str(self.alloc_node.as_deref());
        buf.pack_u32(self.alloc_sid);
        buf.pack_str(self.resp_host.as_deref());
        buf.pack_u16(self.alloc_resp_port);
        buf.pack_u16(self.other_port);
        buf.pack_mem(&self.select_blob);
        buf.pack_str_array(&self.spank_env);
    }

    pub fn unpack(buf: &mut UnpackBuf) -> SchedResult<JobDescMsg> {
        Ok(JobDescMsg {
            job_id: buf.unpack_u32()?,
            user_id: buf.unpack_u32()?,
            group_id: buf.unpack_u32()?,
            name: buf.unpack_str()?,
            account: buf.unpack_str()?,
            wckey: buf.unpack_str()?,
            comment: buf.unpack_str()?,
            network: buf.unpack_str()?,
            licenses: buf.unpack_str()?,
            partition: buf.unpack_str()?,
            dependency: buf.unpack_str()?,
            reservation: buf.unpack_str()?,
            priority: buf.unpack_u32()?,
            nice: buf.unpack_u16()?,
            time_limit: buf.unpack_u32()?,
            num_procs: buf.unpack_u32()?,
            min_nodes: buf.unpack_u32()?,
            max_nodes: buf.unpack_u32()?,
            req_nodes: buf.unpack_str()?,
            exc_nodes: buf.unpack_str()?,
            features: buf.unpack_str()?,
            shared: buf.unpack_u16()?,
            contiguous: buf.unpack_u16()?,
            requeue: buf.unpack_u16()?,
            overcommit: buf.unpack_u8()?,
            open_mode: buf.unpack_u8()?,
            acctg_freq: buf.unpack_u16()?,
            kill_on_node_fail: buf.unpack_u16()?,
            immediate: buf.unpack_u16()?,
            begin_time: buf.unpack_time()?,
            argv: buf.unpack_str_array()?,
            environment: buf.unpack_str_array()?,
            script: buf.unpack_str()?,
            stderr: buf.unpack_str()?,
            stdin: buf.unpack_str()?,
            stdout: buf.unpack_str()?,
            work_dir: buf.unpack_str()?,
            ckpt_dir: buf.unpack_str()?,
            restart_dir: buf.unpack_str()?,
            ckpt_interval: buf.unpack_u16()?,
            cpu_bind: buf.unpack_str()?,
            cpu_bind_type: buf.unpack_u16()?,
            mem_bind: buf.unpack_str()?,
            mem_bind_type: buf.unpack_u16()?,
            task_dist: buf.unpack_u16()?,
            cpus_per_task: buf.unpack_u16()?,
            ntasks_per_node: buf.unpack_u16()?,
            num_tasks: buf.unpack_u32()?,
            job_min_procs: buf.unpack_u32()?,
            job_min_memory: buf.unpack_u32()?,
            job_min_tmp_disk: buf.unpack_u32()?,
            multi_core: MultiCore::unpack(buf)?,
            mail_type: buf.unpack_u16()?,
            mail_user: buf.unpack_str()?,
            alloc_node: buf.unpack_str()?,
            alloc_sid: buf.unpack_u32()?,
            resp_host: buf.unpack_str()?,
            alloc_resp_port: buf.unpack_u16()?,
            other_port: buf.unpack_u16()?,
            select_blob: buf.unpack_mem()?,
            spank_env: buf.unpack_str_array()?,
        })
    }
}

/// Node agent self-report at startup and on request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeRegistrationMsg {
    pub timestamp: UnixTime,
    pub node_name: String,
    pub cpus: u16,
    pub sockets: u16,
    pub cores: u16,
    pub threads: u16,
    pub real_memory: u32,
    pub tmp_disk: u32,
    pub up_time: u32,
    /// Jobs the node believes it is running (parallel arrays).
    pub job_ids: Vec<u32>,
    pub step_ids: Vec<u32>,
    /// Set on the first registration after node agent startup.
    pub startup: u16,
}

impl NodeRegistrationMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_time(self.timestamp);
        buf.pack_str(Some(&self.node_name));
        buf.pack_u16(self.cpus);
        buf.pack_u16(self.sockets);
        buf.pack_u16(self.cores);
        buf.pack_u16(self.threads);
        buf.pack_u32(self.real_memory);
        buf.pack_u32(self.tmp_disk);
        buf.pack_u32(self.up_time);
        buf.pack_u32_array(&self.job_ids);
        buf.pack_u32_array(&self.step_ids);
        buf.pack_u16(self.startup);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(NodeRegistrationMsg {
            timestamp: buf.unpack_time()?,
            node_name: buf.unpack_str_req()?,
            cpus: buf.unpack_u16()?,
            sockets: buf.unpack_u16()?,
            cores: buf.unpack_u16()?,
            threads: buf.unpack_u16()?,
            real_memory: buf.unpack_u32()?,
            tmp_disk: buf.unpack_u32()?,
            up_time: buf.unpack_u32()?,
            job_ids: buf.unpack_u32_array()?,
            step_ids: buf.unpack_u32_array()?,
            startup: buf.unpack_u16()?,
        })
    }
}

/// Generic "changed since" information request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LastUpdateMsg {
    pub last_update: UnixTime,
    pub show_flags: u16,
}

impl LastUpdateMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_time(self.last_update);
        buf.pack_u16(self.show_flags);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(LastUpdateMsg {
            last_update: buf.unpack_time()?,
            show_flags: buf.unpack_u16()?,
        })
    }
}

/// Client view of one job record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobInfoView {
    pub job_id: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub job_state: u16,
    pub batch_flag: u16,
    pub state_reason: u16,
    pub exit_code: u32,
    pub num_procs: u32,
    pub num_nodes: u32,
    pub time_limit: u32,
    pub submit_time: UnixTime,
    pub start_time: UnixTime,
    pub end_time: UnixTime,
    pub suspend_time: UnixTime,
    pub pre_sus_time: UnixTime,
    pub priority: u32,
    pub nice: u16,
    pub restart_cnt: u16,
    pub partition: Option<String>,
    pub name: Option<String>,
    pub account: Option<String>,
    pub wckey: Option<String>,
    pub nodes: Option<String>,
    pub req_nodes: Option<String>,
    pub exc_nodes: Option<String>,
    pub features: Option<String>,
    pub dependency: Option<String>,
    pub licenses: Option<String>,
    pub network: Option<String>,
    pub comment: Option<String>,
    pub state_desc: Option<String>,
    pub alloc_node: Option<String>,
    pub alloc_sid: u32,
    pub resv_name: Option<String>,
}

impl JobInfoView {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.user_id);
        buf.pack_u32(self.group_id);
        buf.pack_u16(self.job_state);
        buf.pack_u16(self.batch_flag);
        buf.pack_u16(self.state_reason);
        buf.pack_u32(self.exit_code);
        buf.pack_u32(self.num_procs);
        buf.pack_u32(self.num_nodes);
        buf.pack_u32(self.time_limit);
        buf.pack_time(self.submit_time);
        buf.pack_time(self.start_time);
        buf.pack_time(self.end_time);
        buf.pack_time(self.suspend_time);
        buf.pack_time(self.pre_sus_time);
        buf.pack_u32(self.priority);
        buf.pack_u16(self.nice);
        buf.pack_u16(self.restart_cnt);
        buf.pack_str(self.partition.as_deref());
        buf.pack_str(self.name.as_deref());
        buf.pack_str(self.account.as_deref());
        buf.pack_str(self.wckey.as_deref());
        buf.pack_str(self.nodes.as_deref());
        buf.pack_str(self.req_nodes.as_deref());
        buf.pack_str(self.exc_nodes.as_deref());
        buf.pack_str(self.features.as_deref());
        buf.pack_str(self.dependency.as_deref());
        buf.pack_str(self.licenses.as_deref());
        buf.pack_str(self.network.as_deref());
        buf.pack_str(self.comment.as_deref());
        buf.pack_str(self.state_desc.as_deref());
        buf.pack_str(self.alloc_node.as_deref());
        buf.pack_u32(self.alloc_sid);
        buf.pack_str(self.resv_name.as_deref());
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(JobInfoView {
            job_id: buf.unpack_u32()?,
            user_id: buf.unpack_u32()?,
            group_id: buf.unpack_u32()?,
            job_state: buf.unpack_u16()?,
            batch_flag: buf.unpack_u16()?,
            state_reason: buf.unpack_u16()?,
            exit_code: buf.unpack_u32()?,
            num_procs: buf.unpack_u32()?,
            num_nodes: buf.unpack_u32()?,
            time_limit: buf.unpack_u32()?,
            submit_time: buf.unpack_time()?,
            start_time: buf.unpack_time()?,
            end_time: buf.unpack_time()?,
            suspend_time: buf.unpack_time()?,
            pre_sus_time: buf.unpack_time()?,
            priority: buf.unpack_u32()?,
            nice: buf.unpack_u16()?,
            restart_cnt: buf.unpack_u16()?,
            partition: buf.unpack_str()?,
            name: buf.unpack_str()?,
            account: buf.unpack_str()?,
            wckey: buf.unpack_str()?,
            nodes: buf.unpack_str()?,
            req_nodes: buf.unpack_str()?,
            exc_nodes: buf.unpack_str()?,
            features: buf.unpack_str()?,
            dependency: buf.unpack_str()?,
            licenses: buf.unpack_str()?,
            network: buf.unpack_str()?,
            comment: buf.unpack_str()?,
            state_desc: buf.unpack_str()?,
            alloc_node: buf.unpack_str()?,
            alloc_sid: buf.unpack_u32()?,
            resv_name: buf.unpack_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobInfoMsg {
    pub last_update: UnixTime,
    pub jobs: Vec<JobInfoView>,
}

impl JobInfoMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_time(self.last_update);
        buf.pack_u32(self.jobs.len() as u32);
        for j in &self.jobs {
            j.pack(buf);
        }
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        let last_update = buf.unpack_time()?;
        let cnt = buf.unpack_u32()? as usize;
        if cnt > buf.remaining() {
            return Err(SchedError::Decode("job count exceeds buffer".into()));
        }
        let mut jobs = Vec::with_capacity(cnt);
        for _ in 0..cnt {
            jobs.push(JobInfoView::unpack(buf)?);
        }
        Ok(JobInfoMsg { last_update, jobs })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepInfoRequestMsg {
    pub last_update: UnixTime,
    pub job_id: u32,
    pub step_id: u32,
}

impl StepInfoRequestMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_time(self.last_update);
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(StepInfoRequestMsg {
            last_update: buf.unpack_time()?,
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
        })
    }
}

/// Client view of one step record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepInfoView {
    pub job_id: u32,
    pub step_id: u32,
    pub user_id: u32,
    pub start_time: UnixTime,
    pub num_tasks: u32,
    pub nodes: Option<String>,
    pub name: Option<String>,
    pub partition: Option<String>,
}

impl StepInfoView {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_u32(self.user_id);
        buf.pack_time(self.start_time);
        buf.pack_u32(self.num_tasks);
        buf.pack_str(self.nodes.as_deref());
        buf.pack_str(self.name.as_deref());
        buf.pack_str(self.partition.as_deref());
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(StepInfoView {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            user_id: buf.unpack_u32()?,
            start_time: buf.unpack_time()?,
            num_tasks: buf.unpack_u32()?,
            nodes: buf.unpack_str()?,
            name: buf.unpack_str()?,
            partition: buf.unpack_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepInfoMsg {
    pub last_update: UnixTime,
    pub steps: Vec<StepInfoView>,
}

impl StepInfoMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_time(self.last_update);
        buf.pack_u32(self.steps.len() as u32);
        for s in &self.steps {
            s.pack(buf);
        }
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        let last_update = buf.unpack_time()?;
        let cnt = buf.unpack_u32()? as usize;
        if cnt > buf.remaining() {
            return Err(SchedError::Decode("step count exceeds buffer".into()));
        }
        let mut steps = Vec::with_capacity(cnt);
        for _ in 0..cnt {
            steps.push(StepInfoView::unpack(buf)?);
        }
        Ok(StepInfoMsg { last_update, steps })
    }
}

/// Client view of one node record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeInfoView {
    pub name: String,
    pub state: u16,
    pub cpus: u16,
    pub sockets: u16,
    pub cores: u16,
    pub threads: u16,
    pub real_memory: u32,
    pub tmp_disk: u32,
    pub weight: u32,
    pub up_time: u32,
    pub features: Option<String>,
    pub reason: Option<String>,
}

impl NodeInfoView {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_str(Some(&self.name));
        buf.pack_u16(self.state);
        buf.pack_u16(self.cpus);
        buf.pack_u16(self.sockets);
        buf.pack_u16(self.cores);
        buf.pack_u16(self.threads);
        buf.pack_u32(self.real_memory);
        buf.pack_u32(self.tmp_disk);
        buf.pack_u32(self.weight);
        buf.pack_u32(self.up_time);
        buf.pack_str(self.features.as_deref());
        buf.pack_str(self.reason.as_deref());
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(NodeInfoView {
            name: buf.unpack_str_req()?,
            state: buf.unpack_u16()?,
            cpus: buf.unpack_u16()?,
            sockets: buf.unpack_u16()?,
            cores: buf.unpack_u16()?,
            threads: buf.unpack_u16()?,
            real_memory: buf.unpack_u32()?,
            tmp_disk: buf.unpack_u32()?,
            weight: buf.unpack_u32()?,
            up_time: buf.unpack_u32()?,
            features: buf.unpack_str()?,
            reason: buf.unpack_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeInfoMsg {
    pub last_update: UnixTime,
    pub nodes: Vec<NodeInfoView>,
}

impl NodeInfoMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_time(self.last_update);
        buf.pack_u32(self.nodes.len() as u32);
        for n in &self.nodes {
            n.pack(buf);
        }
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        let last_update = buf.unpack_time()?;
        let cnt = buf.unpack_u32()? as usize;
        if cnt > buf.remaining() {
            return Err(SchedError::Decode("node count exceeds buffer".into()));
        }
        let mut nodes = Vec::with_capacity(cnt);
        for _ in 0..cnt {
            nodes.push(NodeInfoView::unpack(buf)?);
        }
        Ok(NodeInfoMsg { last_update, nodes })
    }
}

/// Client view of one partition record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartInfoView {
    pub name: String,
    pub max_time: u32,
    pub max_nodes: u32,
    pub min_nodes: u32,
    pub total_nodes: u32,
    pub total_cpus: u32,
    pub priority: u16,
    pub default_part: u16,
    pub hidden: u16,
    pub root_only: u16,
    pub shared: u16,
    pub state_up: u16,
    pub nodes: Option<String>,
    pub allow_groups: Option<String>,
}

impl PartInfoView {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_str(Some(&self.name));
        buf.pack_u32(self.max_time);
        buf.pack_u32(self.max_nodes);
        buf.pack_u32(self.min_nodes);
        buf.pack_u32(self.total_nodes);
        buf.pack_u32(self.total_cpus);
        buf.pack_u16(self.priority);
        buf.pack_u16(self.default_part);
        buf.pack_u16(self.hidden);
        buf.pack_u16(self.root_only);
        buf.pack_u16(self.shared);
        buf.pack_u16(self.state_up);
        buf.pack_str(self.nodes.as_deref());
        buf.pack_str(self.allow_groups.as_deref());
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(PartInfoView {
            name: buf.unpack_str_req()?,
            max_time: buf.unpack_u32()?,
            max_nodes: buf.unpack_u32()?,
            min_nodes: buf.unpack_u32()?,
            total_nodes: buf.unpack_u32()?,
            total_cpus: buf.unpack_u32()?,
            priority: buf.unpack_u16()?,
            default_part: buf.unpack_u16()?,
            hidden: buf.unpack_u16()?,
            root_only: buf.unpack_u16()?,
            shared: buf.unpack_u16()?,
            state_up: buf.unpack_u16()?,
            nodes: buf.unpack_str()?,
            allow_groups: buf.unpack_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartInfoMsg {
    pub last_update: UnixTime,
    pub partitions: Vec<PartInfoView>,
}

impl PartInfoMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_time(self.last_update);
        buf.pack_u32(self.partitions.len() as u32);
        for p in &self.partitions {
            p.pack(buf);
        }
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        let last_update = buf.unpack_time()?;
        let cnt = buf.unpack_u32()? as usize;
        if cnt > buf.remaining() {
            return Err(SchedError::Decode("partition count exceeds buffer".into()));
        }
        let mut partitions = Vec::with_capacity(cnt);
        for _ in 0..cnt {
            partitions.push(PartInfoView::unpack(buf)?);
        }
        Ok(PartInfoMsg {
            last_update,
            partitions,
        })
    }
}

/// Controller configuration summary for clients.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildInfoMsg {
    pub last_update: UnixTime,
    pub cluster_name: String,
    pub max_job_cnt: u32,
    pub min_job_age: u32,
    pub kill_wait: u32,
    pub msg_timeout: u32,
    pub inactive_limit: u32,
    pub over_time_limit: u32,
    pub first_job_id: u32,
    pub accounting_enforce: u16,
    pub preempt_mode: u16,
    pub fast_schedule: u16,
    pub enforce_part_limits: u16,
}

impl BuildInfoMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_time(self.last_update);
        buf.pack_str(Some(&self.cluster_name));
        buf.pack_u32(self.max_job_cnt);
        buf.pack_u32(self.min_job_age);
        buf.pack_u32(self.kill_wait);
        buf.pack_u32(self.msg_timeout);
        buf.pack_u32(self.inactive_limit);
        buf.pack_u32(self.over_time_limit);
        buf.pack_u32(self.first_job_id);
        buf.pack_u16(self.accounting_enforce);
        buf.pack_u16(self.preempt_mode);
        buf.pack_u16(self.fast_schedule);
        buf.pack_u16(self.enforce_part_limits);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(BuildInfoMsg {
            last_update: buf.unpack_time()?,
            cluster_name: buf.unpack_str_req()?,
            max_job_cnt: buf.unpack_u32()?,
            min_job_age: buf.unpack_u32()?,
            kill_wait: buf.unpack_u32()?,
            msg_timeout: buf.unpack_u32()?,
            inactive_limit: buf.unpack_u32()?,
            over_time_limit: buf.unpack_u32()?,
            first_job_id: buf.unpack_u32()?,
            accounting_enforce: buf.unpack_u16()?,
            preempt_mode: buf.unpack_u16()?,
            fast_schedule: buf.unpack_u16()?,
            enforce_part_limits: buf.unpack_u16()?,
        })
    }
}

/// Allocation grant, also reused for allocation-info queries.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceAllocationMsg {
    pub job_id: u32,
    pub error_code: u32,
    pub node_list: Option<String>,
    pub cpus_per_node: Vec<u32>,
    pub cpu_count_reps: Vec<u32>,
    pub node_cnt: u32,
    pub node_addrs: Vec<SocketAddrV4>,
}

impl ResourceAllocationMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.error_code);
        buf.pack_str(self.node_list.as_deref());
        buf.pack_u32_array(&self.cpus_per_node);
        buf.pack_u32_array(&self.cpu_count_reps);
        buf.pack_u32(self.node_cnt);
        buf.pack_u32(self.node_addrs.len() as u32);
        for a in &self.node_addrs {
            buf.pack_addr(*a);
        }
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        let job_id = buf.unpack_u32()?;
        let error_code = buf.unpack_u32()?;
        let node_list = buf.unpack_str()?;
        let cpus_per_node = buf.unpack_u32_array()?;
        let cpu_count_reps = buf.unpack_u32_array()?;
        let node_cnt = buf.unpack_u32()?;
        let addr_cnt = buf.unpack_u32()? as usize;
        if addr_cnt * 6 > buf.remaining() {
            return Err(SchedError::Decode("address count exceeds buffer".into()));
        }
        let mut node_addrs = Vec::with_capacity(addr_cnt);
        for _ in 0..addr_cnt {
            node_addrs.push(buf.unpack_addr()?);
        }
        Ok(ResourceAllocationMsg {
            job_id,
            error_code,
            node_list,
            cpus_per_node,
            cpu_count_reps,
            node_cnt,
            node_addrs,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubmitResponseMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub error_code: u32,
}

impl SubmitResponseMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_u32(self.error_code);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(SubmitResponseMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            error_code: buf.unpack_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WillRunMsg {
    pub job_id: u32,
    pub start_time: UnixTime,
    pub node_list: Option<String>,
}

impl WillRunMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_time(self.start_time);
        buf.pack_str(self.node_list.as_deref());
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(WillRunMsg {
            job_id: buf.unpack_u32()?,
            start_time: buf.unpack_time()?,
            node_list: buf.unpack_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobIdMsg {
    pub job_id: u32,
}

impl JobIdMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(JobIdMsg {
            job_id: buf.unpack_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReturnCodeMsg {
    pub return_code: u32,
}

impl ReturnCodeMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.return_code);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(ReturnCodeMsg {
            return_code: buf.unpack_u32()?,
        })
    }
}

/// Suspend/resume operation codes.
pub const SUSPEND_JOB: u16 = 0;
pub const RESUME_JOB: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SuspendMsg {
    /// SUSPEND_JOB or RESUME_JOB.
    pub op: u16,
    pub job_id: u32,
}

impl SuspendMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u16(self.op);
        buf.pack_u32(self.job_id);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(SuspendMsg {
            op: buf.unpack_u16()?,
            job_id: buf.unpack_u32()?,
        })
    }
}

/// Checkpoint operation codes.
pub const CHECK_ABLE: u16 = 0;
pub const CHECK_DISABLE: u16 = 1;
pub const CHECK_ENABLE: u16 = 2;
pub const CHECK_CREATE: u16 = 3;
pub const CHECK_VACATE: u16 = 4;
pub const CHECK_RESTART: u16 = 5;
pub const CHECK_ERROR: u16 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointMsg {
    pub op: u16,
    pub data: u16,
    pub job_id: u32,
    pub step_id: u32,
    pub image_dir: Option<String>,
}

impl CheckpointMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u16(self.op);
        buf.pack_u16(self.data);
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_str(self.image_dir.as_deref());
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(CheckpointMsg {
            op: buf.unpack_u16()?,
            data: buf.unpack_u16()?,
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            image_dir: buf.unpack_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckpointRespMsg {
    pub event_time: UnixTime,
    pub error_code: u32,
    pub error_msg: Option<String>,
}

impl CheckpointRespMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_time(self.event_time);
        buf.pack_u32(self.error_code);
        buf.pack_str(self.error_msg.as_deref());
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(CheckpointRespMsg {
            event_time: buf.unpack_time()?,
            error_code: buf.unpack_u32()?,
            error_msg: buf.unpack_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CancelJobStepMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub signal: u16,
    pub batch_flag: u16,
}

impl CancelJobStepMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_u16(self.signal);
        buf.pack_u16(self.batch_flag);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(CancelJobStepMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            signal: buf.unpack_u16()?,
            batch_flag: buf.unpack_u16()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompleteJobAllocMsg {
    pub job_id: u32,
    pub rc: u32,
}

impl CompleteJobAllocMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.rc);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(CompleteJobAllocMsg {
            job_id: buf.unpack_u32()?,
            rc: buf.unpack_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompleteBatchScriptMsg {
    pub job_id: u32,
    /// Exit status of the batch script.
    pub job_rc: u32,
    /// Node-agent internal status (nonzero = launch infrastructure
    /// failure, the job is requeued or failed).
    pub node_rc: u32,
    pub node_name: String,
}

impl CompleteBatchScriptMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.job_rc);
        buf.pack_u32(self.node_rc);
        buf.pack_str(Some(&self.node_name));
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(CompleteBatchScriptMsg {
            job_id: buf.unpack_u32()?,
            job_rc: buf.unpack_u32()?,
            node_rc: buf.unpack_u32()?,
            node_name: buf.unpack_str_req()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepIdMsg {
    pub job_id: u32,
    pub step_id: u32,
}

impl StepIdMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(StepIdMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepLayoutMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub node_list: Option<String>,
    pub node_cnt: u32,
    pub task_cnt: u32,
    pub tasks_per_node: Vec<u32>,
}

impl StepLayoutMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_str(self.node_list.as_deref());
        buf.pack_u32(self.node_cnt);
        buf.pack_u32(self.task_cnt);
        buf.pack_u32_array(&self.tasks_per_node);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(StepLayoutMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            node_list: buf.unpack_str()?,
            node_cnt: buf.unpack_u32()?,
            task_cnt: buf.unpack_u32()?,
            tasks_per_node: buf.unpack_u32_array()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StepCompleteMsg {
    pub job_id: u32,
    pub step_id: u32,
    /// Node index range within the step that completed.
    pub range_first: u32,
    pub range_last: u32,
    pub step_rc: u32,
}

impl StepCompleteMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_u32(self.range_first);
        buf.pack_u32(self.range_last);
        buf.pack_u32(self.step_rc);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(StepCompleteMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            range_first: buf.unpack_u32()?,
            range_last: buf.unpack_u32()?,
            step_rc: buf.unpack_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EpilogCompleteMsg {
    pub job_id: u32,
    pub return_code: u32,
    pub node_name: String,
}

impl EpilogCompleteMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.return_code);
        buf.pack_str(Some(&self.node_name));
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(EpilogCompleteMsg {
            job_id: buf.unpack_u32()?,
            return_code: buf.unpack_u32()?,
            node_name: buf.unpack_str_req()?,
        })
    }
}

/// pid → job id lookup from a node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobIdRequestMsg {
    pub job_pid: u32,
}

impl JobIdRequestMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_pid);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(JobIdRequestMsg {
            job_pid: buf.unpack_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobIdResponseMsg {
    pub job_id: u32,
    pub return_code: u32,
}

impl JobIdResponseMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.return_code);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(JobIdResponseMsg {
            job_id: buf.unpack_u32()?,
            return_code: buf.unpack_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileBcastMsg {
    pub fname: String,
    pub block_no: u32,
    pub last_block: u16,
    pub force: u16,
    pub modes: u16,
    pub uid: u32,
    pub gid: u32,
    pub atime: UnixTime,
    pub mtime: UnixTime,
    pub data: Vec<u8>,
}

impl FileBcastMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_str(Some(&self.fname));
        buf.pack_u32(self.block_no);
        buf.pack_u16(self.last_block);
        buf.pack_u16(self.force);
        buf.pack_u16(self.modes);
        buf.pack_u32(self.uid);
        buf.pack_u32(self.gid);
        buf.pack_time(self.atime);
        buf.pack_time(self.mtime);
        buf.pack_mem(&self.data);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(FileBcastMsg {
            fname: buf.unpack_str_req()?,
            block_no: buf.unpack_u32()?,
            last_block: buf.unpack_u16()?,
            force: buf.unpack_u16()?,
            modes: buf.unpack_u16()?,
            uid: buf.unpack_u32()?,
            gid: buf.unpack_u32()?,
            atime: buf.unpack_time()?,
            mtime: buf.unpack_time()?,
            data: buf.unpack_mem()?,
        })
    }
}

/// Aggregated per-step accounting sample.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatJobAcctMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub num_tasks: u32,
    pub user_cpu_sec: u32,
    pub sys_cpu_sec: u32,
    pub max_rss: u32,
}

impl StatJobAcctMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_u32(self.num_tasks);
        buf.pack_u32(self.user_cpu_sec);
        buf.pack_u32(self.sys_cpu_sec);
        buf.pack_u32(self.max_rss);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(StatJobAcctMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            num_tasks: buf.unpack_u32()?,
            user_cpu_sec: buf.unpack_u32()?,
            sys_cpu_sec: buf.unpack_u32()?,
            max_rss: buf.unpack_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LaunchTasksMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub uid: u32,
    pub gid: u32,
    pub ntasks: u32,
    pub argv: Vec<String>,
    pub environment: Vec<String>,
    pub cwd: Option<String>,
    pub nodes: Option<String>,
    pub cred: Vec<u8>,
}

impl LaunchTasksMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_u32(self.uid);
        buf.pack_u32(self.gid);
        buf.pack_u32(self.ntasks);
        buf.pack_str_array(&self.argv);
        buf.pack_str_array(&self.environment);
        buf.pack_str(self.cwd.as_deref());
        buf.pack_str(self.nodes.as_deref());
        buf.pack_mem(&self.cred);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(LaunchTasksMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            uid: buf.unpack_u32()?,
            gid: buf.unpack_u32()?,
            ntasks: buf.unpack_u32()?,
            argv: buf.unpack_str_array()?,
            environment: buf.unpack_str_array()?,
            cwd: buf.unpack_str()?,
            nodes: buf.unpack_str()?,
            cred: buf.unpack_mem()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalTasksMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub signal: u32,
}

impl SignalTasksMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_u32(self.signal);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(SignalTasksMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            signal: buf.unpack_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalJobMsg {
    pub job_id: u32,
    pub signal: u32,
}

impl SignalJobMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.signal);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(SignalJobMsg {
            job_id: buf.unpack_u32()?,
            signal: buf.unpack_u32()?,
        })
    }
}

/// Terminate / kill-timelimit / abort message to node agents.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KillJobMsg {
    pub job_id: u32,
    pub job_uid: u32,
    pub nodes: Option<String>,
    pub end_time: UnixTime,
}

impl KillJobMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.job_uid);
        buf.pack_str(self.nodes.as_deref());
        buf.pack_time(self.end_time);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(KillJobMsg {
            job_id: buf.unpack_u32()?,
            job_uid: buf.unpack_u32()?,
            nodes: buf.unpack_str()?,
            end_time: buf.unpack_time()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateJobTimeMsg {
    pub job_id: u32,
    pub expiration_time: UnixTime,
}

impl UpdateJobTimeMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_time(self.expiration_time);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(UpdateJobTimeMsg {
            job_id: buf.unpack_u32()?,
            expiration_time: buf.unpack_time()?,
        })
    }
}

/// Batch job launch request to the lead node agent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchJobLaunchMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub uid: u32,
    pub gid: u32,
    pub nprocs: u32,
    pub cpus_per_node: Vec<u32>,
    pub cpu_count_reps: Vec<u32>,
    pub nodes: Option<String>,
    pub script: Option<String>,
    pub stderr: Option<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub work_dir: Option<String>,
    pub restart_dir: Option<String>,
    pub argv: Vec<String>,
    pub environment: Vec<String>,
    pub overcommit: u8,
    pub open_mode: u8,
    pub acctg_freq: u16,
    pub cred: Vec<u8>,
    pub select_blob: Vec<u8>,
}

impl BatchJobLaunchMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_u32(self.uid);
        buf.pack_u32(self.gid);
        buf.pack_u32(self.nprocs);
        buf.pack_u32_array(&self.cpus_per_node);
        buf.pack_u32_array(&self.cpu_count_reps);
        buf.pack_str(self.nodes.as_deref());
        buf.pack_str(self.script.as_deref());
        buf.pack_str(self.stderr.as_deref());
        buf.pack_str(self.stdin.as_deref());
        buf.pack_str(self.stdout.as_deref());
        buf.pack_str(self.work_dir.as_deref());
        buf.pack_str(self.restart_dir.as_deref());
        buf.pack_str_array(&self.argv);
        buf.pack_str_array(&self.environment);
        buf.pack_u8(self.overcommit);
        buf.pack_u8(self.open_mode);
        buf.pack_u16(self.acctg_freq);
        buf.pack_mem(&self.cred);
        buf.pack_mem(&self.select_blob);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(BatchJobLaunchMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            uid: buf.unpack_u32()?,
            gid: buf.unpack_u32()?,
            nprocs: buf.unpack_u32()?,
            cpus_per_node: buf.unpack_u32_array()?,
            cpu_count_reps: buf.unpack_u32_array()?,
            nodes: buf.unpack_str()?,
            script: buf.unpack_str()?,
            stderr: buf.unpack_str()?,
            stdin: buf.unpack_str()?,
            stdout: buf.unpack_str()?,
            work_dir: buf.unpack_str()?,
            restart_dir: buf.unpack_str()?,
            argv: buf.unpack_str_array()?,
            environment: buf.unpack_str_array()?,
            overcommit: buf.unpack_u8()?,
            open_mode: buf.unpack_u8()?,
            acctg_freq: buf.unpack_u16()?,
            cred: buf.unpack_mem()?,
            select_blob: buf.unpack_mem()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SrunJobMsg {
    pub job_id: u32,
    pub step_id: u32,
}

impl SrunJobMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(SrunJobMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SrunTimeoutMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub timeout: UnixTime,
}

impl SrunTimeoutMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_time(self.timeout);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(SrunTimeoutMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            timeout: buf.unpack_time()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SrunNodeFailMsg {
    pub job_id: u32,
    pub step_id: u32,
    pub nodelist: Option<String>,
}

impl SrunNodeFailMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u32(self.job_id);
        buf.pack_u32(self.step_id);
        buf.pack_str(self.nodelist.as_deref());
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(SrunNodeFailMsg {
            job_id: buf.unpack_u32()?,
            step_id: buf.unpack_u32()?,
            nodelist: buf.unpack_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShutdownMsg {
    pub options: u16,
}

impl ShutdownMsg {
    fn pack(&self, buf: &mut PackBuf) {
        buf.pack_u16(self.options);
    }

    fn unpack(buf: &mut UnpackBuf) -> SchedResult<Self> {
        Ok(ShutdownMsg {
            options: buf.unpack_u16()?,
        })
    }
}

/// The tagged union of every RPC body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RequestNodeRegistrationStatus,
    NodeRegistration(NodeRegistrationMsg),
    RequestReconfigure,
    RequestShutdown(ShutdownMsg),
    RequestPing,
    RequestBuildInfo(LastUpdateMsg),
    ResponseBuildInfo(BuildInfoMsg),
    RequestJobInfo(LastUpdateMsg),
    ResponseJobInfo(JobInfoMsg),
    RequestJobStepInfo(StepInfoRequestMsg),
    ResponseJobStepInfo(StepInfoMsg),
    RequestNodeInfo(LastUpdateMsg),
    ResponseNodeInfo(NodeInfoMsg),
    RequestPartitionInfo(LastUpdateMsg),
    ResponsePartitionInfo(PartInfoMsg),
    RequestResourceAllocation(JobDescMsg),
    ResponseResourceAllocation(ResourceAllocationMsg),
    RequestSubmitBatchJob(JobDescMsg),
    ResponseSubmitBatchJob(SubmitResponseMsg),
    RequestBatchJobLaunch(BatchJobLaunchMsg),
    RequestCancelJobStep(CancelJobStepMsg),
    RequestUpdateJob(JobDescMsg),
    RequestJobWillRun(JobDescMsg),
    ResponseJobWillRun(WillRunMsg),
    RequestJobAllocationInfo(JobIdMsg),
    RequestJobAllocationInfoLite(JobIdMsg),
    RequestJobEndTime(JobIdMsg),
    RequestJobReady(JobIdMsg),
    ResponseJobReady(ReturnCodeMsg),
    RequestSuspend(SuspendMsg),
    RequestJobRequeue(JobIdMsg),
    RequestCheckpoint(CheckpointMsg),
    ResponseCheckpoint(CheckpointRespMsg),
    RequestCompleteJobAllocation(CompleteJobAllocMsg),
    RequestCompleteBatchScript(CompleteBatchScriptMsg),
    RequestStepLayout(StepIdMsg),
    ResponseStepLayout(StepLayoutMsg),
    RequestStepComplete(StepCompleteMsg),
    MessageEpilogComplete(EpilogCompleteMsg),
    RequestJobId(JobIdRequestMsg),
    ResponseJobId(JobIdResponseMsg),
    RequestFileBcast(FileBcastMsg),
    RequestStatJobAcct(StepIdMsg),
    ResponseStatJobAcct(StatJobAcctMsg),
    RequestLaunchTasks(LaunchTasksMsg),
    RequestSignalTasks(SignalTasksMsg),
    RequestTerminateTasks(SignalTasksMsg),
    RequestSignalJob(SignalJobMsg),
    RequestTerminateJob(KillJobMsg),
    RequestKillTimelimit(KillJobMsg),
    RequestAbortJob(KillJobMsg),
    RequestUpdateJobTime(UpdateJobTimeMsg),
    SrunPing(SrunJobMsg),
    SrunTimeout(SrunTimeoutMsg),
    SrunNodeFail(SrunNodeFailMsg),
    SrunJobComplete(SrunJobMsg),
    ResponseReturnCode(ReturnCodeMsg),
    ResponseForwardFailed,
}

impl Message {
    /// The wire tag for this body.
    pub fn msg_type(&self) -> MsgType {
        use Message::*;
        match self {
            RequestNodeRegistrationStatus => MsgType::RequestNodeRegistrationStatus,
            NodeRegistration(_) => MsgType::MessageNodeRegistration,
            RequestReconfigure => MsgType::RequestReconfigure,
            RequestShutdown(_) => MsgType::RequestShutdown,
            RequestPing => MsgType::RequestPing,
            RequestBuildInfo(_) => MsgType::RequestBuildInfo,
            ResponseBuildInfo(_) => MsgType::ResponseBuildInfo,
            RequestJobInfo(_) => MsgType::RequestJobInfo,
            ResponseJobInfo(_) => MsgType::ResponseJobInfo,
            RequestJobStepInfo(_) => MsgType::RequestJobStepInfo,
            ResponseJobStepInfo(_) => MsgType::ResponseJobStepInfo,
            RequestNodeInfo(_) => MsgType::RequestNodeInfo,
            ResponseNodeInfo(_) => MsgType::ResponseNodeInfo,
            RequestPartitionInfo(_) => MsgType::RequestPartitionInfo,
            ResponsePartitionInfo(_) => MsgType::ResponsePartitionInfo,
            RequestResourceAllocation(_) => MsgType::RequestResourceAllocation,
            ResponseResourceAllocation(_) => MsgType::ResponseResourceAllocation,
            RequestSubmitBatchJob(_) => MsgType::RequestSubmitBatchJob,
            ResponseSubmitBatchJob(_) => MsgType::ResponseSubmitBatchJob,
            RequestBatchJobLaunch(_) => MsgType::RequestBatchJobLaunch,
            RequestCancelJobStep(_) => MsgType::RequestCancelJobStep,
            RequestUpdateJob(_) => MsgType::RequestUpdateJob,
            RequestJobWillRun(_) => MsgType::RequestJobWillRun,
            ResponseJobWillRun(_) => MsgType::ResponseJobWillRun,
            RequestJobAllocationInfo(_) => MsgType::RequestJobAllocationInfo,
            RequestJobAllocationInfoLite(_) => MsgType::RequestJobAllocationInfoLite,
            RequestJobEndTime(_) => MsgType::RequestJobEndTime,
            RequestJobReady(_) => MsgType::RequestJobReady,
            ResponseJobReady(_) => MsgType::ResponseJobReady,
            RequestSuspend(_) => MsgType::RequestSuspend,
            RequestJobRequeue(_) => MsgType::RequestJobRequeue,
            RequestCheckpoint(_) => MsgType::RequestCheckpoint,
            ResponseCheckpoint(_) => MsgType::ResponseCheckpoint,
            RequestCompleteJobAllocation(_) => MsgType::RequestCompleteJobAllocation,
            RequestCompleteBatchScript(_) => MsgType::RequestCompleteBatchScript,
            RequestStepLayout(_) => MsgType::RequestStepLayout,
            ResponseStepLayout(_) => MsgType::ResponseStepLayout,
            RequestStepComplete(_) => MsgType::RequestStepComplete,
            MessageEpilogComplete(_) => MsgType::MessageEpilogComplete,
            RequestJobId(_) => MsgType::RequestJobId,
            ResponseJobId(_) => MsgType::ResponseJobId,
            RequestFileBcast(_) => MsgType::RequestFileBcast,
            RequestStatJobAcct(_) => MsgType::RequestStatJobAcct,
            ResponseStatJobAcct(_) => MsgType::ResponseStatJobAcct,
            RequestLaunchTasks(_) => MsgType::RequestLaunchTasks,
            RequestSignalTasks(_) => MsgType::RequestSignalTasks,
            RequestTerminateTasks(_) => MsgType::RequestTerminateTasks,
            RequestSignalJob(_) => MsgType::RequestSignalJob,
            RequestTerminateJob(_) => MsgType::RequestTerminateJob,
            RequestKillTimelimit(_) => MsgType::RequestKillTimelimit,
            RequestAbortJob(_) => MsgType::RequestAbortJob,
            RequestUpdateJobTime(_) => MsgType::RequestUpdateJobTime,
            SrunPing(_) => MsgType::SrunPing,
            SrunTimeout(_) => MsgType::SrunTimeout,
            SrunNodeFail(_) => MsgType::SrunNodeFail,
            SrunJobComplete(_) => MsgType::SrunJobComplete,
            ResponseReturnCode(_) => MsgType::ResponseReturnCode,
            ResponseForwardFailed => MsgType::ResponseForwardFailed,
        }
    }

    /// A bare return-code response.
    pub fn rc(code: u32) -> Message {
        Message::ResponseReturnCode(ReturnCodeMsg { return_code: code })
    }

    /// Serialize the body (header not included).
    pub fn pack_body(&self, buf: &mut PackBuf) {
        use Message::*;
        match self {
            RequestNodeRegistrationStatus
            | RequestReconfigure
            | RequestPing
            | ResponseForwardFailed => {}
            NodeRegistration(m) => m.pack(buf),
            RequestShutdown(m) => m.pack(buf),
            RequestBuildInfo(m) | RequestJobInfo(m) | RequestNodeInfo(m)
            | RequestPartitionInfo(m) => m.pack(buf),
            ResponseBuildInfo(m) => m.pack(buf),
            ResponseJobInfo(m) => m.pack(buf),
            RequestJobStepInfo(m) => m.pack(buf),
            ResponseJobStepInfo(m) => m.pack(buf),
            ResponseNodeInfo(m) => m.pack(buf),
            ResponsePartitionInfo(m) => m.pack(buf),
            RequestResourceAllocation(m) | RequestSubmitBatchJob(m) | RequestUpdateJob(m)
            | RequestJobWillRun(m) => m.pack(buf),
            ResponseResourceAllocation(m) => m.pack(buf),
            ResponseSubmitBatchJob(m) => m.pack(buf),
            RequestBatchJobLaunch(m) => m.pack(buf),
            RequestCancelJobStep(m) => m.pack(buf),
            ResponseJobWillRun(m) => m.pack(buf),
            RequestJobAllocationInfo(m) | RequestJobAllocationInfoLite(m)
            | RequestJobEndTime(m) | RequestJobReady(m) | RequestJobRequeue(m) => m.pack(buf),
            ResponseJobReady(m) | ResponseReturnCode(m) => m.pack(buf),
            RequestSuspend(m) => m.pack(buf),
            RequestCheckpoint(m) => m.pack(buf),
            ResponseCheckpoint(m) => m.pack(buf),
            RequestCompleteJobAllocation(m) => m.pack(buf),
            RequestCompleteBatchScript(m) => m.pack(buf),
            RequestStepLayout(m) | RequestStatJobAcct(m) => m.pack(buf),
            ResponseStepLayout(m) => m.pack(buf),
            RequestStepComplete(m) => m.pack(buf),
            MessageEpilogComplete(m) => m.pack(buf),
            RequestJobId(m) => m.pack(buf),
            ResponseJobId(m) => m.pack(buf),
            RequestFileBcast(m) => m.pack(buf),
            ResponseStatJobAcct(m) => m.pack(buf),
            RequestLaunchTasks(m) => m.pack(buf),
            RequestSignalTasks(m) | RequestTerminateTasks(m) => m.pack(buf),
            RequestSignalJob(m) => m.pack(buf),
            RequestTerminateJob(m) | RequestKillTimelimit(m) | RequestAbortJob(m) => m.pack(buf),
            RequestUpdateJobTime(m) => m.pack(buf),
            SrunPing(m) | SrunJobComplete(m) => m.pack(buf),
            SrunTimeout(m) => m.pack(buf),
            SrunNodeFail(m) => m.pack(buf),
        }
    }

    /// Decode a body of the given type.
    pub fn unpack_body(msg_type: MsgType, buf: &mut UnpackBuf) -> SchedResult<Message> {
        use Message::*;
        Ok(match msg_type {
            MsgType::RequestNodeRegistrationStatus => RequestNodeRegistrationStatus,
            MsgType::MessageNodeRegistration => {
                NodeRegistration(NodeRegistrationMsg::unpack(buf)?)
            }
            MsgType::RequestReconfigure => RequestReconfigure,
            MsgType::RequestShutdown => RequestShutdown(ShutdownMsg::unpack(buf)?),
            MsgType::RequestPing => RequestPing,
            MsgType::RequestBuildInfo => RequestBuildInfo(LastUpdateMsg::unpack(buf)?),
            MsgType::ResponseBuildInfo => ResponseBuildInfo(BuildInfoMsg::unpack(buf)?),
            MsgType::RequestJobInfo => RequestJobInfo(LastUpdateMsg::unpack(buf)?),
            MsgType::ResponseJobInfo => ResponseJobInfo(JobInfoMsg::unpack(buf)?),
            MsgType::RequestJobStepInfo => RequestJobStepInfo(StepInfoRequestMsg::unpack(buf)?),
            MsgType::ResponseJobStepInfo => ResponseJobStepInfo(StepInfoMsg::unpack(buf)?),
            MsgType::RequestNodeInfo => RequestNodeInfo(LastUpdateMsg::unpack(buf)?),
            MsgType::ResponseNodeInfo => ResponseNodeInfo(NodeInfoMsg::unpack(buf)?),
            MsgType::RequestPartitionInfo => RequestPartitionInfo(LastUpdateMsg::unpack(buf)?),
            MsgType::ResponsePartitionInfo => ResponsePartitionInfo(PartInfoMsg::unpack(buf)?),
            MsgType::RequestResourceAllocation => {
                RequestResourceAllocation(JobDescMsg::unpack(buf)?)
            }
            MsgType::ResponseResourceAllocation => {
                ResponseResourceAllocation(ResourceAllocationMsg::unpack(buf)?)
            }
            MsgType::RequestSubmitBatchJob => RequestSubmitBatchJob(JobDescMsg::unpack(buf)?),
            MsgType::ResponseSubmitBatchJob => {
                ResponseSubmitBatchJob(SubmitResponseMsg::unpack(buf)?)
            }
            MsgType::RequestBatchJobLaunch => {
                RequestBatchJobLaunch(BatchJobLaunchMsg::unpack(buf)?)
            }
            MsgType::RequestCancelJobStep => RequestCancelJobStep(CancelJobStepMsg::unpack(buf)?),
            MsgType::RequestUpdateJob => RequestUpdateJob(JobDescMsg::unpack(buf)?),
            MsgType::RequestJobWillRun => RequestJobWillRun(JobDescMsg::unpack(buf)?),
            MsgType::ResponseJobWillRun => ResponseJobWillRun(WillRunMsg::unpack(buf)?),
            MsgType::RequestJobAllocationInfo => RequestJobAllocationInfo(JobIdMsg::unpack(buf)?),
            MsgType::RequestJobAllocationInfoLite => {
                RequestJobAllocationInfoLite(JobIdMsg::unpack(buf)?)
            }
            MsgType::RequestJobEndTime => RequestJobEndTime(JobIdMsg::unpack(buf)?),
            MsgType::RequestJobReady => RequestJobReady(JobIdMsg::unpack(buf)?),
            MsgType::ResponseJobReady => ResponseJobReady(ReturnCodeMsg::unpack(buf)?),
            MsgType::RequestSuspend => RequestSuspend(SuspendMsg::unpack(buf)?),
            MsgType::RequestJobRequeue => RequestJobRequeue(JobIdMsg::unpack(buf)?),
            MsgType::RequestCheckpoint => RequestCheckpoint(CheckpointMsg::unpack(buf)?),
            MsgType::ResponseCheckpoint => ResponseCheckpoint(CheckpointRespMsg::unpack(buf)?),
            MsgType::RequestCompleteJobAllocation => {
                RequestCompleteJobAllocation(CompleteJobAllocMsg::unpack(buf)?)
            }
            MsgType::RequestCompleteBatchScript => {
                RequestCompleteBatchScript(CompleteBatchScriptMsg::unpack(buf)?)
            }
            MsgType::RequestStepLayout => RequestStepLayout(StepIdMsg::unpack(buf)?),
            MsgType::ResponseStepLayout => ResponseStepLayout(StepLayoutMsg::unpack(buf)?),
            MsgType::RequestStepComplete => RequestStepComplete(StepCompleteMsg::unpack(buf)?),
            MsgType::MessageEpilogComplete => {
                MessageEpilogComplete(EpilogCompleteMsg::unpack(buf)?)
            }
            MsgType::RequestJobId => RequestJobId(JobIdRequestMsg::unpack(buf)?),
            MsgType::ResponseJobId => ResponseJobId(JobIdResponseMsg::unpack(buf)?),
            MsgType::RequestFileBcast => RequestFileBcast(FileBcastMsg::unpack(buf)?),
            MsgType::RequestStatJobAcct => RequestStatJobAcct(StepIdMsg::unpack(buf)?),
            MsgType::ResponseStatJobAcct => ResponseStatJobAcct(StatJobAcctMsg::unpack(buf)?),
            MsgType::RequestLaunchTasks => RequestLaunchTasks(LaunchTasksMsg::unpack(buf)?),
            MsgType::RequestSignalTasks => RequestSignalTasks(SignalTasksMsg::unpack(buf)?),
            MsgType::RequestTerminateTasks => RequestTerminateTasks(SignalTasksMsg::unpack(buf)?),
            MsgType::RequestSignalJob => RequestSignalJob(SignalJobMsg::unpack(buf)?),
            MsgType::RequestTerminateJob => RequestTerminateJob(KillJobMsg::unpack(buf)?),
            MsgType::RequestKillTimelimit => RequestKillTimelimit(KillJobMsg::unpack(buf)?),
            MsgType::RequestAbortJob => RequestAbortJob(KillJobMsg::unpack(buf)?),
            MsgType::RequestUpdateJobTime => RequestUpdateJobTime(UpdateJobTimeMsg::unpack(buf)?),
            MsgType::SrunPing => SrunPing(SrunJobMsg::unpack(buf)?),
            MsgType::SrunTimeout => SrunTimeout(SrunTimeoutMsg::unpack(buf)?),
            MsgType::SrunNodeFail => SrunNodeFail(SrunNodeFailMsg::unpack(buf)?),
            MsgType::SrunJobComplete => SrunJobComplete(SrunJobMsg::unpack(buf)?),
            MsgType::ResponseReturnCode => ResponseReturnCode(ReturnCodeMsg::unpack(buf)?),
            MsgType::ResponseForwardFailed => ResponseForwardFailed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let mut buf = PackBuf::new();
        msg.pack_body(&mut buf);
        let data = buf.into_vec();
        let mut u = UnpackBuf::new(&data);
        let back = Message::unpack_body(msg.msg_type(), &mut u).unwrap();
        assert_eq!(back, msg);
        assert_eq!(u.remaining(), 0);
    }

    #[test]
    fn test_job_desc_round_trip_populated() {
        let mut desc = JobDescMsg::default();
        desc.user_id = 500;
        desc.name = Some("bench".into());
        desc.partition = Some("debug".into());
        desc.dependency = Some("afterok:12".into());
        desc.argv = vec!["./run".into(), "--fast".into()];
        desc.environment = vec!["PATH=/bin".into()];
        desc.script = Some("#!/bin/sh\nexit 0\n".into());
        desc.select_blob = vec![1, 2, 3];
        desc.min_nodes = 2;
        desc.num_procs = 4;
        round_trip(Message::RequestSubmitBatchJob(desc));
    }

    #[test]
    fn test_job_desc_round_trip_empty() {
        round_trip(Message::RequestSubmitBatchJob(JobDescMsg::default()));
    }

    #[test]
    fn test_small_bodies_round_trip() {
        round_trip(Message::RequestPing);
        round_trip(Message::rc(6001));
        round_trip(Message::RequestSuspend(SuspendMsg {
            op: RESUME_JOB,
            job_id: 9,
        }));
        round_trip(Message::MessageEpilogComplete(EpilogCompleteMsg {
            job_id: 3,
            return_code: 0,
            node_name: "n0".into(),
        }));
        round_trip(Message::RequestCompleteBatchScript(CompleteBatchScriptMsg {
            job_id: 42,
            job_rc: 0,
            node_rc: 0,
            node_name: "n1".into(),
        }));
        round_trip(Message::SrunNodeFail(SrunNodeFailMsg {
            job_id: 1,
            step_id: NO_VAL,
            nodelist: Some("n2".into()),
        }));
    }

    #[test]
    fn test_launch_round_trip() {
        let mut launch = BatchJobLaunchMsg::default();
        launch.job_id = 42;
        launch.step_id = NO_VAL;
        launch.cpus_per_node = vec![2];
        launch.cpu_count_reps = vec![2];
        launch.nodes = Some("n[0-1]".into());
        launch.script = Some("#!/bin/sh\ntrue\n".into());
        launch.environment = vec!["SLURM_JOBID=42".into()];
        round_trip(Message::RequestBatchJobLaunch(launch));
    }

    #[test]
    fn test_info_bodies_round_trip() {
        let info = JobInfoMsg {
            last_update: 100,
            jobs: vec![JobInfoView {
                job_id: 7,
                job_state: 1,
                nodes: Some("n[0-3]".into()),
                ..Default::default()
            }],
        };
        round_trip(Message::ResponseJobInfo(info));
        round_trip(Message::ResponseNodeInfo(NodeInfoMsg::default()));
        round_trip(Message::ResponsePartitionInfo(PartInfoMsg::default()));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(MsgType::try_from(9999).is_err());
    }

    #[test]
    fn test_truncated_body_is_error() {
        let mut buf = PackBuf::new();
        Message::RequestSubmitBatchJob(JobDescMsg::default()).pack_body(&mut buf);
        let data = buf.into_vec();
        let mut u = UnpackBuf::new(&data[..data.len() / 2]);
        assert!(Message::unpack_body(MsgType::RequestSubmitBatchJob, &mut u).is_err());
    }
}
