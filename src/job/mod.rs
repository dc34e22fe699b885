//! Job records: lifecycle state, submission details, steps, and
//! dependencies.
//!
//! The authoritative owner of records is [`table::JobTable`]. A job
//! references its partition, association, and reservation by id/index;
//! the owning registries resolve them, and every resolution tolerates
//! the referent having been deleted out from under the job.

pub mod table;

use std::net::SocketAddrV4;

use crate::bitmap::Bitmap;
use crate::codec::msg::MultiCore;
use crate::constants::{INFINITE, NO_VAL};
use crate::error::{SchedError, SchedResult};
use crate::UnixTime;

pub type JobId = u32;

/// Base job state; orthogonal COMPLETING/CONFIGURING flags ride in
/// [`JobState::flags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum BaseState {
    Pending = 0,
    Running = 1,
    Suspended = 2,
    Complete = 3,
    Cancelled = 4,
    Failed = 5,
    Timeout = 6,
    NodeFail = 7,
}

pub const JOB_COMPLETING: u16 = 0x8000;
pub const JOB_CONFIGURING: u16 = 0x4000;
const JOB_FLAG_MASK: u16 = JOB_COMPLETING | JOB_CONFIGURING;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobState {
    pub base: BaseState,
    pub flags: u16,
}

impl JobState {
    pub fn new(base: BaseState) -> JobState {
        JobState { base, flags: 0 }
    }

    pub fn is_pending(&self) -> bool {
        self.base == BaseState::Pending
    }

    pub fn is_running(&self) -> bool {
        self.base == BaseState::Running
    }

    pub fn is_suspended(&self) -> bool {
        self.base == BaseState::Suspended
    }

    /// Terminal states; COMPLETING does not affect this.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.base,
            BaseState::Complete
                | BaseState::Cancelled
                | BaseState::Failed
                | BaseState::Timeout
                | BaseState::NodeFail
        )
    }

    pub fn is_completing(&self) -> bool {
        self.flags & JOB_COMPLETING != 0
    }

    pub fn is_configuring(&self) -> bool {
        self.flags & JOB_CONFIGURING != 0
    }

    pub fn set_completing(&mut self) {
        self.flags |= JOB_COMPLETING;
    }

    pub fn clear_completing(&mut self) {
        self.flags &= !JOB_COMPLETING;
    }

    pub fn set_configuring(&mut self) {
        self.flags |= JOB_CONFIGURING;
    }

    pub fn clear_configuring(&mut self) {
        self.flags &= !JOB_CONFIGURING;
    }

    /// Wire/persistence encoding: base in the low bits, flags above.
    pub fn to_word(self) -> u16 {
        self.base as u16 | self.flags
    }

    pub fn from_word(word: u16) -> SchedResult<JobState> {
        let base = match word & !JOB_FLAG_MASK {
            0 => BaseState::Pending,
            1 => BaseState::Running,
            2 => BaseState::Suspended,
            3 => BaseState::Complete,
            4 => BaseState::Cancelled,
            5 => BaseState::Failed,
            6 => BaseState::Timeout,
            7 => BaseState::NodeFail,
            other => {
                return Err(SchedError::Decode(format!("invalid job state {}", other)));
            }
        };
        Ok(JobState {
            base,
            flags: word & JOB_FLAG_MASK,
        })
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.base {
            BaseState::Pending => "PENDING",
            BaseState::Running => "RUNNING",
            BaseState::Suspended => "SUSPENDED",
            BaseState::Complete => "COMPLETE",
            BaseState::Cancelled => "CANCELLED",
            BaseState::Failed => "FAILED",
            BaseState::Timeout => "TIMEOUT",
            BaseState::NodeFail => "NODE_FAIL",
        };
        write!(f, "{}", name)?;
        if self.is_completing() {
            write!(f, "|COMPLETING")?;
        }
        if self.is_configuring() {
            write!(f, "|CONFIGURING")?;
        }
        Ok(())
    }
}

/// Why a job is waiting or how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum StateReason {
    #[default]
    None = 0,
    Priority = 1,
    Dependency = 2,
    Resources = 3,
    PartNodeLimit = 4,
    PartTimeLimit = 5,
    PartDown = 6,
    Held = 7,
    WaitTime = 8,
    Reservation = 9,
    Licenses = 10,
    BadConstraints = 11,
    DownNode = 12,
    DownPartition = 13,
    BankAccount = 14,
    ExitCode = 15,
    Timeout = 16,
    InactiveLimit = 17,
    Launch = 18,
    System = 19,
}

impl StateReason {
    pub fn from_word(word: u16) -> StateReason {
        match word {
            1 => StateReason::Priority,
            2 => StateReason::Dependency,
            3 => StateReason::Resources,
            4 => StateReason::PartNodeLimit,
            5 => StateReason::PartTimeLimit,
            6 => StateReason::PartDown,
            7 => StateReason::Held,
            8 => StateReason::WaitTime,
            9 => StateReason::Reservation,
            10 => StateReason::Licenses,
            11 => StateReason::BadConstraints,
            12 => StateReason::DownNode,
            13 => StateReason::DownPartition,
            14 => StateReason::BankAccount,
            15 => StateReason::ExitCode,
            16 => StateReason::Timeout,
            17 => StateReason::InactiveLimit,
            18 => StateReason::Launch,
            19 => StateReason::System,
            _ => StateReason::None,
        }
    }
}

/// Dependency kinds; the job's list is an AND of entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DependKind {
    /// Lifted once the referenced job leaves PENDING.
    After = 0,
    /// Lifted once the referenced job reaches a terminal state.
    AfterAny = 1,
    /// Lifted only on COMPLETE; other terminal states are fatal.
    AfterOk = 2,
    /// Lifted only on a non-COMPLETE terminal state.
    AfterNotOk = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependSpec {
    pub kind: DependKind,
    pub job_id: JobId,
}

/// Parse a dependency expression: `afterok:123:124,after:128`, or the
/// old single-job-id form meaning `afterany`.
pub fn parse_dependency(spec: &str, self_id: JobId) -> SchedResult<Vec<DependSpec>> {
    let mut out = Vec::new();
    if spec.is_empty() {
        return Ok(out);
    }

    // old format: bare job id
    if let Ok(job_id) = spec.parse::<u32>() {
        if job_id == 0 || job_id == self_id {
            return Err(SchedError::Dependency);
        }
        out.push(DependSpec {
            kind: DependKind::AfterAny,
            job_id,
        });
        return Ok(out);
    }

    for clause in spec.split(',').filter(|s| !s.is_empty()) {
        let (kind_str, ids) = clause.split_once(':').ok_or(SchedError::Dependency)?;
        let kind = match kind_str {
            "after" => DependKind::After,
            "afterany" => DependKind::AfterAny,
            "afterok" => DependKind::AfterOk,
            "afternotok" => DependKind::AfterNotOk,
            _ => return Err(SchedError::Dependency),
        };
        for id_str in ids.split(':') {
            let job_id: u32 = id_str.parse().map_err(|_| SchedError::Dependency)?;
            if job_id == 0 || job_id == self_id {
                return Err(SchedError::Dependency);
            }
            out.push(DependSpec { kind, job_id });
        }
    }
    Ok(out)
}

/// Submission details. Mutable while the job is PENDING; mostly frozen
/// once it runs (the record is kept for batch requeue).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDetails {
    pub submit_time: UnixTime,
    pub begin_time: UnixTime,
    pub min_nodes: u32,
    pub max_nodes: u32,
    pub num_tasks: u32,
    pub cpus_per_task: u16,
    pub ntasks_per_node: u16,
    pub requeue: u16,
    pub shared: u16,
    pub contiguous: u16,
    pub nice: u16,
    pub overcommit: u8,
    pub open_mode: u8,
    pub prolog_running: u8,
    pub acctg_freq: u16,
    pub task_dist: u16,
    pub job_min_procs: u32,
    pub job_min_memory: u32,
    pub job_min_tmp_disk: u32,
    pub req_nodes: Option<String>,
    pub req_node_bitmap: Option<Bitmap>,
    /// Requested-node ordering hint, preserved across save/restore.
    pub req_node_layout: Option<Vec<u32>>,
    pub exc_nodes: Option<String>,
    pub exc_node_bitmap: Option<Bitmap>,
    pub features: Option<String>,
    pub feature_list: Vec<String>,
    pub dependency: Option<String>,
    pub depend_list: Vec<DependSpec>,
    pub argv: Vec<String>,
    pub env_sup: Vec<String>,
    pub stderr: Option<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub work_dir: Option<String>,
    pub ckpt_dir: Option<String>,
    pub restart_dir: Option<String>,
    pub cpu_bind: Option<String>,
    pub cpu_bind_type: u16,
    pub mem_bind: Option<String>,
    pub mem_bind_type: u16,
    pub multi_core: MultiCore,
}

impl Default for JobDetails {
    fn default() -> Self {
        JobDetails {
            submit_time: 0,
            begin_time: 0,
            min_nodes: 1,
            max_nodes: 0,
            num_tasks: 1,
            cpus_per_task: 1,
            ntasks_per_node: 0,
            requeue: 0,
            shared: 0,
            contiguous: 0,
            nice: crate::constants::NICE_OFFSET,
            overcommit: 0,
            open_mode: 0,
            prolog_running: 0,
            acctg_freq: 0,
            task_dist: 0,
            job_min_procs: 1,
            job_min_memory: 0,
            job_min_tmp_disk: 0,
            req_nodes: None,
            req_node_bitmap: None,
            req_node_layout: None,
            exc_nodes: None,
            exc_node_bitmap: None,
            features: None,
            feature_list: Vec::new(),
            dependency: None,
            depend_list: Vec::new(),
            argv: Vec::new(),
            env_sup: Vec::new(),
            stderr: None,
            stdin: None,
            stdout: None,
            work_dir: None,
            ckpt_dir: None,
            restart_dir: None,
            cpu_bind: None,
            cpu_bind_type: 0,
            mem_bind: None,
            mem_bind_type: 0,
            multi_core: MultiCore::default(),
        }
    }
}

/// One step of a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub step_id: u32,
    pub name: Option<String>,
    pub node_bitmap: Option<Bitmap>,
    pub node_list: Option<String>,
    pub cpus_per_node: Vec<u32>,
    pub num_tasks: u32,
    pub start_time: UnixTime,
    pub ckpt_dir: Option<String>,
    /// Client I/O streaming endpoint.
    pub io_host: Option<String>,
    pub io_port: u16,
    pub cred: Vec<u8>,
    /// Leave tasks running if their node goes down.
    pub no_kill: bool,
    /// The batch script pseudo-step.
    pub batch_step: bool,
}

/// The primary job record.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: JobId,
    pub assoc_id: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub name: Option<String>,
    pub wckey: Option<String>,
    pub account: Option<String>,
    pub comment: Option<String>,
    pub network: Option<String>,
    pub licenses: Option<String>,
    pub license_list: Vec<(String, u32)>,

    pub partition: String,
    pub part_idx: Option<usize>,

    pub node_bitmap: Option<Bitmap>,
    pub nodes: Option<String>,
    /// Compact node list saved while COMPLETING, so recovery can
    /// rebuild the completing bitmap.
    pub nodes_completing: Option<String>,
    pub node_cnt: u32,
    pub node_addrs: Vec<SocketAddrV4>,
    pub num_procs: u32,
    pub total_procs: u32,
    pub cpus_per_node: Vec<u32>,
    pub cpu_count_reps: Vec<u32>,

    pub state: JobState,
    pub state_reason: StateReason,
    pub state_desc: Option<String>,
    pub exit_code: u32,
    /// Uid that cancelled the job, if any.
    pub requid: Option<u32>,
    pub restart_cnt: u16,
    /// 0 = interactive, 1 = batch, 2 = batch already retried once.
    pub batch_flag: u16,
    pub kill_on_node_fail: u16,
    /// Accounting backend row handle; 0 forces a fresh start record.
    pub db_index: u32,

    pub start_time: UnixTime,
    pub end_time: UnixTime,
    pub suspend_time: UnixTime,
    /// Accumulated run seconds before the current suspension.
    pub pre_sus_time: u32,
    /// Total suspended seconds over the job's life.
    pub tot_sus_time: u32,
    pub time_last_active: UnixTime,
    /// Minutes; INFINITE = unlimited.
    pub time_limit: u32,

    /// 0 = held, 1 = system-held at end of queue.
    pub priority: u32,
    /// Sticky: skip automatic priority recomputation.
    pub direct_set_prio: bool,
    pub qos: u16,
    pub resv_name: Option<String>,
    pub resv_id: u32,

    pub mail_type: u16,
    pub mail_user: Option<String>,
    pub ckpt_interval: u16,
    pub ckpt_time: UnixTime,
    pub ckpt_disabled: bool,

    pub alloc_node: Option<String>,
    pub alloc_sid: u32,
    pub resp_host: Option<String>,
    pub alloc_resp_port: u16,
    pub other_port: u16,

    /// Opaque plugin blobs, preserved byte-for-byte.
    pub select_blob: Vec<u8>,
    pub check_blob: Vec<u8>,
    pub spank_env: Vec<String>,

    pub details: Option<JobDetails>,
    pub steps: Vec<StepRecord>,
    pub next_step_id: u32,
}

impl JobRecord {
    pub fn new(job_id: JobId) -> JobRecord {
        JobRecord {
            job_id,
            assoc_id: 0,
            user_id: 0,
            group_id: 0,
            name: None,
            wckey: None,
            account: None,
            comment: None,
            network: None,
            licenses: None,
            license_list: Vec::new(),
            partition: String::new(),
            part_idx: None,
            node_bitmap: None,
            nodes: None,
            nodes_completing: None,
            node_cnt: 0,
            node_addrs: Vec::new(),
            num_procs: 1,
            total_procs: 0,
            cpus_per_node: Vec::new(),
            cpu_count_reps: Vec::new(),
            state: JobState::new(BaseState::Pending),
            state_reason: StateReason::None,
            state_desc: None,
            exit_code: 0,
            requid: None,
            restart_cnt: 0,
            batch_flag: 0,
            kill_on_node_fail: 1,
            db_index: 0,
            start_time: 0,
            end_time: 0,
            suspend_time: 0,
            pre_sus_time: 0,
            tot_sus_time: 0,
            time_last_active: 0,
            time_limit: INFINITE,
            priority: NO_VAL,
            direct_set_prio: false,
            qos: 0,
            resv_name: None,
            resv_id: 0,
            mail_type: 0,
            mail_user: None,
            ckpt_interval: 0,
            ckpt_time: 0,
            ckpt_disabled: false,
            alloc_node: None,
            alloc_sid: 0,
            resp_host: None,
            alloc_resp_port: 0,
            other_port: 0,
            select_blob: Vec::new(),
            check_blob: Vec::new(),
            spank_env: Vec::new(),
            details: None,
            steps: Vec::new(),
            next_step_id: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn is_suspended(&self) -> bool {
        self.state.is_suspended()
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn is_completing(&self) -> bool {
        self.state.is_completing()
    }

    /// Allocate the next step id; ids are never reused within a job.
    pub fn alloc_step_id(&mut self) -> u32 {
        let id = self.next_step_id;
        self.next_step_id += 1;
        id
    }

    pub fn find_step(&self, step_id: u32) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn delete_step(&mut self, step_id: u32) -> bool {
        let before = self.steps.len();
        self.steps.retain(|s| s.step_id != step_id);
        self.steps.len() != before
    }

    /// Whether the job requested exclusive (non-shared) nodes.
    pub fn exclusive(&self) -> bool {
        self.details.as_ref().map(|d| d.shared == 0).unwrap_or(true)
    }

    /// CPU-minutes consumed so far, for association policy checks.
    pub fn cpu_usage_mins(&self, now: UnixTime) -> u64 {
        if self.start_time == 0 || now <= self.start_time {
            return 0;
        }
        let run_secs = (now - self.start_time).saturating_sub(self.tot_sus_time) as u64;
        run_secs / 60 * self.total_procs.max(1) as u64
    }

    /// Effective end time for a fresh start at `start`.
    pub fn compute_end_time(&self, start: UnixTime) -> UnixTime {
        if self.time_limit == INFINITE || self.time_limit == NO_VAL {
            start.saturating_add(365 * 24 * 60 * 60)
        } else {
            start.saturating_add(self.time_limit.saturating_mul(60))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_word_round_trip() {
        let mut s = JobState::new(BaseState::Running);
        s.set_completing();
        s.set_configuring();
        let w = s.to_word();
        let back = JobState::from_word(w).unwrap();
        assert_eq!(back, s);
        assert!(back.is_completing());
        assert!(back.is_configuring());
        assert!(back.is_running());
    }

    #[test]
    fn test_invalid_state_word() {
        assert!(JobState::from_word(9).is_err());
        assert!(JobState::from_word(JOB_COMPLETING | 8).is_err());
    }

    #[test]
    fn test_finished_classification() {
        for base in [
            BaseState::Complete,
            BaseState::Cancelled,
            BaseState::Failed,
            BaseState::Timeout,
            BaseState::NodeFail,
        ] {
            assert!(JobState::new(base).is_finished());
        }
        let mut s = JobState::new(BaseState::Complete);
        s.set_completing();
        assert!(s.is_finished());
        assert!(!JobState::new(BaseState::Pending).is_finished());
    }

    #[test]
    fn test_parse_dependency_new_format() {
        let deps = parse_dependency("afterok:12:13,after:20", 99).unwrap();
        assert_eq!(deps.len(), 3);
        assert_eq!(deps[0].kind, DependKind::AfterOk);
        assert_eq!(deps[0].job_id, 12);
        assert_eq!(deps[2].kind, DependKind::After);
        assert_eq!(deps[2].job_id, 20);
    }

    #[test]
    fn test_parse_dependency_old_format() {
        let deps = parse_dependency("42", 99).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].kind, DependKind::AfterAny);
    }

    #[test]
    fn test_parse_dependency_rejects_self_and_garbage() {
        assert!(parse_dependency("42", 42).is_err());
        assert!(parse_dependency("before:12", 1).is_err());
        assert!(parse_dependency("afterok:abc", 1).is_err());
    }

    #[test]
    fn test_step_ids_monotonic() {
        let mut job = JobRecord::new(5);
        assert_eq!(job.alloc_step_id(), 0);
        assert_eq!(job.alloc_step_id(), 1);
        job.delete_step(0);
        assert_eq!(job.alloc_step_id(), 2);
    }

    #[test]
    fn test_cpu_usage_accounts_for_suspension() {
        let mut job = JobRecord::new(1);
        job.start_time = 1000;
        job.total_procs = 4;
        job.tot_sus_time = 60;
        // 10 minutes wall, 1 minute suspended -> 9 minutes * 4 cpus
        assert_eq!(job.cpu_usage_mins(1000 + 600), 9 * 4);
    }
}
