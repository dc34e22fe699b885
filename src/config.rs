//! Daemon configuration.
//!
//! The parsed configuration snapshot lives behind the outermost of the
//! four named locks; nearly every operation takes it read-only. Loaded
//! from a JSON file at startup, reloaded on RECONFIGURE.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::constants::INFINITE;
use crate::error::{SchedError, SchedResult};

/// Bits of `accounting_enforce`.
pub const ENFORCE_ASSOCS: u16 = 0x0001;
pub const ENFORCE_LIMITS: u16 = 0x0002;
pub const ENFORCE_WCKEYS: u16 = 0x0004;

/// Bits of `private_data`.
pub const PRIVATE_JOBS: u16 = 0x0001;
pub const PRIVATE_NODES: u16 = 0x0002;
pub const PRIVATE_PARTITIONS: u16 = 0x0004;

/// Preemption mechanism selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PreemptMode {
    #[default]
    Off,
    /// Suspend/resume driven by the gang scheduler.
    SuspendGang,
    Requeue,
    Cancel,
    Checkpoint,
}

/// One configured compute node (or a range via hostlist notation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, may use hostlist notation (`n[0-15]`).
    pub names: String,
    #[serde(default = "one")]
    pub cpus: u16,
    #[serde(default = "one")]
    pub sockets: u16,
    #[serde(default = "one")]
    pub cores: u16,
    #[serde(default = "one")]
    pub threads: u16,
    /// MiB of real memory.
    #[serde(default)]
    pub real_memory: u32,
    /// MiB of temporary disk.
    #[serde(default)]
    pub tmp_disk: u32,
    #[serde(default = "one_u32")]
    pub weight: u32,
    #[serde(default)]
    pub features: Vec<String>,
    /// Base port of the node agent; node index is added.
    #[serde(default = "default_agent_port")]
    pub port: u16,
    /// Agent host; defaults to the node name.
    #[serde(default)]
    pub address: Option<String>,
}

/// One configured partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub name: String,
    /// Hostlist of member nodes.
    pub nodes: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default = "inf")]
    pub max_time: u32,
    #[serde(default = "inf")]
    pub default_time: u32,
    #[serde(default = "inf")]
    pub max_nodes: u32,
    #[serde(default = "one_u32")]
    pub min_nodes: u32,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub root_only: bool,
    #[serde(default)]
    pub disable_root_jobs: bool,
    #[serde(default)]
    pub shared: bool,
    #[serde(default = "one_u16")]
    pub priority: u16,
    #[serde(default = "state_up")]
    pub state_up: bool,
    /// Unix groups allowed to use the partition; empty = everyone.
    #[serde(default)]
    pub allow_groups: Vec<String>,
}

/// A configured consumable license: `name:count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    pub name: String,
    pub total: u32,
}

/// Controller configuration. Field semantics follow the knob list of
/// the protocol specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cluster_name: String,
    /// Address the controller listens on for client and node RPCs.
    pub listen_addr: String,
    /// Directory for the job state file and `job.<id>` input dirs.
    pub state_save_location: String,
    /// Directory for per-job checkpoint record files.
    pub job_ckpt_dir: String,
    /// Jobcomp flatfile sink destination; empty disables it.
    pub job_comp_loc: String,
    /// Privileged uid in addition to root.
    pub admin_uid: u32,

    /// Hard cap on live job records; further submits return JobTableFull.
    pub max_job_cnt: u32,
    /// Minimum seconds a terminal job is retained in memory.
    pub min_job_age: u32,
    /// Grace between SIGTERM and SIGKILL on termination, seconds.
    pub kill_wait: u32,
    /// Default per-hop RPC timeout, seconds.
    pub msg_timeout: u32,
    /// Grace for node agents to confirm a batch launch, seconds.
    pub batch_start_timeout: u32,
    /// Grace for nodes waking from power save, seconds.
    pub resume_timeout: u32,
    /// Seconds allowed for epilog completion before a node is stuck.
    pub epilog_max: u32,
    /// If nonzero, kill jobs with no active steps for this long.
    pub inactive_limit: u32,
    /// Minutes of grace past `time_limit`; INFINITE = one year.
    pub over_time_limit: u32,
    /// Trust configured CPU counts over registered counts.
    pub fast_schedule: bool,
    /// Reject submits exceeding partition limits at submit time.
    pub enforce_part_limits: bool,
    /// Bitmask of ENFORCE_{ASSOCS,LIMITS,WCKEYS}.
    pub accounting_enforce: u16,
    pub preempt_mode: PreemptMode,
    /// Bitmask of PRIVATE_{JOBS,NODES,PARTITIONS}.
    pub private_data: u16,
    /// Floor of the job id sequence.
    pub first_job_id: u32,
    /// Default MiB of memory per task; 0 = unlimited.
    pub def_mem_per_task: u32,
    /// Maximum MiB of memory per task; 0 = unlimited.
    pub max_mem_per_task: u32,
    /// Default requeue-on-failure policy for batch jobs.
    pub job_requeue: bool,
    /// Seconds without response before a node is considered down.
    pub node_timeout: u32,
    /// Skip scheduling while any job is COMPLETING (fragmentation
    /// avoidance); disable on statically partitioned systems.
    pub avoid_fragmentation: bool,

    pub nodes: Vec<NodeConfig>,
    pub partitions: Vec<PartitionConfig>,
    pub licenses: Vec<LicenseConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cluster_name: "cluster".into(),
            listen_addr: "0.0.0.0:6817".into(),
            state_save_location: "/var/spool/clusterd".into(),
            job_ckpt_dir: "/var/spool/clusterd/ckpt".into(),
            job_comp_loc: String::new(),
            admin_uid: 0,
            max_job_cnt: 5000,
            min_job_age: 300,
            kill_wait: 30,
            msg_timeout: 10,
            batch_start_timeout: 10,
            resume_timeout: 60,
            epilog_max: 120,
            inactive_limit: 0,
            over_time_limit: 0,
            fast_schedule: true,
            enforce_part_limits: false,
            accounting_enforce: 0,
            preempt_mode: PreemptMode::Off,
            private_data: 0,
            first_job_id: 1,
            def_mem_per_task: 0,
            max_mem_per_task: 0,
            job_requeue: true,
            node_timeout: 300,
            avoid_fragmentation: true,
            nodes: Vec::new(),
            partitions: Vec::new(),
            licenses: Vec::new(),
        }
    }
}

impl Config {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> SchedResult<Config> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| SchedError::Internal(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&data)
            .map_err(|e| SchedError::Internal(format!("parse {}: {}", path.display(), e)))
    }

    /// Effective over-run grace in seconds (INFINITE maps to one year).
    pub fn over_run_secs(&self) -> u32 {
        if self.over_time_limit == INFINITE {
            365 * 24 * 60 * 60
        } else {
            self.over_time_limit.saturating_mul(60)
        }
    }

    /// Reply deadline for client RPCs.
    pub fn client_deadline_secs(&self) -> u32 {
        self.kill_wait + 2 * self.msg_timeout
    }

    /// True if `uid` may act on other users' jobs.
    pub fn is_super_user(&self, uid: u32) -> bool {
        uid == 0 || uid == self.admin_uid
    }
}

fn one() -> u16 {
    1
}
fn one_u16() -> u16 {
    1
}
fn one_u32() -> u32 {
    1
}
fn inf() -> u32 {
    INFINITE
}
fn state_up() -> bool {
    true
}
fn default_agent_port() -> u16 {
    6818
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.first_job_id, 1);
        assert!(c.is_super_user(0));
        assert!(!c.is_super_user(500));
        assert_eq!(c.client_deadline_secs(), 30 + 20);
    }

    #[test]
    fn test_over_run() {
        let mut c = Config::default();
        c.over_time_limit = 2;
        assert_eq!(c.over_run_secs(), 120);
        c.over_time_limit = INFINITE;
        assert_eq!(c.over_run_secs(), 365 * 24 * 60 * 60);
    }

    #[test]
    fn test_parse_minimal() {
        let json = r#"{
            "cluster_name": "test",
            "nodes": [{"names": "n[0-3]", "cpus": 2}],
            "partitions": [{"name": "debug", "nodes": "n[0-3]", "default": true}]
        }"#;
        let c: Config = serde_json::from_str(json).unwrap();
        assert_eq!(c.nodes.len(), 1);
        assert_eq!(c.partitions[0].name, "debug");
        assert_eq!(c.partitions[0].max_time, INFINITE);
    }
}
