//! clusterd — centralized cluster workload manager controller
//!
//! The controller daemon accepts job submissions from clients over a
//! versioned binary RPC protocol, maintains authoritative state over a
//! fleet of compute nodes, schedules pending jobs onto available
//! resources in priority order, launches them on node agents through a
//! bounded-concurrency RPC agent, and drives every job through its
//! lifecycle with failure recovery, requeueing, suspend/resume,
//! checkpoint/restart, and accounting.
//!
//! Subsystem map:
//! - [`codec`]: wire buffer primitives, message catalogue, forwarding
//! - [`agent`]: outbound RPC fan-out engine with watchdog and retries
//! - [`node`], [`partition`], [`reservation`], [`license`]: registries
//! - [`assoc`]: association/QoS cache and accounting policy admission
//! - [`job`]: job table, job/step records, dependencies
//! - [`sched`]: the priority scheduler and selection oracle seam
//! - [`lifecycle`]: state transitions, time limits, suspend, requeue,
//!   checkpoint/restart
//! - [`state`]: persistent job state checkpointing and recovery
//! - [`dispatch`]: the client-facing RPC dispatcher
//! - [`controller`]: process-wide wiring and periodic ticks

pub mod acct;
pub mod agent;
pub mod assoc;
pub mod bitmap;
pub mod codec;
pub mod config;
pub mod constants;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod hostlist;
pub mod job;
pub mod license;
pub mod lifecycle;
pub mod node;
pub mod partition;
pub mod reservation;
pub mod sched;
pub mod srun;
pub mod state;
pub mod transport;

pub use config::Config;
pub use controller::Controller;
pub use error::{SchedError, SchedResult};
pub use job::{JobId, JobState};

/// Seconds since the Unix epoch, as carried on the wire.
pub type UnixTime = u32;

/// Current wall-clock time in epoch seconds.
pub fn now() -> UnixTime {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as UnixTime)
        .unwrap_or(0)
}
