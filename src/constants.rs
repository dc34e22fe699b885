//! Protocol and controller-wide constants.

/// Sentinel for "value not set" in u32 fields.
pub const NO_VAL: u32 = 0xffff_fffe;

/// Sentinel for "value not set" in u16 fields.
pub const NO_VAL16: u16 = 0xfffe;

/// Sentinel for "value not set" in u64 fields.
pub const NO_VAL64: u64 = u64::MAX;

/// Sentinel for an unlimited quantity (time limits, policy limits).
pub const INFINITE: u32 = 0xffff_ffff;

/// Job ids at or above this value are reserved for no-allocation
/// (immediate) use; the id sequence wraps below it.
pub const MIN_NOALLOC_JOB_ID: u32 = 0xffff_0000;

/// Wire protocol version carried in every message header.
pub const PROTOCOL_VERSION: u16 = 0x0108;

/// Version magic of the persistent job state file.
pub const JOB_STATE_VERSION: &str = "VER008";

/// Version magic of a per-job checkpoint file.
pub const JOB_CKPT_VERSION: &str = "JOB_CKPT_001";

/// Sub-block markers inside a packed job record.
pub const DETAILS_FLAG: u16 = 0xdddd;
pub const STEP_FLAG: u16 = 0xbbbb;

/// Maximum concurrently running agent supervisors.
pub const MAX_AGENT_CNT: usize = 10;

/// Maximum concurrently active worker tasks within one supervisor.
pub const AGENT_THREAD_COUNT: usize = 10;

/// Seconds an agent worker may stay ACTIVE before the watchdog
/// cancels it and scores the node NO_RESP.
pub const COMMAND_TIMEOUT: u32 = 30;

/// Seconds a queued retry must age before the retry agent re-issues it.
pub const RPC_RETRY_INTERVAL: u32 = 10;

/// Period of the time-limit / health enforcement tick, seconds.
pub const PERIODIC_TIMEOUT: u32 = 30;

/// Period of the scheduler tick, seconds.
pub const PERIODIC_SCHEDULE: u32 = 60;

/// Period of the job state checkpoint tick, seconds.
pub const PERIODIC_CHECKPOINT: u32 = 300;

/// Period of the terminal-record purge sweep, seconds.
pub const PERIODIC_PURGE: u32 = 60;

/// Default number of forwarding subgroups (proxies) per RPC.
pub const FORWARD_FANOUT: usize = 16;

/// Offset applied to user-supplied nice values so they pack unsigned.
pub const NICE_OFFSET: u16 = 10000;

/// Largest string accepted in a submitted descriptor.
pub const MAX_STR_LEN: usize = 1024;

/// Batch step id sentinel (the batch script itself, not a step).
pub const BATCH_SCRIPT_STEP: u32 = NO_VAL;
