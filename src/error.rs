//! Controller error taxonomy.
//!
//! Every error carries a stable numeric code so it can travel in a
//! `ResponseReturnCode` body and be reconstructed on the far side.
//! Codes are grouped by kind: decode (1xxx), auth (2xxx), reference
//! (3xxx), state (4xxx), policy (5xxx), capacity (6xxx), credential
//! (7xxx), downstream agent (8xxx), internal (9xxx).

use thiserror::Error;

/// Result type for controller operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors surfaced by the controller core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    // Decode
    #[error("wire decode error: {0}")]
    Decode(String),
    #[error("protocol version mismatch: got {got:#06x}, want {want:#06x}")]
    VersionMismatch { got: u16, want: u16 },

    // Auth / privilege
    #[error("user id missing or unresolvable")]
    UserIdMissing,
    #[error("access denied")]
    AccessDenied,

    // Reference
    #[error("invalid job id")]
    InvalidJobId,
    #[error("invalid partition name")]
    InvalidPartitionName,
    #[error("default partition not set")]
    DefaultPartitionNotSet,
    #[error("invalid account")]
    InvalidAccount,
    #[error("invalid wckey")]
    InvalidWckey,
    #[error("invalid licenses")]
    InvalidLicenses,
    #[error("invalid feature specification")]
    InvalidFeature,
    #[error("invalid node name")]
    InvalidNodeName,
    #[error("requested nodes not in this partition")]
    NodesNotInPartition,

    // State
    #[error("operation disabled in current job state")]
    Disabled,
    #[error("job already completed")]
    AlreadyDone,
    #[error("job is pending")]
    JobPending,
    #[error("job state transition not possible, no update performed")]
    TransitionStateNoUpdate,
    #[error("operation only valid for batch jobs")]
    BatchOnly,
    #[error("operation not supported on this configuration")]
    NotSupported,

    // Policy
    #[error("accounting policy limit would be exceeded")]
    AccountingPolicy,
    #[error("job dependency problem")]
    Dependency,
    #[error("reservation not usable")]
    ReservationNotUsable,
    #[error("job is held")]
    JobHeld,
    #[error("invalid time limit")]
    InvalidTimeLimit,
    #[error("more nodes requested than permitted")]
    TooManyRequestedNodes,
    #[error("more processors requested than permitted")]
    TooManyRequestedCpus,
    #[error("invalid task memory specification")]
    InvalidTaskMemory,
    #[error("pathname or string too long")]
    PathnameTooLong,
    #[error("user not in partition access group")]
    MissingPartitionGroup,

    // Capacity (scheduler retries these on later ticks)
    #[error("requested nodes are busy")]
    NodesBusy,
    #[error("requested partition configuration not available now")]
    PartConfigUnavailable,
    #[error("requested node configuration is not available")]
    NodeConfigUnavailable,
    #[error("resources fragmented by completing job")]
    Fragmentation,
    #[error("job is not top priority")]
    NotTopPriority,
    #[error("job table full, retry later")]
    JobTableFull,

    // Credential
    #[error("invalid job credential")]
    InvalidJobCredential,
    #[error("job credential revoked")]
    CredentialRevoked,

    // Downstream agent
    #[error("prolog failed on node")]
    PrologFailed,
    #[error("epilog failed on node")]
    EpilogFailed,
    #[error("job already complete on node")]
    KillJobAlreadyComplete,
    #[error("job not running on node")]
    JobNotRunning,

    // Internal
    #[error("error copying descriptor to job record")]
    DescToRecordCopy,
    #[error("error writing state to file: {0}")]
    WritingToFile(String),
    #[error("communication failure: {0}")]
    Comm(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl SchedError {
    /// Stable numeric code for the wire.
    pub fn code(&self) -> u32 {
        match self {
            SchedError::Decode(_) => 1001,
            SchedError::VersionMismatch { .. } => 1002,
            SchedError::UserIdMissing => 2001,
            SchedError::AccessDenied => 2002,
            SchedError::InvalidJobId => 3001,
            SchedError::InvalidPartitionName => 3002,
            SchedError::DefaultPartitionNotSet => 3003,
            SchedError::InvalidAccount => 3004,
            SchedError::InvalidWckey => 3005,
            SchedError::InvalidLicenses => 3006,
            SchedError::InvalidFeature => 3007,
            SchedError::InvalidNodeName => 3008,
            SchedError::NodesNotInPartition => 3009,
            SchedError::Disabled => 4001,
            SchedError::AlreadyDone => 4002,
            SchedError::JobPending => 4003,
            SchedError::TransitionStateNoUpdate => 4004,
            SchedError::BatchOnly => 4005,
            SchedError::NotSupported => 4006,
            SchedError::AccountingPolicy => 5001,
            SchedError::Dependency => 5002,
            SchedError::ReservationNotUsable => 5003,
            SchedError::JobHeld => 5004,
            SchedError::InvalidTimeLimit => 5005,
            SchedError::TooManyRequestedNodes => 5006,
            SchedError::TooManyRequestedCpus => 5007,
            SchedError::InvalidTaskMemory => 5008,
            SchedError::PathnameTooLong => 5009,
            SchedError::MissingPartitionGroup => 5010,
            SchedError::NodesBusy => 6001,
            SchedError::PartConfigUnavailable => 6002,
            SchedError::NodeConfigUnavailable => 6003,
            SchedError::Fragmentation => 6004,
            SchedError::NotTopPriority => 6005,
            SchedError::JobTableFull => 6006,
            SchedError::InvalidJobCredential => 7001,
            SchedError::CredentialRevoked => 7002,
            SchedError::PrologFailed => 8001,
            SchedError::EpilogFailed => 8002,
            SchedError::KillJobAlreadyComplete => 8003,
            SchedError::JobNotRunning => 8004,
            SchedError::DescToRecordCopy => 9001,
            SchedError::WritingToFile(_) => 9002,
            SchedError::Comm(_) => 9003,
            SchedError::Internal(_) => 9004,
        }
    }

    /// Reconstruct an error from a wire code. Unknown codes collapse
    /// into `Internal`.
    pub fn from_code(code: u32) -> SchedError {
        match code {
            1001 => SchedError::Decode(String::new()),
            2001 => SchedError::UserIdMissing,
            2002 => SchedError::AccessDenied,
            3001 => SchedError::InvalidJobId,
            3002 => SchedError::InvalidPartitionName,
            3003 => SchedError::DefaultPartitionNotSet,
            3004 => SchedError::InvalidAccount,
            3005 => SchedError::InvalidWckey,
            3006 => SchedError::InvalidLicenses,
            3007 => SchedError::InvalidFeature,
            3008 => SchedError::InvalidNodeName,
            3009 => SchedError::NodesNotInPartition,
            4001 => SchedError::Disabled,
            4002 => SchedError::AlreadyDone,
            4003 => SchedError::JobPending,
            4004 => SchedError::TransitionStateNoUpdate,
            4005 => SchedError::BatchOnly,
            4006 => SchedError::NotSupported,
            5001 => SchedError::AccountingPolicy,
            5002 => SchedError::Dependency,
            5003 => SchedError::ReservationNotUsable,
            5004 => SchedError::JobHeld,
            5005 => SchedError::InvalidTimeLimit,
            5006 => SchedError::TooManyRequestedNodes,
            5007 => SchedError::TooManyRequestedCpus,
            5008 => SchedError::InvalidTaskMemory,
            5009 => SchedError::PathnameTooLong,
            5010 => SchedError::MissingPartitionGroup,
            6001 => SchedError::NodesBusy,
            6002 => SchedError::PartConfigUnavailable,
            6003 => SchedError::NodeConfigUnavailable,
            6004 => SchedError::Fragmentation,
            6005 => SchedError::NotTopPriority,
            6006 => SchedError::JobTableFull,
            7001 => SchedError::InvalidJobCredential,
            7002 => SchedError::CredentialRevoked,
            8001 => SchedError::PrologFailed,
            8002 => SchedError::EpilogFailed,
            8003 => SchedError::KillJobAlreadyComplete,
            8004 => SchedError::JobNotRunning,
            9001 => SchedError::DescToRecordCopy,
            9002 => SchedError::WritingToFile(String::new()),
            9003 => SchedError::Comm(String::new()),
            other => SchedError::Internal(format!("code {}", other)),
        }
    }

    /// Capacity-kind errors leave the job queued; the scheduler retries
    /// them automatically on later ticks.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            SchedError::NodesBusy
                | SchedError::PartConfigUnavailable
                | SchedError::NodeConfigUnavailable
                | SchedError::Fragmentation
                | SchedError::NotTopPriority
        )
    }
}

impl From<std::io::Error> for SchedError {
    fn from(err: std::io::Error) -> Self {
        SchedError::WritingToFile(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        let errs = [
            SchedError::InvalidJobId,
            SchedError::AccessDenied,
            SchedError::NodesBusy,
            SchedError::AccountingPolicy,
            SchedError::KillJobAlreadyComplete,
            SchedError::BatchOnly,
        ];
        for e in errs {
            assert_eq!(SchedError::from_code(e.code()), e);
        }
    }

    #[test]
    fn test_capacity_classification() {
        assert!(SchedError::NodesBusy.is_capacity());
        assert!(SchedError::NotTopPriority.is_capacity());
        assert!(!SchedError::InvalidJobId.is_capacity());
        assert!(!SchedError::Dependency.is_capacity());
    }
}
