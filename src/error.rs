use std::time::Duration;
use thiserror::Error;

/// Invalid worker or process configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("worker type cannot be null or empty")]
    EmptyWorkerType,

    #[error("priority value {priority} must be less than {max}")]
    PriorityOutOfRange { priority: u8, max: u8 },

    #[error("lease interval must be greater than zero")]
    ZeroLeaseInterval,

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Outcome of an allocator call that did not produce a result.
///
/// Contention (lost election, conflicting writes) is not an error: it comes
/// back as `Ok(None)`.
#[derive(Error, Debug)]
pub enum LeaseError {
    #[error("lease operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Fatal failure of a leasing loop. The loop is not restarted.
#[derive(Error, Debug)]
pub enum WorkerLeaseError {
    #[error("an unhandled error occurred executing operation [{operation}]")]
    Unhandled {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Error, Debug)]
pub enum DistributedLockError {
    /// The claim exists already (`source` is `None`) or the store failed.
    #[error("distributed lock for document with id: {lock_name} could not be acquired")]
    NotAcquired {
        lock_name: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("distributed lock with name {lock_name} was already acquired on the current object")]
    AlreadyAcquired { lock_name: String },

    #[error("lock name cannot be null or empty")]
    InvalidName,
}

/// Errors a store backend raises for the retry policy to act on.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store throttled the request, retry after {retry_after:?}")]
    Throttled { retry_after: Duration },
}
