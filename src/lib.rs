//! Priority-based leader election and lease renewal over a shared document
//! store, plus a named distributed mutex built on the same store.

pub mod allocator;
pub mod clock;
pub mod config;
pub mod distributed_lock;
pub mod error;
pub mod handlers;
pub mod models;
pub mod retry;
pub mod slotted_interval;
pub mod storage;
pub mod telemetry;
pub mod timer;
pub mod worker_lease;

pub use allocator::{ElectionAllocator, LeaseAllocator, SettleDelay};
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::{Config, StorageType, StoreOptions, WorkerLeaseOptions};
pub use distributed_lock::{DistributedLock, DistributedLockGuard};
pub use error::{ConfigError, DistributedLockError, LeaseError, StoreError, WorkerLeaseError};
pub use models::{DistributedLockClaim, Lease, LeaseRequest, LeaseStatus, LeaseWrite};
pub use storage::{DistributedLockStore, LeaseStore};
pub use telemetry::{LogTelemetry, Telemetry, TelemetryEvent};
pub use timer::SystemTimer;
pub use worker_lease::{LeaseEvent, WorkerLease};
