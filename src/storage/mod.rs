pub mod memory;
pub mod redis;

use crate::models::{DistributedLockClaim, Lease, LeaseRequest, LeaseWrite};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence of lease documents and election ballots.
///
/// Writes are conditional: creation fails on an existing lease type and
/// replacement fails on a stale `etag`. Both come back as
/// [`LeaseWrite::Conflict`], never as an error.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// 确保存储就绪, idempotent
    async fn initialise(&self) -> Result<()>;

    async fn read_by_lease_type(&self, lease_type: &str) -> Result<Option<Lease>>;

    async fn try_create_lease(&self, lease: &Lease) -> Result<LeaseWrite>;

    /// Requires `lease.etag` from the version the caller read.
    async fn try_update_lease(&self, lease: &Lease) -> Result<LeaseWrite>;

    async fn add_lease_request(&self, request: &LeaseRequest) -> Result<bool>;

    /// Instance id of the live ballot with the lowest priority value,
    /// earliest first among equals.
    async fn select_winner_request(&self, lease_type: &str) -> Result<Option<Uuid>>;
}

/// Persistence of named mutex claims.
#[async_trait]
pub trait DistributedLockStore: Send + Sync {
    async fn initialise(&self) -> Result<()>;

    /// True iff the claim was created by this call.
    async fn try_claim_lock(&self, claim: &DistributedLockClaim) -> Result<bool>;

    async fn release_lock(&self, claim: &DistributedLockClaim) -> Result<()>;
}
