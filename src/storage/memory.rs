use crate::clock::Clock;
use crate::config::StoreOptions;
use crate::models::{DistributedLockClaim, Lease, LeaseRequest, LeaseWrite};
use crate::storage::{DistributedLockStore, LeaseStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct StoredRequest {
    instance_id: Uuid,
    priority: u8,
    created_at: DateTime<Utc>,
    // breaks ties between ballots written within the same clock tick
    sequence: u64,
    expires_at: Option<DateTime<Utc>>,
}

/// Single-process store backed by concurrent maps.
///
/// Gives the same conditional-write guarantees as the shared backends, so any
/// number of workers inside one process can elect through it.
pub struct MemoryStorage {
    leases: DashMap<String, Lease>,               // lease_type -> Lease
    requests: DashMap<String, Vec<StoredRequest>>, // lease_type -> ballots
    claims: DashMap<String, Option<DateTime<Utc>>>, // claim id -> expiry
    sequence: AtomicU64,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

impl MemoryStorage {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_options(clock, StoreOptions::default())
    }

    pub fn with_options(clock: Arc<dyn Clock>, options: StoreOptions) -> Self {
        Self {
            leases: DashMap::new(),
            requests: DashMap::new(),
            claims: DashMap::new(),
            sequence: AtomicU64::new(0),
            clock,
            options,
        }
    }

    /// Drops expired ballots and lock claims. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;

        for mut entry in self.requests.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|request| !is_expired(request.expires_at, now));
            removed += before - entry.value().len();
        }
        self.requests.retain(|_, ballots| !ballots.is_empty());

        let expired: Vec<String> = self
            .claims
            .iter()
            .filter(|entry| is_expired(*entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();

        for claim_id in expired {
            if self
                .claims
                .remove_if(&claim_id, |_, expires_at| is_expired(*expires_at, now))
                .is_some()
            {
                log::info!("[EXPIRED CLEANUP] Removed expired lock claim - id: {}", claim_id);
                removed += 1;
            }
        }

        if removed > 0 {
            log::info!("[CLEANUP] Removed {} expired documents", removed);
        }
        removed
    }

    fn new_etag() -> Option<String> {
        Some(Uuid::new_v4().to_string())
    }
}

fn expires_at(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
}

fn is_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at.map_or(false, |at| at <= now)
}

#[async_trait]
impl LeaseStore for MemoryStorage {
    async fn initialise(&self) -> Result<()> {
        log::info!("[STORE] Memory lease store ready - prefix: {}", self.options.prefix);
        Ok(())
    }

    async fn read_by_lease_type(&self, lease_type: &str) -> Result<Option<Lease>> {
        Ok(self.leases.get(lease_type).map(|entry| entry.value().clone()))
    }

    async fn try_create_lease(&self, lease: &Lease) -> Result<LeaseWrite> {
        match self.leases.entry(lease.lease_type.clone()) {
            Entry::Occupied(_) => Ok(LeaseWrite::Conflict),
            Entry::Vacant(vacant) => {
                let mut stored = lease.clone();
                stored.id = Some(Uuid::new_v4().to_string());
                stored.etag = Self::new_etag();
                vacant.insert(stored.clone());
                Ok(LeaseWrite::Written(stored))
            }
        }
    }

    async fn try_update_lease(&self, lease: &Lease) -> Result<LeaseWrite> {
        let mut current = match self.leases.get_mut(&lease.lease_type) {
            Some(current) => current,
            None => return Ok(LeaseWrite::Conflict),
        };

        if lease.etag.is_none() || current.etag != lease.etag || current.id != lease.id {
            return Ok(LeaseWrite::Conflict);
        }

        let mut stored = lease.clone();
        stored.etag = Self::new_etag();
        *current = stored.clone();
        Ok(LeaseWrite::Written(stored))
    }

    async fn add_lease_request(&self, request: &LeaseRequest) -> Result<bool> {
        let now = self.clock.now();
        let stored = StoredRequest {
            instance_id: request.instance_id,
            priority: request.priority,
            created_at: now,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            expires_at: expires_at(now, request.time_to_live),
        };

        let mut ballots = self.requests.entry(request.lease_type.clone()).or_default();
        ballots.retain(|ballot| !is_expired(ballot.expires_at, now));
        ballots.push(stored);
        Ok(true)
    }

    async fn select_winner_request(&self, lease_type: &str) -> Result<Option<Uuid>> {
        let now = self.clock.now();
        let winner = self.requests.get_mut(lease_type).and_then(|mut ballots| {
            ballots.retain(|request| !is_expired(request.expires_at, now));
            ballots
                .iter()
                .min_by_key(|request| (request.priority, request.created_at, request.sequence))
                .map(|request| request.instance_id)
        });
        Ok(winner)
    }
}

#[async_trait]
impl DistributedLockStore for MemoryStorage {
    async fn initialise(&self) -> Result<()> {
        Ok(())
    }

    async fn try_claim_lock(&self, claim: &DistributedLockClaim) -> Result<bool> {
        let now = self.clock.now();
        let claim_expiry = self
            .options
            .lock_claim_ttl
            .and_then(|ttl| expires_at(now, ttl));

        match self.claims.entry(claim.id.clone()) {
            Entry::Occupied(mut occupied) => {
                if is_expired(*occupied.get(), now) {
                    log::info!("[EXPIRED] Lock claim expired and replaced - id: {}", claim.id);
                    occupied.insert(claim_expiry);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(claim_expiry);
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, claim: &DistributedLockClaim) -> Result<()> {
        if self.claims.remove(&claim.id).is_some() {
            log::info!("[RELEASE] Lock claim deleted - id: {}", claim.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn setup() -> (Arc<ManualClock>, MemoryStorage) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2000, 1, 1, 12, 0, 0).unwrap(),
        ));
        let storage = MemoryStorage::new(clock.clone());
        (clock, storage)
    }

    fn ballot(lease_type: &str, priority: u8, instance_id: Uuid) -> LeaseRequest {
        LeaseRequest {
            lease_type: lease_type.to_string(),
            priority,
            instance_id,
            time_to_live: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn create_is_unique_per_lease_type() {
        let (_, storage) = setup();
        let lease = Lease::new("orders", 0);

        let created = match storage.try_create_lease(&lease).await.unwrap() {
            LeaseWrite::Written(created) => created,
            LeaseWrite::Conflict => panic!("first create must succeed"),
        };
        assert!(created.id.is_some());
        assert!(created.etag.is_some());

        assert_eq!(
            storage.try_create_lease(&lease).await.unwrap(),
            LeaseWrite::Conflict
        );
        assert!(matches!(
            storage.try_create_lease(&Lease::new("returns", 0)).await.unwrap(),
            LeaseWrite::Written(_)
        ));
    }

    #[tokio::test]
    async fn update_rejects_stale_etag() {
        let (_, storage) = setup();
        let created = match storage.try_create_lease(&Lease::new("orders", 0)).await.unwrap() {
            LeaseWrite::Written(created) => created,
            LeaseWrite::Conflict => unreachable!(),
        };

        let mut first = created.clone();
        first.instance_id = Some(Uuid::new_v4());
        let updated = match storage.try_update_lease(&first).await.unwrap() {
            LeaseWrite::Written(updated) => updated,
            LeaseWrite::Conflict => panic!("fresh etag must be accepted"),
        };
        assert_ne!(updated.etag, created.etag);

        let mut stale = created;
        stale.instance_id = Some(Uuid::new_v4());
        assert_eq!(storage.try_update_lease(&stale).await.unwrap(), LeaseWrite::Conflict);

        let stored = storage.read_by_lease_type("orders").await.unwrap().unwrap();
        assert_eq!(stored.instance_id, first.instance_id);
    }

    #[tokio::test]
    async fn update_of_missing_lease_conflicts() {
        let (_, storage) = setup();
        let mut lease = Lease::new("orders", 0);
        lease.etag = Some("whatever".to_string());
        assert_eq!(storage.try_update_lease(&lease).await.unwrap(), LeaseWrite::Conflict);
    }

    #[tokio::test]
    async fn winner_is_lowest_priority_then_earliest() {
        let (clock, storage) = setup();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let urgent = Uuid::new_v4();

        storage.add_lease_request(&ballot("orders", 2, first)).await.unwrap();
        clock.advance(chrono::Duration::milliseconds(100));
        storage.add_lease_request(&ballot("orders", 2, second)).await.unwrap();
        assert_eq!(
            storage.select_winner_request("orders").await.unwrap(),
            Some(first)
        );

        storage.add_lease_request(&ballot("orders", 1, urgent)).await.unwrap();
        assert_eq!(
            storage.select_winner_request("orders").await.unwrap(),
            Some(urgent)
        );
        assert_eq!(storage.select_winner_request("returns").await.unwrap(), None);
    }

    #[tokio::test]
    async fn same_tick_ballots_keep_insertion_order() {
        let (_, storage) = setup();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            storage.add_lease_request(&ballot("orders", 0, *id)).await.unwrap();
        }
        assert_eq!(
            storage.select_winner_request("orders").await.unwrap(),
            Some(ids[0])
        );
    }

    #[tokio::test]
    async fn expired_ballots_are_ignored_and_purged() {
        let (clock, storage) = setup();
        storage
            .add_lease_request(&ballot("orders", 0, Uuid::new_v4()))
            .await
            .unwrap();

        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(storage.purge_expired(), 1);
        assert_eq!(storage.purge_expired(), 0);
        assert_eq!(storage.select_winner_request("orders").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ballots_are_pruned_without_purging() {
        let (clock, storage) = setup();
        for _ in 0..3 {
            storage
                .add_lease_request(&ballot("orders", 1, Uuid::new_v4()))
                .await
                .unwrap();
            clock.advance(chrono::Duration::seconds(11));
        }
        assert_eq!(storage.requests.get("orders").unwrap().len(), 1);

        let latest = Uuid::new_v4();
        storage
            .add_lease_request(&ballot("orders", 2, latest))
            .await
            .unwrap();
        assert_eq!(storage.requests.get("orders").unwrap().len(), 1);

        clock.advance(chrono::Duration::seconds(5));
        let survivor = Uuid::new_v4();
        storage
            .add_lease_request(&ballot("orders", 3, survivor))
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(6));

        // the higher-priority ballot has lapsed and is dropped at tally time
        assert_eq!(
            storage.select_winner_request("orders").await.unwrap(),
            Some(survivor)
        );
        assert_eq!(storage.requests.get("orders").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claims_are_exclusive_until_released() {
        let (_, storage) = setup();
        let claim = DistributedLockClaim::new("nightly-report");

        assert!(storage.try_claim_lock(&claim).await.unwrap());
        assert!(!storage.try_claim_lock(&claim).await.unwrap());

        storage.release_lock(&claim).await.unwrap();
        assert!(storage.try_claim_lock(&claim).await.unwrap());
    }

    #[tokio::test]
    async fn claim_ttl_makes_abandoned_claims_reclaimable() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let storage = MemoryStorage::with_options(
            clock.clone(),
            StoreOptions {
                lock_claim_ttl: Some(Duration::from_secs(30)),
                ..StoreOptions::default()
            },
        );
        let claim = DistributedLockClaim::new("nightly-report");

        assert!(storage.try_claim_lock(&claim).await.unwrap());
        clock.advance(chrono::Duration::seconds(29));
        assert!(!storage.try_claim_lock(&claim).await.unwrap());
        clock.advance(chrono::Duration::seconds(2));
        assert!(storage.try_claim_lock(&claim).await.unwrap());
    }
}
