use crate::clock::Clock;
use crate::config::{WorkerLeaseOptions, MAX_PRIORITY};
use crate::error::LeaseError;
use crate::models::{Lease, LeaseRequest, LeaseWrite};
use crate::slotted_interval;
use crate::storage::LeaseStore;
use crate::telemetry::{LeaseEventInfo, Telemetry, TelemetryEvent};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Shortest lifetime given to a ballot, whatever the settle delay.
const MIN_BALLOT_TTL: Duration = Duration::from_secs(1);

/// Decides which instance holds the lease of one worker type.
#[async_trait]
pub trait LeaseAllocator: Send + Sync {
    /// Wins or renews the lease for `instance_id`.
    ///
    /// `Ok(Some)` when the instance holds the lease after the call, `Ok(None)`
    /// when someone else does or the election was lost.
    async fn allocate_lease(
        &self,
        instance_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Lease>, LeaseError>;

    /// Writes the lease back as unheld. Failures are reported, not returned.
    async fn release_lease(&self, lease: Lease);

    /// Picks up a live lease already owned by `instance_id` without an election.
    async fn try_reacquire_lease(
        &self,
        instance_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Lease>, LeaseError>;
}

/// How long candidates wait for each other's ballots before tallying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleDelay {
    /// The configured election delay.
    Fixed,
    /// A share of the lease interval that shrinks as priority drops.
    Proportional,
}

/// `(lease_interval / 4) / (MAX_PRIORITY - priority + 1)`
pub fn proportional_delay(priority: u8, lease_interval: Duration) -> Duration {
    let adjusted = u32::from(MAX_PRIORITY.saturating_sub(priority)) + 1;
    lease_interval / 4 / adjusted
}

/// Ballot-based allocator over a shared [`LeaseStore`].
///
/// A round reads the current lease, casts a ballot, waits for concurrent
/// ballots to land, and lets the lowest priority value (earliest ballot among
/// equals) claim the lease through a conditional write.
pub struct ElectionAllocator {
    store: Arc<dyn LeaseStore>,
    options: WorkerLeaseOptions,
    settle_delay: SettleDelay,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn Telemetry>,
}

impl ElectionAllocator {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        options: WorkerLeaseOptions,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self {
            store,
            options,
            settle_delay: SettleDelay::Fixed,
            clock,
            telemetry,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: SettleDelay) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    fn lease_type(&self) -> &str {
        &self.options.worker_type
    }

    fn election_delay(&self) -> Duration {
        match self.settle_delay {
            SettleDelay::Fixed => self.options.election_delay,
            SettleDelay::Proportional => {
                proportional_delay(self.options.priority, self.options.lease_interval)
            }
        }
    }

    fn publish(&self, instance_id: Uuid, reason: impl Into<String>) {
        self.telemetry
            .publish(TelemetryEvent::LeaseAcquisition(LeaseEventInfo::new(
                instance_id,
                self.lease_type(),
                self.options.priority,
                reason,
            )));
    }

    /// Stamps ownership for `instance_id` on `lease`, aligned to the next slot.
    fn claim(&self, lease: &mut Lease, instance_id: Uuid) -> Result<(), LeaseError> {
        let now = self.clock.now();
        let interval = slotted_interval::calculate(now, self.options.lease_interval);
        let until = now
            + chrono::Duration::from_std(interval).map_err(|e| LeaseError::Store(e.into()))?;

        lease.instance_id = Some(instance_id);
        lease.priority = self.options.priority;
        lease.interval = Some(interval);
        lease.leased_until = Some(until);
        Ok(())
    }

    /// A conditional write lost the race; the lease is still ours if a worker
    /// sharing our instance id wrote it.
    async fn resolve_conflict(
        &self,
        instance_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Lease>, LeaseError> {
        let current = cancellable(cancel, self.store.read_by_lease_type(self.lease_type())).await?;

        match current {
            Some(lease) if lease.is_held_by(instance_id) => {
                self.publish(
                    instance_id,
                    format!("Lease already acquired by this instance. {}", lease.describe()),
                );
                Ok(Some(lease))
            }
            Some(lease) => {
                self.publish(
                    instance_id,
                    format!("Lease acquisition failed lease already acquired. {}", lease.describe()),
                );
                Ok(None)
            }
            None => {
                self.publish(instance_id, "Lease acquisition failed, lease no longer exists");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl LeaseAllocator for ElectionAllocator {
    async fn allocate_lease(
        &self,
        instance_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Lease>, LeaseError> {
        self.publish(
            instance_id,
            format!("Lease allocation started for instance {}", instance_id),
        );

        let existing = cancellable(cancel, self.store.read_by_lease_type(self.lease_type())).await?;
        if let Some(lease) = &existing {
            if lease.is_active(self.clock.now()) {
                return Ok(lease.is_held_by(instance_id).then(|| lease.clone()));
            }
        }

        let delay = self.election_delay();
        let request = LeaseRequest {
            lease_type: self.lease_type().to_string(),
            priority: self.options.priority,
            instance_id,
            time_to_live: (delay * 2).max(MIN_BALLOT_TTL),
        };
        cancellable(cancel, self.store.add_lease_request(&request)).await?;

        // backoff to allow other workers to add their lease request
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LeaseError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        self.publish(instance_id, "Leader election starting");

        let winner = cancellable(cancel, self.store.select_winner_request(self.lease_type())).await?;
        let winner = match winner {
            Some(winner) => winner,
            None => {
                self.telemetry.publish(TelemetryEvent::WinnerNotExisting {
                    instance_id,
                    worker_type: self.lease_type().to_string(),
                });
                return Ok(None);
            }
        };

        if winner != instance_id {
            self.publish(
                instance_id,
                format!(
                    "Lease failed to be acquired after election. Winner instance is {}.",
                    winner
                ),
            );
            return Ok(None);
        }

        let write = match existing {
            None => {
                let mut lease = Lease::new(self.lease_type(), self.options.priority);
                self.claim(&mut lease, instance_id)?;
                cancellable(cancel, self.store.try_create_lease(&lease)).await?
            }
            Some(mut lease) => {
                self.claim(&mut lease, instance_id)?;
                cancellable(cancel, self.store.try_update_lease(&lease)).await?
            }
        };

        match write {
            LeaseWrite::Written(lease) => {
                self.publish(instance_id, format!("Lease acquired. {}", lease.describe()));
                Ok(Some(lease))
            }
            LeaseWrite::Conflict => self.resolve_conflict(instance_id, cancel).await,
        }
    }

    async fn release_lease(&self, mut lease: Lease) {
        let instance_id = lease.instance_id.unwrap_or_default();
        lease.clear_ownership();

        let reason = match self.store.try_update_lease(&lease).await {
            Ok(LeaseWrite::Written(_)) => {
                log::info!(
                    "[RELEASE] Lease released - lease_type: {}, instance_id: {}",
                    lease.lease_type, instance_id
                );
                return;
            }
            Ok(LeaseWrite::Conflict) => format!("Lease release failed. Lease Id: [{}]", instance_id),
            Err(e) => format!("Lease release failed. Lease Id: [{}]: {}", instance_id, e),
        };

        self.telemetry
            .publish(TelemetryEvent::LeaseRelease(LeaseEventInfo::new(
                instance_id,
                self.lease_type(),
                self.options.priority,
                reason,
            )));
    }

    async fn try_reacquire_lease(
        &self,
        instance_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Lease>, LeaseError> {
        let lease = cancellable(cancel, self.store.read_by_lease_type(self.lease_type())).await?;
        let now = self.clock.now();

        Ok(lease.filter(|lease| lease.is_held_by(instance_id) && lease.is_active(now)))
    }
}

/// Races a store call against cancellation.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, LeaseError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LeaseError::Cancelled),
        result = operation => result.map_err(LeaseError::from),
    }
}
