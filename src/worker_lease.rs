use crate::allocator::LeaseAllocator;
use crate::clock::Clock;
use crate::config::WorkerLeaseOptions;
use crate::error::{ConfigError, LeaseError, WorkerLeaseError};
use crate::models::{Lease, LeaseStatus};
use crate::slotted_interval;
use crate::telemetry::{LeaseEventInfo, Telemetry, TelemetryEvent};
use crate::timer::SystemTimer;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Ownership changes announced to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEvent {
    /// An allocation cycle returned the lease, including plain renewals.
    Allocated { expiry: DateTime<Utc> },
    /// The lease this instance held has run out.
    Expired,
}

/// Keeps one worker competing for its lease, cycle after cycle.
///
/// Cycles wake on slot boundaries while the lease is elsewhere and at expiry
/// while it is held. Expiry is detected locally at the start of a cycle, so it
/// is reported up to one cycle late.
pub struct WorkerLease {
    instance_id: Uuid,
    options: WorkerLeaseOptions,
    allocator: Arc<dyn LeaseAllocator>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn Telemetry>,
    current_lease: RwLock<Option<Lease>>,
    events: broadcast::Sender<LeaseEvent>,
    shutdown: CancellationToken,
}

impl WorkerLease {
    pub fn new(
        options: WorkerLeaseOptions,
        allocator: Arc<dyn LeaseAllocator>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            instance_id: options.instance_id.unwrap_or_else(Uuid::new_v4),
            options,
            allocator,
            clock,
            telemetry,
            current_lease: RwLock::new(None),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn options(&self) -> &WorkerLeaseOptions {
        &self.options
    }

    /// New receiver of [`LeaseEvent`]s. Events sent before subscribing are not seen.
    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.events.subscribe()
    }

    pub fn current_lease(&self) -> Option<Lease> {
        self.current_lease.read().clone()
    }

    pub fn status(&self) -> LeaseStatus {
        let now = self.clock.now();
        let lease = self.current_lease();
        let held = lease
            .as_ref()
            .map_or(false, |lease| lease.is_held_by(self.instance_id) && lease.is_active(now));

        LeaseStatus {
            instance_id: self.instance_id,
            worker_type: self.options.worker_type.clone(),
            priority: self.options.priority,
            held,
            leased_until: lease.filter(|_| held).and_then(|lease| lease.leased_until),
        }
    }

    /// Spawns [`run`](Self::run) on the runtime.
    pub fn start_leasing(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), WorkerLeaseError>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(cancel).await })
    }

    /// Reacquires a lease left over from a previous run of this instance, then
    /// leases until `cancel` fires, [`stop_leasing`](Self::stop_leasing) is
    /// called, or a cycle fails.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerLeaseError> {
        let timer = SystemTimer::linked_to(&self.shutdown);
        log::info!(
            "[LEASE] Leasing started - instance_id: {}, worker_type: {}, priority: {}",
            self.instance_id, self.options.worker_type, self.options.priority
        );

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(()),
            result = self.lease_loop(&timer) => result,
        };
        timer.stop();

        if outcome.is_ok() {
            self.telemetry
                .publish(TelemetryEvent::LeaseStopped(self.event_info(format!(
                    "Instance {} was stopped",
                    self.instance_id
                ))));
        }
        outcome
    }

    /// Stops the leasing loop. Idempotent; a stopped worker does not restart.
    pub fn stop_leasing(&self) {
        self.shutdown.cancel();
    }

    /// Gives the lease back if this instance holds it.
    pub async fn release(&self) {
        let held = self
            .current_lease
            .write()
            .take()
            .filter(|lease| lease.is_held_by(self.instance_id));

        if let Some(lease) = held {
            self.allocator.release_lease(lease).await;
        }
    }

    async fn lease_loop(&self, timer: &SystemTimer) -> Result<(), WorkerLeaseError> {
        self.instrumented("handle_existing_lease", timer, self.handle_existing_lease(timer.token()))
            .await?;

        let first_slot = slotted_interval::calculate(self.clock.now(), self.options.lease_interval);
        let this = self;
        timer
            .execute_periodically_in(first_slot, move |token| {
                this.instrumented("lease", timer, this.lease_cycle(token))
            })
            .await
    }

    async fn handle_existing_lease(&self, token: CancellationToken) -> Result<(), LeaseError> {
        let lease = self
            .allocator
            .try_reacquire_lease(self.instance_id, &token)
            .await?;

        if let Some(lease) = &lease {
            self.notify(LeaseEvent::Allocated {
                expiry: lease.leased_until.unwrap_or_else(|| self.clock.now()),
            });
        }
        *self.current_lease.write() = lease;
        Ok(())
    }

    /// One allocation round. Returns the wait before the next one.
    async fn lease_cycle(&self, token: CancellationToken) -> Result<Duration, LeaseError> {
        if self.lease_expired() {
            self.notify(LeaseEvent::Expired);
        }

        let lease = self
            .allocator
            .allocate_lease(self.instance_id, &token)
            .await?;
        let now = self.clock.now();

        if let Some(lease) = &lease {
            self.notify(LeaseEvent::Allocated {
                expiry: lease.leased_until.unwrap_or(now),
            });
        }

        let remaining = lease
            .as_ref()
            .and_then(|lease| lease.leased_until)
            .and_then(|until| (until - now).to_std().ok())
            .filter(|remaining| !remaining.is_zero());
        *self.current_lease.write() = lease;

        Ok(remaining
            .unwrap_or_else(|| slotted_interval::calculate(now, self.options.lease_interval)))
    }

    fn lease_expired(&self) -> bool {
        let now = self.clock.now();
        // same boundary as the allocator: a lease ending now is over
        self.current_lease.read().as_ref().map_or(false, |lease| {
            lease.is_held_by(self.instance_id) && !lease.is_active(now)
        })
    }

    /// Times `work`, and turns anything but cancellation into a fatal error
    /// that stops the timer.
    async fn instrumented<T: Default>(
        &self,
        name: &'static str,
        timer: &SystemTimer,
        work: impl Future<Output = Result<T, LeaseError>>,
    ) -> Result<T, WorkerLeaseError> {
        let started = Instant::now();
        match work.await {
            Ok(value) => {
                self.telemetry.publish(TelemetryEvent::Operation {
                    name,
                    elapsed: started.elapsed(),
                });
                Ok(value)
            }
            // the timer sees its own cancellation and winds down
            Err(LeaseError::Cancelled) => Ok(T::default()),
            Err(LeaseError::Store(source)) => {
                timer.stop();
                self.telemetry
                    .publish(TelemetryEvent::LeaseException(self.event_info(source.to_string())));
                Err(WorkerLeaseError::Unhandled {
                    operation: name,
                    source,
                })
            }
        }
    }

    fn notify(&self, event: LeaseEvent) {
        log::info!(
            "[LEASE] {:?} - instance_id: {}, worker_type: {}",
            event, self.instance_id, self.options.worker_type
        );
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn event_info(&self, reason: impl Into<String>) -> LeaseEventInfo {
        LeaseEventInfo::new(
            self.instance_id,
            self.options.worker_type.clone(),
            self.options.priority,
            reason,
        )
    }
}
