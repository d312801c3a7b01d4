use std::time::Duration;
use uuid::Uuid;

/// Observability events raised by the leasing machinery.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    LeaseAcquisition(LeaseEventInfo),
    LeaseRelease(LeaseEventInfo),
    LeaseStopped(LeaseEventInfo),
    LeaseException(LeaseEventInfo),
    /// No ballots were found when tallying an election.
    WinnerNotExisting { instance_id: Uuid, worker_type: String },
    StoreRetry { retry_after: Duration, count: u32 },
    /// A leasing cycle completed.
    Operation { name: &'static str, elapsed: Duration },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseEventInfo {
    pub instance_id: Uuid,
    pub lease_type: String,
    pub priority: u8,
    pub reason: String,
}

impl LeaseEventInfo {
    pub fn new(
        instance_id: Uuid,
        lease_type: impl Into<String>,
        priority: u8,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            instance_id,
            lease_type: lease_type.into(),
            priority,
            reason: reason.into(),
        }
    }
}

/// Fire-and-forget sink for [`TelemetryEvent`]s. Must not block or fail.
pub trait Telemetry: Send + Sync {
    fn publish(&self, event: TelemetryEvent);
}

/// Writes every event to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn publish(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::LeaseAcquisition(info) => log::info!(
                "[ELECTION] {} - instance_id: {}, lease_type: {}, priority: {}",
                info.reason, info.instance_id, info.lease_type, info.priority
            ),
            TelemetryEvent::LeaseRelease(info) => log::warn!(
                "[RELEASE] {} - instance_id: {}, lease_type: {}, priority: {}",
                info.reason, info.instance_id, info.lease_type, info.priority
            ),
            TelemetryEvent::LeaseStopped(info) => log::info!(
                "[STOPPED] {} - lease_type: {}, priority: {}",
                info.reason, info.lease_type, info.priority
            ),
            TelemetryEvent::LeaseException(info) => log::error!(
                "[EXCEPTION] {} - instance_id: {}, lease_type: {}, priority: {}",
                info.reason, info.instance_id, info.lease_type, info.priority
            ),
            TelemetryEvent::WinnerNotExisting {
                instance_id,
                worker_type,
            } => log::warn!(
                "[ELECTION] No lease requests to evaluate - instance_id: {}, worker_type: {}",
                instance_id, worker_type
            ),
            TelemetryEvent::StoreRetry { retry_after, count } => log::warn!(
                "[RETRY] Store throttled - retry_after: {:?}, count: {}",
                retry_after, count
            ),
            TelemetryEvent::Operation { name, elapsed } => {
                log::debug!("[OPERATION] {} completed in {:?}", name, elapsed)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Keeps every published event for later inspection.
    #[derive(Default)]
    pub struct RecordingTelemetry {
        events: Mutex<Vec<TelemetryEvent>>,
    }

    impl RecordingTelemetry {
        pub fn events(&self) -> Vec<TelemetryEvent> {
            self.events.lock().clone()
        }

        pub fn count(&self, predicate: impl Fn(&TelemetryEvent) -> bool) -> usize {
            self.events.lock().iter().filter(|e| predicate(e)).count()
        }
    }

    impl Telemetry for RecordingTelemetry {
        fn publish(&self, event: TelemetryEvent) {
            self.events.lock().push(event);
        }
    }
}
