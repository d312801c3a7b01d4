use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;
use uuid::Uuid;

/// Ownership record of one lease type.
///
/// At most one exists per `lease_type`; the store enforces that. `etag` is the
/// concurrency token of the version this copy was read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    /// Assigned by the store on creation.
    pub id: Option<String>,
    pub lease_type: String,
    pub instance_id: Option<Uuid>,
    pub priority: u8,
    pub leased_until: Option<DateTime<Utc>>,
    pub interval: Option<Duration>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl Lease {
    pub fn new(lease_type: impl Into<String>, priority: u8) -> Self {
        Self {
            id: None,
            lease_type: lease_type.into(),
            instance_id: None,
            priority,
            leased_until: None,
            interval: None,
            etag: None,
        }
    }

    /// Held by someone with an expiry still ahead of `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.instance_id.is_some() && self.leased_until.map_or(false, |until| until > now)
    }

    pub fn is_held_by(&self, instance_id: Uuid) -> bool {
        self.instance_id == Some(instance_id)
    }

    /// Clears the ownership fields, keeping identity and concurrency token.
    pub fn clear_ownership(&mut self) {
        self.instance_id = None;
        self.leased_until = None;
        self.interval = None;
    }

    pub fn describe(&self) -> String {
        format!(
            "Lease Id: [{}] LeaseType: [{}] InstanceId: [{}] Priority: [{}] LeasedUntil: [{}]",
            self.id.as_deref().unwrap_or("null"),
            self.lease_type,
            self.instance_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "null".to_string()),
            self.priority,
            self.leased_until
                .map(|until| until.to_rfc3339())
                .unwrap_or_else(|| "null".to_string()),
        )
    }
}

/// A ballot cast by one candidate during an election round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRequest {
    pub lease_type: String,
    pub priority: u8,
    pub instance_id: Uuid,
    /// Lifetime after which the store discards the ballot.
    pub time_to_live: Duration,
}

/// Claim document of a named mutex. Its existence means "locked".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedLockClaim {
    pub id: String,
}

impl DistributedLockClaim {
    pub fn new(lock_name: impl Into<String>) -> Self {
        Self {
            id: lock_name.into(),
        }
    }
}

/// Outcome of a conditional lease write.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseWrite {
    /// The document as stored, carrying its new concurrency token.
    Written(Lease),
    /// Duplicate lease type on create, or stale concurrency token on replace.
    Conflict,
}

/// Snapshot of a worker's leasing state, served by the status API.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LeaseStatus {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub instance_id: Uuid,
    #[schema(example = "returns-processor")]
    pub worker_type: String,
    #[schema(example = 0)]
    pub priority: u8,
    pub held: bool,
    pub leased_until: Option<DateTime<Utc>>,
}

/// 统一响应结构
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub message: String,
    pub data: Option<T>,
    pub success: bool,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "success".to_string(),
            data: Some(data),
            success: true,
        }
    }
}
