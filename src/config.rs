use crate::error::ConfigError;
use std::env;
use std::time::Duration;
use uuid::Uuid;

/// Priorities run from 0 (highest) up to, but excluding, this value.
pub const MAX_PRIORITY: u8 = 8;

pub const DEFAULT_LEASE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_ELECTION_DELAY: Duration = Duration::from_secs(5);

/// Options of a single leasing worker.
#[derive(Debug, Clone)]
pub struct WorkerLeaseOptions {
    /// Class of worker competing for the lease; doubles as the lease type.
    pub worker_type: String,
    /// 0 is the highest priority.
    pub priority: u8,
    pub lease_interval: Duration,
    /// Settle time between casting a ballot and tallying the election.
    pub election_delay: Duration,
    /// Pinned instance id. Workers sharing one are treated as the same contender.
    pub instance_id: Option<Uuid>,
}

impl WorkerLeaseOptions {
    pub fn new(worker_type: impl Into<String>, priority: u8) -> Self {
        Self {
            worker_type: worker_type.into(),
            priority,
            lease_interval: DEFAULT_LEASE_INTERVAL,
            election_delay: DEFAULT_ELECTION_DELAY,
            instance_id: None,
        }
    }

    pub fn with_lease_interval(mut self, lease_interval: Duration) -> Self {
        self.lease_interval = lease_interval;
        self
    }

    pub fn with_election_delay(mut self, election_delay: Duration) -> Self {
        self.election_delay = election_delay;
        self
    }

    pub fn with_instance_id(mut self, instance_id: Uuid) -> Self {
        self.instance_id = Some(instance_id);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_type.trim().is_empty() {
            return Err(ConfigError::EmptyWorkerType);
        }
        if self.priority >= MAX_PRIORITY {
            return Err(ConfigError::PriorityOutOfRange {
                priority: self.priority,
                max: MAX_PRIORITY,
            });
        }
        if self.lease_interval.is_zero() {
            return Err(ConfigError::ZeroLeaseInterval);
        }
        Ok(())
    }
}

/// Settings shared by the store backends.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Key namespace for every document written by the backend.
    pub prefix: String,
    /// Lifetime of lock claims. `None` keeps a claim until it is released.
    pub lock_claim_ttl: Option<Duration>,
    /// Wait applied when a backend signals throttling without its own hint.
    pub retry_after: Duration,
    /// `None` retries throttled operations until they succeed.
    pub max_retries: Option<u32>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            prefix: "worker-process".to_string(),
            lock_claim_ttl: None,
            retry_after: Duration::from_millis(100),
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Memory,
    Redis,
}

impl StorageType {
    /// Case-insensitive; anything but `redis` selects the memory backend.
    pub fn from_name(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("redis") {
            StorageType::Redis
        } else {
            StorageType::Memory
        }
    }
}

/// Process configuration of the worker binary, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage_type: StorageType,
    pub redis_url: Option<String>,
    pub redis_username: Option<String>,
    pub redis_password: Option<String>,
    pub redis_db: Option<i64>,
    pub server_host: String,
    pub server_port: u16,
    pub store: StoreOptions,
    pub worker: WorkerLeaseOptions,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let storage_type = StorageType::from_name(
            &env::var("STORAGE_TYPE").unwrap_or_else(|_| "memory".to_string()),
        );

        let redis_url = if storage_type == StorageType::Redis {
            Some(env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()))
        } else {
            None
        };

        let redis_username = env::var("REDIS_USERNAME").ok();
        let redis_password = env::var("REDIS_PASSWORD").ok();
        let redis_db = env::var("REDIS_DB")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());

        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let store = StoreOptions {
            prefix: env::var("STORE_PREFIX").unwrap_or_else(|_| "worker-process".to_string()),
            lock_claim_ttl: parse_env::<u64>("LOCK_CLAIM_TTL_SECS").map(Duration::from_secs),
            retry_after: Duration::from_millis(parse_env("STORE_RETRY_AFTER_MS").unwrap_or(100)),
            max_retries: parse_env("STORE_MAX_RETRIES"),
        };

        let worker_type = env::var("WORKER_TYPE").map_err(|_| ConfigError::EmptyWorkerType)?;
        let priority = match env::var("WORKER_PRIORITY") {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                key: "WORKER_PRIORITY",
                value: raw,
            })?,
            Err(_) => 0,
        };
        let instance_id = match env::var("INSTANCE_ID") {
            Ok(raw) => Some(Uuid::parse_str(&raw).map_err(|_| ConfigError::Invalid {
                key: "INSTANCE_ID",
                value: raw,
            })?),
            Err(_) => None,
        };

        let worker = WorkerLeaseOptions {
            worker_type,
            priority,
            lease_interval: parse_env("LEASE_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_LEASE_INTERVAL),
            election_delay: parse_env("ELECTION_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_ELECTION_DELAY),
            instance_id,
        };
        worker.validate()?;

        Ok(Self {
            storage_type,
            redis_url,
            redis_username,
            redis_password,
            redis_db,
            server_host,
            server_port,
            store,
            worker,
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}
