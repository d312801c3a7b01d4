use crate::config::StoreOptions;
use crate::error::StoreError;
use crate::models::{DistributedLockClaim, Lease, LeaseRequest, LeaseWrite};
use crate::retry::RetryPolicy;
use crate::storage::{DistributedLockStore, LeaseStore};
use crate::telemetry::Telemetry;
use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, RedisResult, Script};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// KEYS[1] lease hash; ARGV: etag, doc
const CREATE_LEASE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], 'etag', ARGV[1], 'doc', ARGV[2])
return 1
";

// KEYS[1] lease hash; ARGV: expected etag, new etag, doc
const REPLACE_LEASE: &str = r"
if redis.call('HGET', KEYS[1], 'etag') ~= ARGV[1] then
    return 0
end
redis.call('HSET', KEYS[1], 'etag', ARGV[2], 'doc', ARGV[3])
return 1
";

// KEYS[1] ballot set, KEYS[2] arrival counter; ARGV: priority,
// instance_id|request_id, ttl ms.
// Scored by priority first, then server time. Equal scores fall back to member
// order, so members lead with the zero-padded arrival sequence.
const ADD_REQUEST: &str = r"
local t = redis.call('TIME')
local now_ms = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local ttl = tonumber(ARGV[3])
local score = tonumber(ARGV[1]) * 10000000000000 + now_ms
local seq = redis.call('INCR', KEYS[2])
local member = string.format('%020d', seq) .. '|' .. ARGV[2] .. '|' .. (now_ms + ttl)
redis.call('ZADD', KEYS[1], score, member)
redis.call('PEXPIRE', KEYS[1], ttl)
redis.call('PEXPIRE', KEYS[2], ttl)
return 1
";

// KEYS[1] ballot set. Drops expired ballots on the way to the first live one
// and returns its member.
const SELECT_WINNER: &str = r"
local t = redis.call('TIME')
local now_ms = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
for _, member in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
    local expires = string.match(member, '|(%d+)$')
    if expires and tonumber(expires) > now_ms then
        return member
    end
    redis.call('ZREM', KEYS[1], member)
end
return false
";

/// Store backed by a shared Redis server.
pub struct RedisStorage {
    client: ConnectionManager,
    options: StoreOptions,
    retry: RetryPolicy,
    create_lease: Script,
    replace_lease: Script,
    add_request: Script,
    select_winner: Script,
}

impl RedisStorage {
    pub async fn new(
        redis_url: &str,
        username: Option<String>,
        password: Option<String>,
        db: Option<i64>,
        options: StoreOptions,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self> {
        // 构建连接信息
        let mut connection_info = redis::ConnectionInfo::from_str(redis_url)?;

        if let Some(pwd) = password {
            connection_info.redis.password = Some(pwd);
        }
        if let Some(user) = username {
            connection_info.redis.username = Some(user);
        }
        if let Some(database) = db {
            connection_info.redis.db = database;
        }

        let client = redis::Client::open(connection_info)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            client: connection,
            retry: RetryPolicy::new(options.max_retries, telemetry),
            options,
            create_lease: Script::new(CREATE_LEASE),
            replace_lease: Script::new(REPLACE_LEASE),
            add_request: Script::new(ADD_REQUEST),
            select_winner: Script::new(SELECT_WINNER),
        })
    }

    fn lease_key(&self, lease_type: &str) -> String {
        format!("{}:lease:{}", self.options.prefix, lease_type)
    }

    fn requests_key(&self, lease_type: &str) -> String {
        format!("{}:requests:{}", self.options.prefix, lease_type)
    }

    fn sequence_key(&self, lease_type: &str) -> String {
        format!("{}:requests-seq:{}", self.options.prefix, lease_type)
    }

    fn lock_key(&self, claim_id: &str) -> String {
        format!("{}:lock:{}", self.options.prefix, claim_id)
    }

    /// Runs a command on a fresh connection handle, retrying throttled replies.
    async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let retry_after = self.options.retry_after;
        self.retry
            .execute(|| {
                let pending = operation(self.client.clone());
                async move { pending.await.map_err(|err| classify(err, retry_after)) }
            })
            .await
    }

    /// Writes `lease` under a fresh etag through one of the conditional scripts.
    async fn write_lease(
        &self,
        script: &Script,
        lease: &Lease,
        expected_etag: Option<&str>,
    ) -> Result<LeaseWrite> {
        let key = self.lease_key(&lease.lease_type);
        let mut stored = lease.clone();
        stored.id.get_or_insert_with(|| Uuid::new_v4().to_string());
        let etag = Uuid::new_v4().to_string();
        stored.etag = Some(etag.clone());
        let doc = serde_json::to_string(&stored)?;

        let written: i32 = self
            .with_retry(|mut conn| {
                let mut invocation = script.key(&key);
                if let Some(expected) = expected_etag {
                    invocation.arg(expected);
                }
                invocation.arg(&etag).arg(&doc);
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        if written == 1 {
            Ok(LeaseWrite::Written(stored))
        } else {
            Ok(LeaseWrite::Conflict)
        }
    }
}

fn classify(err: RedisError, retry_after: Duration) -> anyhow::Error {
    let transient = err.is_timeout()
        || matches!(
            err.kind(),
            ErrorKind::TryAgain | ErrorKind::BusyLoadingError | ErrorKind::ClusterDown
        );

    if transient {
        log::debug!("[RETRY] Transient redis error: {}", err);
        StoreError::Throttled { retry_after }.into()
    } else {
        err.into()
    }
}

/// Instance id of a `sequence|instance_id|request_id|expires_ms` ballot member.
fn ballot_instance(member: &str) -> Result<Uuid> {
    let instance_id = member
        .split('|')
        .nth(1)
        .ok_or_else(|| anyhow::anyhow!("malformed ballot member: {}", member))?;
    Ok(Uuid::parse_str(instance_id)?)
}

#[async_trait]
impl LeaseStore for RedisStorage {
    async fn initialise(&self) -> Result<()> {
        let pong: String = self
            .with_retry(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        log::info!(
            "[STORE] Redis lease store ready - prefix: {}, ping: {}",
            self.options.prefix, pong
        );
        Ok(())
    }

    async fn read_by_lease_type(&self, lease_type: &str) -> Result<Option<Lease>> {
        let key = self.lease_key(lease_type);
        let doc: Option<String> = self
            .with_retry(|mut conn| {
                let key = key.clone();
                async move { conn.hget(&key, "doc").await }
            })
            .await?;

        match doc {
            Some(json_str) => Ok(Some(serde_json::from_str(&json_str)?)),
            None => Ok(None),
        }
    }

    async fn try_create_lease(&self, lease: &Lease) -> Result<LeaseWrite> {
        let mut fresh = lease.clone();
        fresh.id = None;
        self.write_lease(&self.create_lease, &fresh, None).await
    }

    async fn try_update_lease(&self, lease: &Lease) -> Result<LeaseWrite> {
        let expected = match lease.etag.as_deref() {
            Some(etag) => etag,
            None => return Ok(LeaseWrite::Conflict),
        };
        self.write_lease(&self.replace_lease, lease, Some(expected))
            .await
    }

    async fn add_lease_request(&self, request: &LeaseRequest) -> Result<bool> {
        let key = self.requests_key(&request.lease_type);
        let sequence_key = self.sequence_key(&request.lease_type);
        let member = format!("{}|{}", request.instance_id, Uuid::new_v4());
        let ttl_ms = request.time_to_live.as_millis().max(1) as u64;

        let added: i32 = self
            .with_retry(|mut conn| {
                let mut invocation = self.add_request.key(&key);
                invocation
                    .key(&sequence_key)
                    .arg(i64::from(request.priority))
                    .arg(&member)
                    .arg(ttl_ms);
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;
        Ok(added == 1)
    }

    async fn select_winner_request(&self, lease_type: &str) -> Result<Option<Uuid>> {
        let key = self.requests_key(lease_type);
        let winner: Option<String> = self
            .with_retry(|mut conn| {
                let invocation = self.select_winner.key(&key);
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        winner.as_deref().map(ballot_instance).transpose()
    }
}

#[async_trait]
impl DistributedLockStore for RedisStorage {
    async fn initialise(&self) -> Result<()> {
        LeaseStore::initialise(self).await
    }

    async fn try_claim_lock(&self, claim: &DistributedLockClaim) -> Result<bool> {
        let key = self.lock_key(&claim.id);
        let ttl = self.options.lock_claim_ttl;

        // 使用 SET NX 确保原子性
        let created: Option<String> = self
            .with_retry(|mut conn| {
                let mut cmd = redis::cmd("SET");
                cmd.arg(&key).arg(&claim.id).arg("NX");
                if let Some(ttl) = ttl {
                    cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
                }
                async move { cmd.query_async(&mut conn).await }
            })
            .await?;
        Ok(created.is_some())
    }

    async fn release_lock(&self, claim: &DistributedLockClaim) -> Result<()> {
        let key = self.lock_key(&claim.id);
        let _: i64 = self
            .with_retry(|mut conn| {
                let key = key.clone();
                async move { conn.del(&key).await }
            })
            .await?;
        log::info!("[RELEASE] Lock claim deleted - id: {}", claim.id);
        Ok(())
    }
}
