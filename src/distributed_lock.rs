use crate::error::DistributedLockError;
use crate::models::DistributedLockClaim;
use crate::storage::DistributedLockStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Single-shot named mutex over a [`DistributedLockStore`].
///
/// One object guards one acquisition at a time: acquiring again while a guard
/// from this object is alive fails with
/// [`DistributedLockError::AlreadyAcquired`] instead of nesting.
pub struct DistributedLock {
    store: Arc<dyn DistributedLockStore>,
    held: Arc<AtomicBool>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn DistributedLockStore>) -> Self {
        Self {
            store,
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Claims `lock_name`, or fails if anyone holds it already.
    pub async fn acquire(&self, lock_name: &str) -> Result<DistributedLockGuard, DistributedLockError> {
        if lock_name.trim().is_empty() {
            return Err(DistributedLockError::InvalidName);
        }

        if self
            .held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DistributedLockError::AlreadyAcquired {
                lock_name: lock_name.to_string(),
            });
        }

        let claim = DistributedLockClaim::new(lock_name);
        match self.claim(&claim).await {
            Ok(true) => {
                log::info!("[LOCK] Lock acquired - name: {}", lock_name);
                Ok(DistributedLockGuard {
                    store: Arc::clone(&self.store),
                    claim: Some(claim),
                    held: Arc::clone(&self.held),
                })
            }
            Ok(false) => {
                self.held.store(false, Ordering::SeqCst);
                log::info!("[LOCK] Lock already held elsewhere - name: {}", lock_name);
                Err(DistributedLockError::NotAcquired {
                    lock_name: lock_name.to_string(),
                    source: None,
                })
            }
            Err(e) => {
                self.held.store(false, Ordering::SeqCst);
                log::error!("[LOCK] Failed to claim lock - name: {}, error: {}", lock_name, e);
                Err(DistributedLockError::NotAcquired {
                    lock_name: lock_name.to_string(),
                    source: Some(e),
                })
            }
        }
    }

    async fn claim(&self, claim: &DistributedLockClaim) -> anyhow::Result<bool> {
        self.store.initialise().await?;
        self.store.try_claim_lock(claim).await
    }
}

/// Held claim of a [`DistributedLock`].
///
/// [`release`](Self::release) deletes the claim. Dropping the guard instead
/// schedules the delete on the current runtime; until that delete has run, the
/// owning [`DistributedLock`] still counts as held and `acquire` on it fails
/// with [`DistributedLockError::AlreadyAcquired`]. Release failures are logged
/// and otherwise ignored.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct DistributedLockGuard {
    store: Arc<dyn DistributedLockStore>,
    claim: Option<DistributedLockClaim>,
    held: Arc<AtomicBool>,
}

impl DistributedLockGuard {
    pub fn lock_name(&self) -> &str {
        self.claim.as_ref().map_or("", |claim| claim.id.as_str())
    }

    pub async fn release(mut self) {
        if let Some(claim) = self.claim.take() {
            release_claim(self.store.as_ref(), &claim).await;
            self.held.store(false, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for DistributedLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLockGuard")
            .field("claim", &self.claim)
            .finish_non_exhaustive()
    }
}

impl Drop for DistributedLockGuard {
    fn drop(&mut self) {
        let Some(claim) = self.claim.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                let held = Arc::clone(&self.held);
                // the owning lock stays held until the claim is gone
                handle.spawn(async move {
                    release_claim(store.as_ref(), &claim).await;
                    held.store(false, Ordering::SeqCst);
                });
            }
            Err(_) => {
                self.held.store(false, Ordering::SeqCst);
                log::warn!(
                    "[LOCK] No runtime to release lock on drop, claim left behind - name: {}",
                    claim.id
                );
            }
        }
    }
}

async fn release_claim(store: &dyn DistributedLockStore, claim: &DistributedLockClaim) {
    match store.release_lock(claim).await {
        Ok(()) => log::info!("[LOCK] Lock released - name: {}", claim.id),
        Err(e) => log::warn!("[LOCK] Failed to release lock - name: {}, error: {}", claim.id, e),
    }
}
