//! Leader election over a lease-based distributed lock.
//!
//! ## How It Works
//!
//! 1. **Acquire**: every candidate calls `try_acquire` on the same lock name; one wins the lease.
//! 2. **Lead**: the winner runs its [`LeaderTask`] with a child cancellation token.
//! 3. **Renew**: a renewal loop extends the lease every third of its TTL.
//! 4. **Lose**: a failed renewal cancels the token; the task is expected to return promptly.
//! 5. **Retry**: losers (and former leaders) retry after `retry_interval` until shutdown.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, Result};

/// Lease-based mutual exclusion provided by the coordination service.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Takes the lease if it is free or expired. Returns whether `holder` now owns it.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Extends a lease `holder` already owns. Returns false if it was lost.
    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    async fn release(&self, name: &str, holder: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

/// Process-local lock, for single-node deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn holder(&self, name: &str) -> Option<String> {
        let leases = self.leases.lock().await;
        leases
            .get(name)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.holder.clone())
    }

    /// Drops a lease regardless of its holder.
    pub async fn revoke(&self, name: &str) {
        self.leases.lock().await.remove(name);
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        match leases.get(name) {
            Some(lease) if lease.expires_at > now && lease.holder != holder => Ok(false),
            _ => {
                leases.insert(
                    name.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        match leases.get_mut(name) {
            Some(lease) if lease.holder == holder && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        match leases.get(name) {
            Some(lease) if lease.holder != holder => Err(ClusterError::LockHeld {
                name: name.to_string(),
                holder: lease.holder.clone(),
            }),
            _ => {
                leases.remove(name);
                Ok(())
            }
        }
    }
}

/// Work that must run on at most one node at a time.
#[async_trait]
pub trait LeaderTask: Send + Sync {
    fn name(&self) -> &str;

    /// Runs while leading. Must return once `leadership` is cancelled.
    async fn take_leadership(&self, leadership: CancellationToken);
}

/// Runs a [`LeaderTask`] whenever this node holds the lock.
pub struct Leadership {
    lock: Arc<dyn DistributedLock>,
    lock_name: String,
    holder: String,
    lease_ttl: Duration,
    retry_interval: Duration,
}

impl Leadership {
    pub fn new(
        lock: Arc<dyn DistributedLock>,
        lock_name: impl Into<String>,
        holder: impl Into<String>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            lock,
            lock_name: lock_name.into(),
            holder: holder.into(),
            lease_ttl,
            retry_interval: lease_ttl / 3,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Contends for the lock until `shutdown` is cancelled.
    pub async fn run(&self, task: Arc<dyn LeaderTask>, shutdown: CancellationToken) {
        info!(
            lock = %self.lock_name,
            holder = %self.holder,
            task = task.name(),
            "Leadership loop started"
        );

        while !shutdown.is_cancelled() {
            match self
                .lock
                .try_acquire(&self.lock_name, &self.holder, self.lease_ttl)
                .await
            {
                Ok(true) => self.lead(task.as_ref(), &shutdown).await,
                Ok(false) => {
                    debug!(lock = %self.lock_name, "Lock held elsewhere");
                }
                Err(e) => {
                    warn!(lock = %self.lock_name, error = %e, "Lock acquisition failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!(lock = %self.lock_name, holder = %self.holder, "Leadership loop stopped");
    }

    async fn lead(&self, task: &dyn LeaderTask, shutdown: &CancellationToken) {
        info!(lock = %self.lock_name, holder = %self.holder, "Leadership acquired");
        let leadership = shutdown.child_token();

        let work = async {
            task.take_leadership(leadership.clone()).await;
            leadership.cancel();
        };
        tokio::join!(work, self.renew_until_lost(leadership.clone()));

        if let Err(e) = self.lock.release(&self.lock_name, &self.holder).await {
            debug!(lock = %self.lock_name, error = %e, "Lock not released");
        }
        info!(lock = %self.lock_name, holder = %self.holder, "Leadership released");
    }

    async fn renew_until_lost(&self, leadership: CancellationToken) {
        let interval = self.lease_ttl / 3;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = leadership.cancelled() => return,
            }
            match self
                .lock
                .renew(&self.lock_name, &self.holder, self.lease_ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(lock = %self.lock_name, holder = %self.holder, "Leadership lost");
                    leadership.cancel();
                    return;
                }
                Err(e) => {
                    warn!(lock = %self.lock_name, error = %e, "Lease renewal failed");
                    leadership.cancel();
                    return;
                }
            }
        }
    }
}
