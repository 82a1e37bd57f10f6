//! Cluster-wide named mutex with expiry.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// A TTL lock shared by every server process.
///
/// `obtain` succeeds when the lock is free, expired, or already held by `holder`
/// (which refreshes the expiry). Contention is `Ok(false)`, never an error.
/// There is no heartbeat: a crashed holder's lock lapses after `ttl`.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn obtain(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Returns `false` when the lock is absent or held by someone else.
    async fn release(&self, name: &str, holder: &str) -> Result<bool>;
}

/// Argument check shared by lock implementations.
pub fn check_lock_args(name: &str, holder: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(crate::error::EvalFlowError::invalid_argument("lock name must not be empty"));
    }
    if holder.trim().is_empty() {
        return Err(crate::error::EvalFlowError::invalid_argument("lock holder must not be empty"));
    }
    Ok(())
}
