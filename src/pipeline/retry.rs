//! Retry Manager
//!
//! Moves failed batches back to `pending` while they are below the retry
//! ceiling and their backoff has elapsed. Processing rows whose heartbeat
//! went stale (the worker died) are first reclaimed into `failed` so they
//! take the same path.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{info, warn};

use crate::storage::{RetryPolicy, Store, StoreError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    /// Stale `processing` rows moved to `failed`
    pub reclaimed: u64,
    /// `failed` rows moved back to `pending`
    pub requeued: u64,
}

pub struct RetryManager {
    store: Arc<dyn Store>,
    policy: RetryPolicy,
    stale_after: Duration,
}

impl RetryManager {
    pub fn new(store: Arc<dyn Store>, policy: RetryPolicy, stale_after: Duration) -> Self {
        Self {
            store,
            policy,
            stale_after,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn reclaim_stale(&self) -> Result<u64, StoreError> {
        let reclaimed = self.store.reclaim_stale(self.stale_after).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "[Retry] reclaimed batches with expired heartbeats");
        }
        Ok(reclaimed)
    }

    /// Re-queue eligible failed batches. `max_retries` overrides the
    /// configured ceiling for this call.
    pub async fn retry_failed(&self, max_retries: Option<i32>) -> Result<u64, StoreError> {
        let policy = RetryPolicy {
            max_retries: max_retries.unwrap_or(self.policy.max_retries),
            ..self.policy
        };
        let requeued = self.store.retry_failed(&policy).await?;
        info!(requeued, max_retries = policy.max_retries, "[Retry] failed batches re-queued");
        Ok(requeued)
    }

    /// Reclaim, then re-queue.
    pub async fn run(&self, max_retries: Option<i32>) -> Result<RetryReport, StoreError> {
        let reclaimed = self.reclaim_stale().await?;
        let requeued = self.retry_failed(max_retries).await?;
        Ok(RetryReport {
            reclaimed,
            requeued,
        })
    }
}
