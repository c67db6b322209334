//! Leader election among orchestrator replicas sharing one store.
//!
//! Leadership is a lease over a singleton [`ActiveInstance`] row: the holder
//! refreshes `last_ping`, and any peer may take over once the ping is older
//! than the grace period. This is advisory exclusion, not consensus. Right
//! after a grace period expires a stale holder can still believe it leads
//! until its next heartbeat fails, so everything done under leadership must
//! be idempotent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{LeaderStore, StoreResult};

/// The singleton leadership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveInstance {
    pub identity: Uuid,
    pub last_ping: DateTime<Utc>,
}

/// One replica's view of the leadership protocol.
#[derive(Debug)]
pub struct LeadershipCoordinator<S> {
    store: Arc<S>,
    identity: Uuid,
    grace: TimeDelta,
}

impl<S> Clone for LeadershipCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            identity: self.identity,
            grace: self.grace,
        }
    }
}

impl<S: LeaderStore> LeadershipCoordinator<S> {
    pub fn new(store: Arc<S>, identity: Uuid, grace_period: Duration) -> Self {
        Self {
            store,
            identity,
            grace: TimeDelta::from_std(grace_period).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn identity(&self) -> Uuid {
        self.identity
    }

    /// Attempt to become (or stay) leader.
    pub async fn claim(&self) -> StoreResult<bool> {
        let granted = self
            .store
            .claim_leadership(self.identity, Utc::now(), self.grace)
            .await?;
        if granted {
            debug!(identity = %self.identity, "leadership claimed");
        } else {
            debug!(identity = %self.identity, "leadership claim denied");
        }
        Ok(granted)
    }

    /// Heartbeat. `false` means leadership was lost to a peer.
    pub async fn maintain(&self) -> StoreResult<bool> {
        let held = self
            .store
            .maintain_leadership(self.identity, Utc::now())
            .await?;
        if !held {
            warn!(identity = %self.identity, "leadership lost");
        }
        Ok(held)
    }

    pub async fn abdicate(&self) -> StoreResult<bool> {
        let released = self.store.abdicate_leadership(self.identity).await?;
        if released {
            info!(identity = %self.identity, "leadership released");
        }
        Ok(released)
    }
}
