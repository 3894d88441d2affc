//! Claim leases held by a worker slot.

use crate::{TaskId, WorkerId};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Temporary, renewable ownership of a task by a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimLease {
    /// Claimed task.
    pub task_id: TaskId,
    /// Owning worker.
    pub worker_id: WorkerId,
    /// When the claim was taken.
    pub claimed_at: DateTime<Utc>,
    /// When the lease was last renewed (or taken).
    pub renewed_at: DateTime<Utc>,
    /// How long a renewal keeps the lease alive.
    pub duration: Duration,
}

impl ClaimLease {
    /// Create a lease taken now.
    pub fn new(task_id: TaskId, worker_id: WorkerId, duration: Duration) -> Self {
        Self::taken_at(task_id, worker_id, duration, Utc::now())
    }

    /// Create a lease taken at the given time.
    pub fn taken_at(
        task_id: TaskId,
        worker_id: WorkerId,
        duration: Duration,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            worker_id,
            claimed_at: at,
            renewed_at: at,
            duration,
        }
    }

    /// Record a successful heartbeat.
    pub fn renew(&mut self, at: DateTime<Utc>) {
        if at > self.renewed_at {
            self.renewed_at = at;
        }
    }

    /// When the lease runs out unless renewed.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let lease = chrono::Duration::from_std(self.duration)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        self.renewed_at
            .checked_add_signed(lease)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the lease has run out at the given time.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    /// Time left until expiry, zero if already expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at() - now).to_std().unwrap_or(Duration::ZERO)
    }
}
