//! The Task entity and the lease/back-off state machine enforced on it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A task is leased for this long on pop, regardless of how many times it
/// has previously failed.
pub const LEASE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Back-off applied after the first nack of a task.
pub const FIRST_FAIL_BACKOFF: Duration = Duration::from_secs(60);

/// Back-off doubles on every subsequent nack, capped here so a task that
/// keeps failing doesn't drift the lease arbitrarily far into the future.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A unit of work on a named queue. Payload and queue name are immutable
/// after creation; everything else describes where the task sits in the
/// lease/back-off state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: Option<Uuid>,
    pub queue_name: String,
    pub payload: String,
    pub status: TaskStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_fail_duration: Option<Duration>,
}

impl Task {
    /// A brand-new pending task, not yet assigned an id or created_at by
    /// the store.
    pub fn new(queue_name: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: None,
            queue_name: queue_name.into(),
            payload: payload.into(),
            status: TaskStatus::Pending,
            created_at: None,
            locked_until: None,
            last_fail_duration: None,
        }
    }

    /// pending|failed --pop--> processing
    pub fn to_processing(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.locked_until = Some(now + chrono::Duration::from_std(LEASE_TIMEOUT).unwrap());
    }

    /// processing --nack--> failed, with exponential back-off capped at
    /// `MAX_BACKOFF`.
    pub fn to_failed(&mut self, now: DateTime<Utc>) {
        let next_backoff = next_backoff(self.last_fail_duration);
        self.status = TaskStatus::Failed;
        self.locked_until = Some(now + chrono::Duration::from_std(next_backoff).unwrap());
        self.last_fail_duration = Some(next_backoff);
    }
}

/// Computes the back-off to apply on the *next* nack given the duration
/// recorded by the previous one (absent on the first failure).
pub fn next_backoff(last_fail_duration: Option<Duration>) -> Duration {
    let doubled = match last_fail_duration {
        None => FIRST_FAIL_BACKOFF,
        Some(prev) => prev.saturating_mul(2),
    };
    doubled.min(MAX_BACKOFF)
}
