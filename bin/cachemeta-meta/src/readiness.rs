//! Node readiness
//!
//! A single value holds everything that decides whether this node may serve
//! clients: its role, the time of the last role update and whether the
//! latest checkpoint has been restored. All changes go through
//! [`ReadinessState::on_role_update`], [`ReadinessState::mark_restored`] and
//! [`ReadinessState::begin_shutdown`].

use cachemeta_common::Role;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::info;

/// Service lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    NotStarted,
    Running,
    ShuttingDown,
}

/// Externally reported node status
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Master with a fresh heartbeat and a restored checkpoint
    Ready,
    /// Master waiting for its checkpoint restore
    Restoring,
    /// Master whose role has not been refreshed in time
    Stale,
    Worker,
    Stopped,
}

/// What a role update requires from the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoleTransition {
    pub previous: Role,
    pub current: Role,
    /// A restore must be started, tagged with `generation`
    pub needs_restore: bool,
    pub generation: u64,
}

impl RoleTransition {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

#[derive(Clone, Debug)]
pub struct ReadinessState {
    lifecycle: Lifecycle,
    role: Role,
    last_heartbeat: Option<Instant>,
    checkpoint_restored: bool,
    /// Bumped on every transition into Master; a restore only counts if it
    /// finishes under the generation it was started for.
    generation: u64,
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lifecycle: Lifecycle::NotStarted,
            role: Role::Worker,
            last_heartbeat: None,
            checkpoint_restored: false,
            generation: 0,
        }
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub const fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    #[must_use]
    pub const fn checkpoint_restored(&self) -> bool {
        self.checkpoint_restored
    }

    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub const fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    pub fn start(&mut self) {
        if self.lifecycle == Lifecycle::NotStarted {
            self.lifecycle = Lifecycle::Running;
        }
    }

    /// Whether the last role update is older than `staleness`
    #[must_use]
    pub fn is_stale(&self, now: Instant, staleness: Duration) -> bool {
        self.last_heartbeat
            .is_none_or(|last| now.saturating_duration_since(last) > staleness)
    }

    /// Clients must retry unless this node is a master with a fresh role
    /// update and a restored checkpoint.
    #[must_use]
    pub fn force_client_retries(&self, now: Instant, staleness: Duration) -> bool {
        self.role == Role::Worker || self.is_stale(now, staleness) || !self.checkpoint_restored
    }

    /// Apply a role update. Ignored unless the node is running; otherwise
    /// the heartbeat timestamp is refreshed, and a transition into Master
    /// opens a new restore generation and clears the restored flag.
    pub fn on_role_update(&mut self, role: Role, now: Instant) -> RoleTransition {
        let previous = self.role;
        if self.lifecycle != Lifecycle::Running {
            return RoleTransition {
                previous,
                current: previous,
                needs_restore: false,
                generation: self.generation,
            };
        }
        self.last_heartbeat = Some(now);

        let needs_restore = role == Role::Master && previous != Role::Master;
        if needs_restore {
            self.generation += 1;
            self.checkpoint_restored = false;
        }
        if role == Role::Worker {
            self.checkpoint_restored = false;
        }
        self.role = role;

        if previous != role {
            info!(
                "Role changed: {} -> {} (generation {})",
                previous, role, self.generation
            );
        }

        RoleTransition {
            previous,
            current: role,
            needs_restore,
            generation: self.generation,
        }
    }

    /// Record a finished restore. Ignored (returns false) if the node left
    /// Master or re-entered it under a newer generation in the meantime.
    pub fn mark_restored(&mut self, generation: u64) -> bool {
        if self.lifecycle != Lifecycle::Running
            || self.role != Role::Master
            || self.generation != generation
        {
            return false;
        }
        self.checkpoint_restored = true;
        true
    }

    pub fn begin_shutdown(&mut self) {
        self.lifecycle = Lifecycle::ShuttingDown;
        self.checkpoint_restored = false;
    }

    #[must_use]
    pub fn status(&self, now: Instant, staleness: Duration) -> NodeStatus {
        if self.lifecycle != Lifecycle::Running {
            return NodeStatus::Stopped;
        }
        match self.role {
            Role::Worker => NodeStatus::Worker,
            Role::Master if self.is_stale(now, staleness) => NodeStatus::Stale,
            Role::Master if !self.checkpoint_restored => NodeStatus::Restoring,
            Role::Master => NodeStatus::Ready,
        }
    }
}
