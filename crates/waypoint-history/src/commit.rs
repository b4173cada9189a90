//! Batching of mutations into periodic commits.
//!
//! Valid transitions:
//! - Idle -> PendingCommit (a mutation scheduled a commit)
//! - PendingCommit -> Idle (the deferred commit fired, or a forced commit ran)
//! - Idle -> Idle (forced commit with nothing pending)

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitState {
    /// Everything written so far is durable.
    Idle,
    /// Mutations are waiting in the open transaction for the deferred commit.
    PendingCommit,
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitState::Idle => write!(f, "Idle"),
            CommitState::PendingCommit => write!(f, "PendingCommit"),
        }
    }
}

impl CommitState {
    pub fn can_transition_to(&self, target: &CommitState) -> bool {
        matches!(
            (self, target),
            (CommitState::Idle, CommitState::PendingCommit)
                | (CommitState::PendingCommit, CommitState::Idle)
                | (CommitState::Idle, CommitState::Idle)
        )
    }
}

/// The single armed deferred commit.
#[derive(Debug, Clone)]
pub struct ScheduledCommit {
    pub deadline: Instant,
    /// Cancelled when the commit is no longer wanted. The timer checks it
    /// before committing.
    pub token: CancellationToken,
}

#[derive(Debug)]
pub struct CommitScheduler {
    state: CommitState,
    scheduled: Option<ScheduledCommit>,
    interval: Duration,
    commits: u64,
}

impl CommitScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            state: CommitState::Idle,
            scheduled: None,
            interval,
            commits: 0,
        }
    }

    pub fn state(&self) -> CommitState {
        self.state
    }

    fn transition(&mut self, target: CommitState) {
        if self.state.can_transition_to(&target) {
            debug!("Commit state: {} -> {}", self.state, target);
            self.state = target;
        }
    }

    /// Arm the deferred commit unless one is already pending. Returns
    /// whether a new commit was armed.
    pub fn schedule(&mut self) -> bool {
        if self.state == CommitState::PendingCommit {
            return false;
        }
        self.transition(CommitState::PendingCommit);
        self.scheduled = Some(ScheduledCommit {
            deadline: Instant::now() + self.interval,
            token: CancellationToken::new(),
        });
        true
    }

    pub fn scheduled(&self) -> Option<&ScheduledCommit> {
        self.scheduled.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.scheduled.as_ref().map(|s| s.deadline)
    }

    /// Whether an armed, uncancelled commit has reached its deadline.
    pub fn is_due(&self, now: Instant) -> bool {
        self.scheduled
            .as_ref()
            .is_some_and(|s| !s.token.is_cancelled() && now >= s.deadline)
    }

    /// Disarm the deferred commit without committing.
    pub fn cancel(&mut self) {
        if let Some(scheduled) = self.scheduled.take() {
            scheduled.token.cancel();
        }
    }

    /// Record that a commit just happened, by timer or by force.
    pub fn committed(&mut self) {
        self.cancel();
        self.transition(CommitState::Idle);
        self.commits += 1;
    }

    /// Total commits performed.
    pub fn commit_count(&self) -> u64 {
        self.commits
    }
}
