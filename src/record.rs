use serde::{Deserialize, Serialize};
use std::fmt;

use crate::command::ActorId;
use crate::error::{RevlogError, RevlogResult};
use crate::event::ChangeEvent;
use crate::lock::LockSet;

/// Lifecycle of one change. Initial state is `Creating`; the four
/// `Success*`/`Failed*` states are terminal and freeze the record.
///
/// ```text
/// Creating  --preconditions fail--> FailedPreconditions
/// Creating  --no-op command-------> SuccessNoChange
/// Creating  --events durable------> Executing
/// Executing --effects applied-----> SuccessExecuted
/// Creating|Executing --stale------> FailedTimeout
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeStatus {
    Creating,
    Executing,
    SuccessExecuted,
    SuccessNoChange,
    FailedPreconditions,
    FailedTimeout,
}

impl ChangeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Creating | Self::Executing)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::SuccessExecuted | Self::SuccessNoChange)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Executing => "executing",
            Self::SuccessExecuted => "success_executed",
            Self::SuccessNoChange => "success_no_change",
            Self::FailedPreconditions => "failed_preconditions",
            Self::FailedTimeout => "failed_timeout",
        }
    }

    fn may_transition(self, to: ChangeStatus) -> bool {
        use ChangeStatus::*;
        match self {
            Creating => matches!(
                to,
                Executing | SuccessNoChange | FailedPreconditions | FailedTimeout
            ),
            Executing => matches!(to, SuccessExecuted | FailedTimeout),
            _ => false,
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state of one in-flight or completed change, keyed by its
/// revision number. Written only through compare-and-swap, so every
/// transition is observed by exactly one winner.
///
/// `locks` is non-empty exactly while the status is non-terminal
/// (committing clears it); `events` is non-empty exactly from `Executing`
/// onward on the executed path. `last_activity_ms` is a UNIX-epoch
/// heartbeat; any process may declare the record abandoned once it goes
/// stale past the configured timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub revision: u64,
    pub status: ChangeStatus,
    pub locks: LockSet,
    pub actor: ActorId,
    pub last_activity_ms: u64,
    pub events: Vec<ChangeEvent>,
}

impl ChangeRecord {
    /// Fresh record in `Creating`, as written by the revision-claiming
    /// compare-and-swap.
    pub fn allocate(revision: u64, locks: LockSet, actor: ActorId, now_ms: u64) -> Self {
        Self {
            revision,
            status: ChangeStatus::Creating,
            locks,
            actor,
            last_activity_ms: now_ms,
            events: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Events are durable, so any process may replay them and finish the
    /// change on behalf of a dead owner.
    pub fn can_roll_forward(&self) -> bool {
        self.status == ChangeStatus::Executing
    }

    /// Heartbeat refresh. Meaningless on terminal records but harmless.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_activity_ms = now_ms;
    }

    pub fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_activity_ms)
    }

    /// Hard staleness: non-terminal and silent longer than the full
    /// timeout budget. Other processes may now take the record over.
    pub fn is_timed_out(&self, now_ms: u64, timeout_ms: u64) -> bool {
        !self.is_terminal() && self.idle_ms(now_ms) > timeout_ms
    }

    /// Critical-margin check for the owner. Past this margin the owner
    /// must stop writing and abandon, leaving the hard-timeout window for
    /// someone else to recover cleanly.
    pub fn is_timeout_critical(&self, now_ms: u64, critical_ms: u64) -> bool {
        !self.is_terminal() && self.idle_ms(now_ms) > critical_ms
    }

    /// Durably stages the event list: `Creating` to `Executing`. The
    /// events must be non-empty (a no-op command commits `SuccessNoChange`
    /// without ever entering `Executing`).
    pub fn begin_executing(
        &mut self,
        events: Vec<ChangeEvent>,
        now_ms: u64,
    ) -> RevlogResult<()> {
        if self.status != ChangeStatus::Creating {
            return Err(RevlogError::integrity(format!(
                "revision {} cannot stage events from status {}",
                self.revision, self.status
            )));
        }
        if events.is_empty() {
            return Err(RevlogError::integrity(format!(
                "revision {} staged an empty event list",
                self.revision
            )));
        }
        self.status = ChangeStatus::Executing;
        self.events = events;
        self.last_activity_ms = now_ms;
        Ok(())
    }

    /// Moves to a terminal status and releases the locks in the same
    /// record image. Illegal transitions surface as integrity errors:
    /// they mean two processes disagreed about who owns the record, which
    /// the compare-and-swap discipline is supposed to make impossible.
    pub fn commit(&mut self, status: ChangeStatus, now_ms: u64) -> RevlogResult<()> {
        if !self.status.may_transition(status) {
            return Err(RevlogError::integrity(format!(
                "revision {} illegal transition {} -> {}",
                self.revision, self.status, status
            )));
        }
        if !status.is_terminal() {
            return Err(RevlogError::integrity(format!(
                "revision {} commit to non-terminal {}",
                self.revision, status
            )));
        }
        self.status = status;
        self.locks = LockSet::default();
        if status != ChangeStatus::SuccessExecuted {
            self.events.clear();
        }
        self.last_activity_ms = now_ms;
        Ok(())
    }

    /// Structural check for records arriving from storage. A violation
    /// means a corrupted row or a writer that does not follow the
    /// protocol, and is never silently tolerated.
    pub fn validate(&self) -> RevlogResult<()> {
        if self.revision == 0 {
            return Err(RevlogError::integrity("record with revision 0"));
        }
        if self.is_terminal() && !self.locks.is_empty() {
            return Err(RevlogError::integrity(format!(
                "terminal revision {} still holds locks",
                self.revision
            )));
        }
        if !self.is_terminal() && self.locks.is_empty() {
            return Err(RevlogError::integrity(format!(
                "live revision {} holds no locks",
                self.revision
            )));
        }
        let needs_events = matches!(
            self.status,
            ChangeStatus::Executing | ChangeStatus::SuccessExecuted
        );
        if needs_events && self.events.is_empty() {
            return Err(RevlogError::integrity(format!(
                "revision {} is {} with no events",
                self.revision, self.status
            )));
        }
        if !needs_events && !self.events.is_empty() {
            return Err(RevlogError::integrity(format!(
                "revision {} is {} but carries {} events",
                self.revision,
                self.status,
                self.events.len()
            )));
        }
        Ok(())
    }
}
