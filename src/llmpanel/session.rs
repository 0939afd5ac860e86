//! Session state for one problem-solving run.
//!
//! ```text
//! Pending → Unpacking → Analyzing → Synthesizing → Completed
//!    └──────────┴───────────┴────────────┴──→ Error
//! ```
//!
//! Transitions are strictly forward. A session is frozen once it reaches
//! [`Phase::Completed`] or [`Phase::Error`].

use crate::agent::AgentResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Unpacking,
    Analyzing,
    Synthesizing,
    Completed,
    Error,
}

impl Phase {
    fn rank(self) -> u8 {
        match self {
            Phase::Pending => 0,
            Phase::Unpacking => 1,
            Phase::Analyzing => 2,
            Phase::Synthesizing => 3,
            Phase::Completed => 4,
            Phase::Error => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Error)
    }

    /// Forward-only: the next pipeline phase, or `Error` from any non-terminal phase.
    pub fn can_transition_to(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Phase::Error || next.rank() == self.rank() + 1
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pending => "pending",
            Phase::Unpacking => "unpacking",
            Phase::Analyzing => "analyzing",
            Phase::Synthesizing => "synthesizing",
            Phase::Completed => "completed",
            Phase::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid phase transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub to: Phase,
}

/// Everything known about one run. Handed back to the caller by value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub problem: String,
    pub domains: Vec<String>,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub unpack_result: Option<AgentResponse>,
    /// Analyze-phase responses in completion order, failures included.
    pub analysis_results: Vec<AgentResponse>,
    pub synthesis_result: Option<AgentResponse>,
    pub error: Option<String>,
    pub execution_time: Duration,
    pub cancelled: bool,
}

impl SessionState {
    pub fn new(problem: impl Into<String>, domains: Vec<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            problem: problem.into(),
            domains,
            phase: Phase::Pending,
            started_at: Utc::now(),
            unpack_result: None,
            analysis_results: Vec::new(),
            synthesis_result: None,
            error: None,
            execution_time: Duration::ZERO,
            cancelled: false,
        }
    }

    pub fn advance(&mut self, next: Phase) -> Result<(), InvalidTransition> {
        if !self.phase.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        log::debug!("Session {}: {} -> {}", self.session_id, self.phase, next);
        self.phase = next;
        Ok(())
    }

    /// Move to `Error` (if not already terminal) and keep the message.
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.phase.is_terminal() {
            log::warn!(
                "Session {}: ignoring failure after {}: {}",
                self.session_id,
                self.phase,
                message
            );
            return;
        }
        log::error!("Session {} failed during {}: {}", self.session_id, self.phase, message);
        self.phase = Phase::Error;
        self.error = Some(message);
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn successful_analyses(&self) -> impl Iterator<Item = &AgentResponse> {
        self.analysis_results.iter().filter(|r| r.success)
    }

    pub fn failed_analyses(&self) -> impl Iterator<Item = &AgentResponse> {
        self.analysis_results.iter().filter(|r| !r.success)
    }
}

/// Cooperative cancellation flag shared between a caller and a running session.
///
/// Checked between phases only; in-flight calls are allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        assert!(Phase::Pending.can_transition_to(Phase::Unpacking));
        assert!(Phase::Unpacking.can_transition_to(Phase::Analyzing));
        assert!(Phase::Synthesizing.can_transition_to(Phase::Completed));
        assert!(!Phase::Pending.can_transition_to(Phase::Analyzing));
        assert!(!Phase::Analyzing.can_transition_to(Phase::Unpacking));
        assert!(!Phase::Completed.can_transition_to(Phase::Error));
        assert!(Phase::Analyzing.can_transition_to(Phase::Error));
    }

    #[test]
    fn test_fail_is_sticky_once_terminal() {
        let mut state = SessionState::new("p", vec![]);
        state.advance(Phase::Unpacking).unwrap();
        state.fail("boom");
        assert_eq!(state.phase, Phase::Error);
        state.fail("again");
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert!(state.advance(Phase::Analyzing).is_err());
    }

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
