//! Session events.
//!
//! The orchestrator publishes one [`SessionEvent`] per phase change and per agent
//! response, followed by a final `Complete` or `Error`. Consumers either register an
//! [`EventHandler`] (callback style) or drain the channel returned by
//! [`ProcessOrchestrator::solve_stream`](crate::orchestration::ProcessOrchestrator::solve_stream).
//! Both see the same sequence:
//!
//! ```text
//! PhaseChange(Unpacking)
//!   AgentResponse(synthesizer)
//! PhaseChange(Analyzing)
//!   AgentResponse(..)  × (1 + domains), completion order
//! PhaseChange(Synthesizing)
//!   AgentResponse(synthesizer)
//! Complete | Error
//! ```
//!
//! Delivery never fails the pipeline: a panicking handler is logged and skipped,
//! and a dropped stream receiver simply stops receiving.
//!
//! # Example
//!
//! ```rust
//! use async_trait::async_trait;
//! use llmpanel::event::{EventHandler, SessionEvent};
//!
//! struct PrintHandler;
//!
//! #[async_trait]
//! impl EventHandler for PrintHandler {
//!     async fn on_session_event(&self, event: &SessionEvent) {
//!         if let SessionEvent::PhaseChange { phase, .. } = event {
//!             println!("phase: {}", phase);
//!         }
//!     }
//! }
//! ```

use crate::agent::AgentResponse;
use crate::session::{Phase, SessionState};
use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Emitted before the phase's work begins.
    PhaseChange { session_id: String, phase: Phase },
    /// One agent finished, successfully or not.
    AgentResponse {
        session_id: String,
        phase: Phase,
        response: AgentResponse,
    },
    /// The session reached `Completed`.
    Complete { session: Box<SessionState> },
    /// The session reached `Error`.
    Error {
        session_id: String,
        message: String,
        session: Box<SessionState>,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::PhaseChange { session_id, .. }
            | SessionEvent::AgentResponse { session_id, .. }
            | SessionEvent::Error { session_id, .. } => session_id,
            SessionEvent::Complete { session } => &session.session_id,
        }
    }

    /// True for `Complete` and `Error`; nothing follows a terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Complete { .. } | SessionEvent::Error { .. })
    }
}

/// Callback-style observer. Keep implementations quick: the pipeline awaits each
/// handler before moving on.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_session_event(&self, _event: &SessionEvent) {}
}

/// Fan-out of session events to handlers and an optional stream.
#[derive(Clone, Default)]
pub(crate) struct EventBus {
    handlers: Vec<Arc<dyn EventHandler>>,
    stream: Option<mpsc::Sender<SessionEvent>>,
}

impl EventBus {
    pub(crate) fn new(handlers: Vec<Arc<dyn EventHandler>>) -> Self {
        Self {
            handlers,
            stream: None,
        }
    }

    pub(crate) fn with_stream(mut self, sender: mpsc::Sender<SessionEvent>) -> Self {
        self.stream = Some(sender);
        self
    }

    pub(crate) async fn emit(&self, event: SessionEvent) {
        for handler in &self.handlers {
            let delivery = AssertUnwindSafe(handler.on_session_event(&event)).catch_unwind();
            if delivery.await.is_err() {
                log::error!(
                    "EventBus: handler panicked on {} event; continuing",
                    event_name(&event)
                );
            }
        }
        if let Some(sender) = &self.stream {
            if sender.send(event).await.is_err() {
                log::debug!("EventBus: stream receiver dropped; event discarded");
            }
        }
    }
}

fn event_name(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::PhaseChange { .. } => "phase_change",
        SessionEvent::AgentResponse { .. } => "agent_response",
        SessionEvent::Complete { .. } => "complete",
        SessionEvent::Error { .. } => "error",
    }
}
