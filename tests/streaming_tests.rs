use async_trait::async_trait;
use llmpanel::client_wrapper::{ChatResponse, ClientError, ClientWrapper};
use llmpanel::cost::CostEstimator;
use llmpanel::dispatcher::Dispatcher;
use llmpanel::event::{EventHandler, SessionEvent};
use llmpanel::ledger::{BudgetConfig, UsageLedger};
use llmpanel::rate_limiter::RateLimiter;
use llmpanel::{PanelConfig, Phase, ProcessOrchestrator};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct MockClient {
    fail_unpack: bool,
}

#[async_trait]
impl ClientWrapper for MockClient {
    async fn chat(
        &self,
        system_prompt: &str,
        user_message: &str,
        _model: &str,
        _max_tokens: Option<usize>,
    ) -> Result<ChatResponse, ClientError> {
        let unpacking = !system_prompt.contains("critical reviewer")
            && !system_prompt.contains("domain expert")
            && !user_message.contains("Expert analyses:");
        if unpacking && self.fail_unpack {
            return Err("unpack refused".into());
        }
        // Stagger analysts so completion order differs from submission order.
        if system_prompt.contains("critical reviewer") {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        Ok(ChatResponse::new("fixed text"))
    }
}

fn orchestrator(fail_unpack: bool, event_buffer: usize) -> ProcessOrchestrator {
    let dispatcher = Dispatcher::new(
        Arc::new(MockClient { fail_unpack }),
        Arc::new(RateLimiter::new()),
        Arc::new(UsageLedger::in_memory(BudgetConfig::unlimited())),
        Arc::new(CostEstimator::new()),
    );
    let mut config = PanelConfig::default()
        .with_persist_rate_limits(false)
        .with_model("gpt-4o");
    config.event_buffer = event_buffer;
    ProcessOrchestrator::new(Arc::new(dispatcher), config)
}

fn label(event: &SessionEvent) -> String {
    match event {
        SessionEvent::PhaseChange { phase, .. } => format!("phase:{}", phase),
        SessionEvent::AgentResponse { phase, .. } => format!("response:{}", phase),
        SessionEvent::Complete { .. } => "complete".to_string(),
        SessionEvent::Error { .. } => "error".to_string(),
    }
}

async fn drain(mut receiver: mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(event) = receiver.recv().await {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_stream_event_ordering() {
    let orchestrator = orchestrator(false, 64);
    let events = drain(orchestrator.solve_stream("Scale our API", &["tech", "security"])).await;

    let labels: Vec<String> = events.iter().map(label).collect();
    assert_eq!(
        labels,
        vec![
            "phase:unpacking",
            "response:unpacking",
            "phase:analyzing",
            "response:analyzing",
            "response:analyzing",
            "response:analyzing",
            "phase:synthesizing",
            "response:synthesizing",
            "complete",
        ]
    );

    let session_id = events[0].session_id().to_string();
    assert!(events.iter().all(|e| e.session_id() == session_id));
    assert!(events.last().unwrap().is_terminal());

    match events.last().unwrap() {
        SessionEvent::Complete { session } => {
            assert_eq!(session.phase, Phase::Completed);
            // Streamed analysis responses arrive in the session's completion order.
            let streamed: Vec<&str> = events
                .iter()
                .filter_map(|e| match e {
                    SessionEvent::AgentResponse {
                        phase: Phase::Analyzing,
                        response,
                        ..
                    } => Some(response.agent_id.as_str()),
                    _ => None,
                })
                .collect();
            let recorded: Vec<&str> = session
                .analysis_results
                .iter()
                .map(|r| r.agent_id.as_str())
                .collect();
            assert_eq!(streamed, recorded);
            assert_eq!(recorded.last(), Some(&"reviewer"));
        }
        other => panic!("expected completion, got {}", label(other)),
    }
}

#[derive(Default)]
struct Recorder {
    labels: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_session_event(&self, event: &SessionEvent) {
        self.labels.lock().unwrap().push(label(event));
    }
}

#[tokio::test]
async fn test_stream_matches_callback_sequence() {
    let recorder = Arc::new(Recorder::default());
    let orchestrator = orchestrator(false, 64).with_event_handler(recorder.clone());

    orchestrator.solve("Scale our API", &["tech", "security"]).await;
    let via_callbacks = recorder.labels.lock().unwrap().clone();
    recorder.labels.lock().unwrap().clear();

    let receiver = orchestrator.solve_stream("Scale our API", &["tech", "security"]);
    let streamed: Vec<String> = drain(receiver).await.iter().map(label).collect();

    assert_eq!(streamed, via_callbacks);
    // Handlers registered on the orchestrator also observe streamed sessions.
    assert_eq!(*recorder.labels.lock().unwrap(), streamed);
}

#[tokio::test]
async fn test_stream_reports_unpack_error() {
    let orchestrator = orchestrator(true, 64);
    let events = drain(orchestrator.solve_stream("Scale our API", &["tech"])).await;

    let labels: Vec<String> = events.iter().map(label).collect();
    assert_eq!(labels, vec!["phase:unpacking", "response:unpacking", "error"]);
    match events.last().unwrap() {
        SessionEvent::Error {
            message, session, ..
        } => {
            assert!(message.contains("unpack refused"));
            assert_eq!(session.phase, Phase::Error);
        }
        other => panic!("expected error, got {}", label(other)),
    }
}

#[tokio::test]
async fn test_small_buffer_applies_backpressure_without_loss() {
    let orchestrator = orchestrator(false, 1);
    let mut receiver = orchestrator.solve_stream("Scale our API", &["a", "b", "c", "d"]);

    let mut count = 0;
    while let Some(_event) = receiver.recv().await {
        count += 1;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    // 3 phase changes + 1 unpack + 5 analyses + 1 synthesis + complete
    assert_eq!(count, 11);
}

#[tokio::test]
async fn test_dropped_receiver_does_not_stop_session() {
    let orchestrator = orchestrator(false, 1);
    drop(orchestrator.solve_stream("Scale our API", &["tech"]));

    let ledger = Arc::clone(orchestrator.dispatcher().ledger());
    let mut waited = Duration::ZERO;
    while ledger.len() < 4 && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }
    // unpack + reviewer + tech expert + synthesis
    assert_eq!(ledger.len(), 4);
}
