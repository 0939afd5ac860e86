use async_trait::async_trait;
use llmpanel::client_wrapper::{ChatResponse, ClientError, ClientWrapper, TokenUsage};
use llmpanel::cost::CostEstimator;
use llmpanel::dispatcher::Dispatcher;
use llmpanel::ledger::{BudgetConfig, UsageLedger};
use llmpanel::rate_limiter::{RateLimit, RateLimiter};
use llmpanel::{Agent, AgentRole};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct MockClient {
    response: String,
    last_system_prompt: Mutex<Option<String>>,
}

#[async_trait]
impl ClientWrapper for MockClient {
    async fn chat(
        &self,
        system_prompt: &str,
        _user_message: &str,
        _model: &str,
        _max_tokens: Option<usize>,
    ) -> Result<ChatResponse, ClientError> {
        *self.last_system_prompt.lock().unwrap() = Some(system_prompt.to_string());
        Ok(ChatResponse::new(self.response.clone()).with_usage(TokenUsage::new(12, 34)))
    }
}

fn setup(limiter: RateLimiter) -> (Arc<MockClient>, Arc<Dispatcher>) {
    let client = Arc::new(MockClient {
        response: "test response".to_string(),
        last_system_prompt: Mutex::new(None),
    });
    let dispatcher = Dispatcher::new(
        client.clone(),
        Arc::new(limiter),
        Arc::new(UsageLedger::in_memory(BudgetConfig::unlimited())),
        Arc::new(CostEstimator::new()),
    );
    (client, Arc::new(dispatcher))
}

#[test]
fn test_agent_identities() {
    let (_, dispatcher) = setup(RateLimiter::new());

    let synthesizer = Agent::synthesizer(Arc::clone(&dispatcher), "gpt-4o");
    assert_eq!(synthesizer.id, "synthesizer");
    assert_eq!(synthesizer.role(), &AgentRole::Synthesizer);

    let reviewer = Agent::reviewer(Arc::clone(&dispatcher), "gpt-4o");
    assert_eq!(reviewer.name, "Critical Reviewer");

    let expert = Agent::domain_expert("machine learning", dispatcher, "gpt-4o");
    assert_eq!(expert.id, "expert-machine-learning");
    assert_eq!(expert.name, "Machine Learning Expert");
    assert_eq!(expert.role().domain(), Some("machine learning"));
}

#[tokio::test]
async fn test_successful_response_carries_usage_metadata() {
    let (_, dispatcher) = setup(RateLimiter::new());
    let agent = Agent::reviewer(dispatcher, "GPT-4o");

    let response = agent.process("Review this").await;

    assert!(response.success);
    assert_eq!(response.content, "test response");
    assert_eq!(response.model, "gpt-4o");
    assert_eq!(response.agent_id, "reviewer");
    assert_eq!(response.metadata.get("input_tokens"), Some(&Value::from(12)));
    assert_eq!(response.metadata.get("output_tokens"), Some(&Value::from(34)));
    assert!(response.metadata.contains_key("transaction_id"));
    assert!(response.metadata.contains_key("actual_cost"));
}

#[tokio::test]
async fn test_rate_limit_becomes_failed_response() {
    let (_, dispatcher) =
        setup(RateLimiter::new().with_limit("gpt-4o", RateLimit::new(1, 1_000_000)));
    let agent = Agent::domain_expert("security", dispatcher, "gpt-4o");

    assert!(agent.process("first").await.success);
    let refused = agent.process("second").await;

    assert!(!refused.success);
    assert!(refused.content.is_empty());
    assert!(refused.error.as_deref().unwrap().contains("rate limit exceeded"));
    assert_eq!(refused.metadata.get("error_kind"), Some(&Value::from("rate_limited")));
}

#[tokio::test]
async fn test_personality_extends_system_prompt() {
    let (client, dispatcher) = setup(RateLimiter::new());
    let agent = Agent::synthesizer(dispatcher, "gpt-4o").with_personality("Blunt");

    agent.process("hello").await;

    let prompt = client.last_system_prompt.lock().unwrap().clone().unwrap();
    assert!(prompt.ends_with("Personality: Blunt"));
}

#[tokio::test]
async fn test_caller_metadata_is_kept() {
    let (_, dispatcher) = setup(RateLimiter::new());
    let agent = Agent::synthesizer(dispatcher, "gpt-4o");
    let mut metadata = HashMap::new();
    metadata.insert("round".to_string(), Value::from(2));

    let response = agent.process_with_metadata("hello", metadata).await;
    assert_eq!(response.metadata.get("round"), Some(&Value::from(2)));

    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["role"]["role"], "synthesizer");
}
