use llmpanel::client_wrapper::TokenUsage;
use llmpanel::cost::{CostEstimator, Pricing};
use llmpanel::models::{normalize_model, provider_for};

#[test]
fn test_estimates_are_deterministic() {
    let estimator = CostEstimator::new();
    let text = "Design a multi-region failover plan for our payments API.";
    let first = estimator.estimate("gpt-4o", text, 800).unwrap();
    for _ in 0..10 {
        assert_eq!(estimator.estimate("gpt-4o", text, 800).unwrap(), first);
    }
}

#[test]
fn test_unknown_model_always_errors() {
    let estimator = CostEstimator::new();
    for _ in 0..3 {
        let err = estimator.estimate("totally-made-up-9000", "hi", 10).unwrap_err();
        assert_eq!(err.model, "totally-made-up-9000");
    }
    assert!(estimator
        .actual_cost("totally-made-up-9000", &TokenUsage::new(1, 1))
        .is_err());
}

#[test]
fn test_input_and_output_priced_independently() {
    let estimator = CostEstimator::new();
    // 4_000 chars -> 1_000 input tokens.
    let estimate = estimator
        .estimate("claude-sonnet-4", &"x".repeat(4_000), 2_000)
        .unwrap();
    assert_eq!(estimate.input_tokens, 1_000);
    assert_eq!(estimate.output_tokens, 2_000);
    let expected = 1_000.0 / 1e6 * 3.0 + 2_000.0 / 1e6 * 15.0;
    assert!((estimate.cost - expected).abs() < 1e-12);
}

#[test]
fn test_empty_input_has_zero_tokens() {
    let estimate = CostEstimator::new().estimate("gpt-4o", "", 0).unwrap();
    assert_eq!(estimate.input_tokens, 0);
    assert_eq!(estimate.cost, 0.0);
}

#[test]
fn test_aliases_share_prices() {
    let estimator = CostEstimator::new();
    let a = estimator.estimate("Claude_3.5_Sonnet", "hello", 10).unwrap();
    let b = estimator.estimate("claude-3-5-sonnet-20241022", "hello", 10).unwrap();
    assert_eq!(a, b);
    assert_eq!(normalize_model("Claude_3.5_Sonnet"), "claude-3-5-sonnet");
    assert_eq!(provider_for("claude-3-5-sonnet"), Some("anthropic"));
}

#[test]
fn test_actual_cost_from_usage() {
    let estimator = CostEstimator::empty().with_price("house-model", Pricing::per_token(1.0, 2.0));
    let cost = estimator
        .actual_cost("house-model", &TokenUsage::new(500_000, 250_000))
        .unwrap();
    assert!((cost - 1.0).abs() < 1e-12);
}

#[test]
fn test_dated_snapshots_use_base_price() {
    let estimator = CostEstimator::new();
    let base = estimator.estimate("gpt-4o", "hello", 10).unwrap();
    assert_eq!(estimator.estimate("gpt-4o-2024-08-06", "hello", 10).unwrap(), base);
    let key = normalize_model("m-12345678-12345678");
    assert_eq!(normalize_model(&key), key);
}
