//! Test: calculation rules fall back to the global client partition

use crate::helpers::*;
use payflow::agent::{LocalTransport, SimulatedAgent};
use payflow::core::{
    rules::{client_key, CalculationRule, ClientConfig, GLOBAL_CLIENT_KEY},
    BatchStatus, OrchestratorError, Settings,
};
use payflow::execution::CompletionRouter;
use payflow::persistence::{InMemoryCache, InMemoryStateStore, RuleService, RulesCatalog};
use std::sync::Arc;

fn rule(formula: &str) -> CalculationRule {
    CalculationRule {
        calc_type: "ER_MATCH".to_string(),
        formula: formula.to_string(),
        parameters: serde_json::Map::new(),
    }
}

#[tokio::test]
async fn test_new_client_uses_global_formula() {
    let catalog = RulesCatalog::new()
        .with_calculation_rule(GLOBAL_CLIENT_KEY, rule("0.5 * min(deferral, 0.06 * comp)"))
        .with_calculation_rule(&client_key("ACME"), rule("1.0 * min(deferral, 0.04 * comp)"));
    let cache = Arc::new(InMemoryCache::new());
    let service = RuleService::new(Arc::new(catalog), cache.clone(), &Settings::default());

    let first = service.calculation_rule("NEWCLIENT", "ER_MATCH").await.unwrap();
    let second = service.calculation_rule("NEWCLIENT", "ER_MATCH").await.unwrap();

    assert_eq!(first.formula, "0.5 * min(deferral, 0.06 * comp)");
    assert_eq!(first, second);
    assert!(cache.contains("calc_rule:NEWCLIENT:ER_MATCH").await);

    let acme = service.calculation_rule("ACME", "ER_MATCH").await.unwrap();
    assert_eq!(acme.formula, "1.0 * min(deferral, 0.04 * comp)");
}

#[tokio::test]
async fn test_missing_rule_is_an_error() {
    let service = RuleService::new(
        Arc::new(RulesCatalog::new()),
        Arc::new(InMemoryCache::new()),
        &Settings::default(),
    );

    let result = service.calculation_rule("NEWCLIENT", "ER_MATCH").await;
    assert!(matches!(result, Err(OrchestratorError::RuleNotFound { .. })));
}

#[tokio::test]
async fn test_cache_outage_does_not_fail_the_batch() {
    let rules = catalog(two_step_pipeline()).with_client_config(
        PLAN,
        FREQ,
        ClientConfig {
            custodian: Some("Fidelity".to_string()),
            ..ClientConfig::default()
        },
    );
    let cache = Arc::new(InMemoryCache::new());
    cache.set_available(false);

    let router = Arc::new(CompletionRouter::new());
    let transport = Arc::new(LocalTransport::new(Arc::new(SimulatedAgent::new()), router.clone()));
    let (executor, _) = build_executor_with_cache(
        rules,
        Arc::new(InMemoryStateStore::new()),
        cache,
        transport.clone(),
        router,
        Settings::default(),
    )
    .await;

    let state = executor.run("batch-no-cache", PLAN, FREQ, SOURCE).await.unwrap();

    assert_eq!(state.status, BatchStatus::Completed);
    assert_eq!(transport.dispatched().await.len(), 2);
}
