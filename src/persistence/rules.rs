//! Rule catalog and cached rule lookups

use crate::core::{
    config::PipelineConfig,
    error::{OrchestratorError, Result},
    rules::{
        client_key, CalculationRule, ClientConfig, HoldRecord, IrsLimits, ValidationRule,
        GLOBAL_CLIENT_KEY,
    },
    settings::Settings,
};
use crate::persistence::{RulesStore, StateCache, StoreResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// In-memory rule store, loadable from a YAML catalog
///
/// Pipeline definitions are kept as written; validation happens in the loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesCatalog {
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,

    /// Keyed by `CLIENT#{planId}` or `CLIENT#GLOBAL`
    #[serde(default)]
    pub calculation_rules: HashMap<String, Vec<CalculationRule>>,

    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,

    #[serde(default)]
    pub holds: Vec<HoldRecord>,

    #[serde(default)]
    pub irs_limits: Vec<IrsLimits>,

    /// Keyed by `{planId}_{payFreq}`
    #[serde(default)]
    pub client_configs: HashMap<String, ClientConfig>,
}

impl RulesCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rules file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipelines.push(pipeline);
        self
    }

    pub fn with_calculation_rule(mut self, client_key: &str, rule: CalculationRule) -> Self {
        self.calculation_rules
            .entry(client_key.to_string())
            .or_default()
            .push(rule);
        self
    }

    pub fn with_hold(mut self, hold: HoldRecord) -> Self {
        self.holds.push(hold);
        self
    }

    pub fn with_client_config(mut self, plan_id: &str, pay_freq: &str, config: ClientConfig) -> Self {
        self.client_configs
            .insert(crate::core::config::pipeline_key(plan_id, pay_freq), config);
        self
    }
}

#[async_trait::async_trait]
impl RulesStore for RulesCatalog {
    async fn get_pipeline(
        &self,
        plan_id: &str,
        pay_freq: &str,
    ) -> StoreResult<Option<PipelineConfig>> {
        Ok(self
            .pipelines
            .iter()
            .find(|p| p.plan_id == plan_id && p.pay_freq == pay_freq)
            .cloned())
    }

    async fn list_pipelines(&self) -> StoreResult<Vec<PipelineConfig>> {
        Ok(self.pipelines.clone())
    }

    async fn get_validation_rules(&self, category: &str) -> StoreResult<Vec<ValidationRule>> {
        Ok(self
            .validation_rules
            .iter()
            .filter(|r| r.category == category)
            .cloned()
            .collect())
    }

    async fn get_calculation_rule(
        &self,
        client_key: &str,
        calc_type: &str,
    ) -> StoreResult<Option<CalculationRule>> {
        Ok(self
            .calculation_rules
            .get(client_key)
            .and_then(|rules| rules.iter().find(|r| r.calc_type == calc_type))
            .cloned())
    }

    async fn get_irs_limits(&self, year: i32) -> StoreResult<Option<IrsLimits>> {
        Ok(self.irs_limits.iter().find(|l| l.year == year).cloned())
    }

    async fn get_plan_holds(&self, plan_id: &str) -> StoreResult<Vec<HoldRecord>> {
        Ok(self
            .holds
            .iter()
            .filter(|h| h.plan_id == plan_id)
            .cloned()
            .collect())
    }

    async fn get_client_config(
        &self,
        plan_id: &str,
        pay_freq: &str,
    ) -> StoreResult<Option<ClientConfig>> {
        Ok(self
            .client_configs
            .get(&crate::core::config::pipeline_key(plan_id, pay_freq))
            .cloned())
    }
}

/// Rule lookups with caching and the client-specific to global fallback
pub struct RuleService {
    store: Arc<dyn RulesStore>,
    cache: Arc<dyn StateCache>,
    ttl: Duration,
}

impl RuleService {
    pub fn new(store: Arc<dyn RulesStore>, cache: Arc<dyn StateCache>, settings: &Settings) -> Self {
        Self {
            store,
            cache,
            ttl: Duration::from_secs(settings.rules_cache_ttl_secs),
        }
    }

    /// Resolve a calculation rule: `CLIENT#{planId}` first, then `CLIENT#GLOBAL`.
    ///
    /// A rule missing from both is an error, never an empty result.
    pub async fn calculation_rule(&self, plan_id: &str, calc_type: &str) -> Result<CalculationRule> {
        let cache_key = format!("calc_rule:{}:{}", plan_id, calc_type);
        if let Some(rule) = self.cached::<CalculationRule>(&cache_key).await {
            debug!("Calculation rule cache hit: {}", cache_key);
            return Ok(rule);
        }

        let rule = match self
            .store
            .get_calculation_rule(&client_key(plan_id), calc_type)
            .await?
        {
            Some(rule) => rule,
            None => self
                .store
                .get_calculation_rule(GLOBAL_CLIENT_KEY, calc_type)
                .await?
                .ok_or_else(|| OrchestratorError::RuleNotFound {
                    plan_id: plan_id.to_string(),
                    calc_type: calc_type.to_string(),
                })?,
        };

        self.remember(&cache_key, &rule).await?;
        Ok(rule)
    }

    pub async fn validation_rules(&self, category: &str) -> Result<Vec<ValidationRule>> {
        Ok(self.store.get_validation_rules(category).await?)
    }

    pub async fn irs_limits(&self, year: i32) -> Result<Option<IrsLimits>> {
        Ok(self.store.get_irs_limits(year).await?)
    }

    pub async fn plan_holds(&self, plan_id: &str) -> Result<Vec<HoldRecord>> {
        Ok(self.store.get_plan_holds(plan_id).await?)
    }

    /// Client configuration, empty when none is stored
    pub async fn client_config(&self, plan_id: &str, pay_freq: &str) -> Result<ClientConfig> {
        let cache_key = format!("client_config:{}:{}", plan_id, pay_freq);
        if let Some(config) = self.cached::<ClientConfig>(&cache_key).await {
            return Ok(config);
        }

        let config = self
            .store
            .get_client_config(plan_id, pay_freq)
            .await?
            .unwrap_or_default();
        self.remember(&cache_key, &config).await?;
        Ok(config)
    }

    /// Cache a resolved value; a cache outage only costs the next lookup a store read
    async fn remember<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        if let Err(e) = self.cache.set_with_ttl(key, self.ttl, encoded).await {
            warn!("Failed to cache {}: {}", key, e);
        }
        Ok(())
    }

    async fn cached<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Discarding undecodable cache entry {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Rule cache read failed for {}: {}", key, e);
                None
            }
        }
    }
}
