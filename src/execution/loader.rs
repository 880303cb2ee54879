//! Pipeline definition loader with a read-through cache

use crate::core::{
    error::{OrchestratorError, Result},
    PipelineDefinition, Settings,
};
use crate::persistence::{RulesStore, StateCache};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Loads validated pipeline definitions from the rule store
///
/// Definitions are cached for `pipeline_cache_ttl_secs` and never invalidated proactively;
/// a changed definition is picked up when the entry expires.
pub struct PipelineLoader {
    rules: Arc<dyn RulesStore>,
    cache: Arc<dyn StateCache>,
    ttl: Duration,
}

impl PipelineLoader {
    pub fn new(rules: Arc<dyn RulesStore>, cache: Arc<dyn StateCache>, settings: &Settings) -> Self {
        Self {
            rules,
            cache,
            ttl: Duration::from_secs(settings.pipeline_cache_ttl_secs),
        }
    }

    fn cache_key(plan_id: &str, pay_freq: &str) -> String {
        format!("pipeline:{}:{}", plan_id, pay_freq)
    }

    /// Load the definition for a plan and pay frequency, steps in ascending order
    pub async fn load(&self, plan_id: &str, pay_freq: &str) -> Result<PipelineDefinition> {
        let cache_key = Self::cache_key(plan_id, pay_freq);

        match self.cache.get(&cache_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<PipelineDefinition>(&raw) {
                Ok(definition) => {
                    debug!("Pipeline cache hit: {}", cache_key);
                    return Ok(definition);
                }
                Err(e) => warn!("Ignoring undecodable pipeline cache entry {}: {}", cache_key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Pipeline cache read failed for {}: {}", cache_key, e),
        }

        let config = self
            .rules
            .get_pipeline(plan_id, pay_freq)
            .await?
            .ok_or_else(|| OrchestratorError::PipelineNotFound {
                plan_id: plan_id.to_string(),
                pay_freq: pay_freq.to_string(),
            })?;

        let definition = PipelineDefinition::from_config(config)?;
        info!(
            "Loaded pipeline {} with {} steps",
            definition.key(),
            definition.steps().len()
        );

        let encoded = serde_json::to_string(&definition)?;
        if let Err(e) = self.cache.set_with_ttl(&cache_key, self.ttl, encoded).await {
            warn!("Failed to cache pipeline {}: {}", cache_key, e);
        }

        Ok(definition)
    }

    /// Validate every definition in the rule store, bypassing the cache
    pub async fn validate_all(&self) -> Result<Vec<(String, Result<PipelineDefinition>)>> {
        let configs = self.rules.list_pipelines().await?;
        Ok(configs
            .into_iter()
            .map(|config| (config.key(), PipelineDefinition::from_config(config)))
            .collect())
    }
}
