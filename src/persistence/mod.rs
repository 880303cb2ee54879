//! Persistence contracts for the orchestration core
//!
//! Every external collaborator is a capability trait with an in-memory double:
//! - [`StateStore`] - durable, conditionally-writable batch/step state
//! - [`StateCache`] - short-lived read-through mirror with TTLs
//! - [`RulesStore`] - read-only pipeline definitions and business rules
//! - [`FileStore`] - blob storage holding the uploaded vendor files

pub mod files;
pub mod memory;
pub mod rules;

#[cfg(feature = "sqlite")]
pub mod store;

pub use files::{InMemoryFileStore, LocalFileStore};
pub use memory::{InMemoryCache, InMemoryStateStore};
pub use rules::{RuleService, RulesCatalog};

#[cfg(feature = "sqlite")]
pub use store::SqliteStateStore;

use crate::core::{
    config::PipelineConfig,
    error::StoreError,
    rules::{CalculationRule, ClientConfig, HoldRecord, IrsLimits, ValidationRule},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub type StoreResult<T> = Result<T, StoreError>;

/// Kind of entity a partition holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Batch,
}

impl EntityType {
    fn prefix(&self) -> &'static str {
        match self {
            EntityType::Batch => "BATCH",
        }
    }
}

/// Sort key within a batch partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortKey {
    /// The batch record itself
    State,
    /// One step record
    Step(u32),
}

/// Structured durable key: `(entityType, batchId, stepOrder | "STATE")`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreKey {
    pub entity: EntityType,
    pub batch_id: String,
    pub sort: SortKey,
}

impl StoreKey {
    pub fn batch(batch_id: &str) -> Self {
        Self {
            entity: EntityType::Batch,
            batch_id: batch_id.to_string(),
            sort: SortKey::State,
        }
    }

    pub fn step(batch_id: &str, step_order: u32) -> Self {
        Self {
            entity: EntityType::Batch,
            batch_id: batch_id.to_string(),
            sort: SortKey::Step(step_order),
        }
    }

    /// Partition key shared by a batch record and its steps
    pub fn partition(batch_id: &str) -> String {
        format!("{}#{}", EntityType::Batch.prefix(), batch_id)
    }

    pub fn pk(&self) -> String {
        format!("{}#{}", self.entity.prefix(), self.batch_id)
    }

    pub fn sk(&self) -> String {
        match self.sort {
            SortKey::State => "STATE".to_string(),
            SortKey::Step(order) => format!("STEP#{:06}", order),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pk(), self.sk())
    }
}

/// An item as held by the durable store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub pk: String,
    pub sk: String,
    pub status: String,
    /// Incremented by the store on every committed write
    pub version: u64,
    pub body: serde_json::Value,
}

/// New content for an item; the store assigns the version
#[derive(Debug, Clone, PartialEq)]
pub struct ItemWrite {
    pub status: String,
    pub body: serde_json::Value,
}

/// Condition a write must satisfy against the current durable record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// No record may exist yet
    Absent,
    /// The current record's status must equal this
    Status(String),
    /// The current record's version must equal this
    Version(u64),
}

impl Precondition {
    /// Check against the current record, if any
    pub fn holds(&self, current: Option<&StoredItem>) -> bool {
        match (self, current) {
            (Precondition::Absent, None) => true,
            (Precondition::Status(expected), Some(item)) => &item.status == expected,
            (Precondition::Version(expected), Some(item)) => item.version == *expected,
            _ => false,
        }
    }
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Committed { version: u64 },
    /// Precondition failed; carries what the store currently holds
    Conflict {
        current_status: Option<String>,
        current_version: Option<u64>,
    },
}

impl WriteOutcome {
    pub(crate) fn conflict_with(current: Option<&StoredItem>) -> Self {
        WriteOutcome::Conflict {
            current_status: current.map(|i| i.status.clone()),
            current_version: current.map(|i| i.version),
        }
    }
}

/// Durable, conditionally-writable key/value store
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn get_item(&self, key: &StoreKey) -> StoreResult<Option<StoredItem>>;

    async fn put_item_conditional(
        &self,
        key: &StoreKey,
        precondition: Precondition,
        item: ItemWrite,
    ) -> StoreResult<WriteOutcome>;

    /// All items of a partition, ordered by sort key
    async fn query_by_partition(&self, pk: &str) -> StoreResult<Vec<StoredItem>>;
}

/// Short-lived cache; never authoritative
#[async_trait::async_trait]
pub trait StateCache: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_with_ttl(&self, key: &str, ttl: Duration, value: String) -> StoreResult<()>;

    async fn invalidate(&self, key: &str) -> StoreResult<()>;
}

/// Read-only rule and configuration store
#[async_trait::async_trait]
pub trait RulesStore: Send + Sync {
    async fn get_pipeline(&self, plan_id: &str, pay_freq: &str)
        -> StoreResult<Option<PipelineConfig>>;

    async fn list_pipelines(&self) -> StoreResult<Vec<PipelineConfig>>;

    async fn get_validation_rules(&self, category: &str) -> StoreResult<Vec<ValidationRule>>;

    /// Exact lookup, no fallback; `client_key` is `CLIENT#{planId}` or `CLIENT#GLOBAL`
    async fn get_calculation_rule(
        &self,
        client_key: &str,
        calc_type: &str,
    ) -> StoreResult<Option<CalculationRule>>;

    async fn get_irs_limits(&self, year: i32) -> StoreResult<Option<IrsLimits>>;

    async fn get_plan_holds(&self, plan_id: &str) -> StoreResult<Vec<HoldRecord>>;

    async fn get_client_config(
        &self,
        plan_id: &str,
        pay_freq: &str,
    ) -> StoreResult<Option<ClientConfig>>;
}

/// Blob storage for vendor files
#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, path: &str) -> StoreResult<Vec<u8>>;

    async fn write(&self, path: &str, data: &[u8]) -> StoreResult<()>;

    async fn move_file(&self, src: &str, dst: &str) -> StoreResult<()>;

    async fn list_files(&self, prefix: &str) -> StoreResult<Vec<String>>;

    async fn exists(&self, path: &str) -> StoreResult<bool>;
}
