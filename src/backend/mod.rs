//! Search backend abstraction.
//!
//! The evaluation harness talks to a disposable, search-indexed log store
//! through this trait: Elasticsearch over HTTP in production, an in-process
//! store for tests and offline runs.

pub mod elastic;
pub mod memory;

use crate::query;
use crate::rules::RuleBatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use thiserror::Error;

/// Structural field carrying the run-scoped isolation tag.
pub const RUN_TAG_FIELD: &str = "test.run_tag";
/// Structural field carrying the unique case document id.
pub const CASE_ID_FIELD: &str = "test.case_id";
/// Structural field carrying the case's lifecycle/category marker.
pub const CATEGORY_FIELD: &str = "test.category";
/// Event timestamp, always present on ingested documents.
pub const TIMESTAMP_FIELD: &str = "@timestamp";

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed query: {0}")]
    MalformedQuery(String),

    #[error("backend protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Unavailable(err.to_string())
    }
}

/// Index field types the harness provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Exact-match indexing.
    Keyword,
    /// Pattern-capable indexing, required for wildcard/substring queries.
    Pattern,
    Date,
}

/// Field mappings for one evaluation index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldPlan {
    pub fields: BTreeMap<String, FieldType>,
}

impl FieldPlan {
    /// Derive the plan for a batch: every field any query touches with a
    /// wildcard pattern becomes pattern-capable, every other referenced or
    /// ingested field gets a keyword default, and the structural fields are
    /// always present. Queries that fail to parse contribute nothing here;
    /// they surface as errored cases at execution time instead.
    pub fn for_batch(batch: &RuleBatch) -> Self {
        let mut fields = BTreeMap::new();

        for rule in &batch.rules {
            for case in &rule.test_cases {
                for (name, _) in query::flatten(&case.log_entry) {
                    fields.entry(name).or_insert(FieldType::Keyword);
                }
            }
            if let Ok(ast) = query::parse(&rule.query) {
                for field in query::fields(&ast) {
                    fields.entry(field).or_insert(FieldType::Keyword);
                }
                for field in query::wildcard_fields(&ast) {
                    fields.insert(field, FieldType::Pattern);
                }
            }
        }

        fields.insert(TIMESTAMP_FIELD.to_string(), FieldType::Date);
        fields.insert(RUN_TAG_FIELD.to_string(), FieldType::Keyword);
        fields.insert(CASE_ID_FIELD.to_string(), FieldType::Keyword);
        fields.insert(CATEGORY_FIELD.to_string(), FieldType::Keyword);
        Self { fields }
    }

    /// An existing schema is compatible when every planned field is already
    /// mapped with the same type. Extra fields from earlier runs are fine.
    pub fn compatible_with(&self, existing: &FieldPlan) -> bool {
        self.fields
            .iter()
            .all(|(name, ty)| existing.fields.get(name) == Some(ty))
    }
}

/// One document ready for ingestion.
#[derive(Debug, Clone)]
pub struct Document {
    pub case_id: String,
    pub body: Map<String, Value>,
}

/// Per-document ingestion outcome. Individual failures do not abort a batch.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub failed: Vec<(String, String)>,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Lightweight availability probe, bounded by `timeout`.
    async fn health_check(&self, timeout: Duration) -> bool;

    /// Create or reuse the evaluation index. Idempotent for a compatible
    /// existing schema; drops and recreates an incompatible one.
    async fn provision(&self, plan: &FieldPlan) -> Result<(), BackendError>;

    /// Ingest documents tagged with `run_tag`, followed by a refresh barrier
    /// so immediately subsequent queries observe them.
    async fn ingest(&self, docs: &[Document], run_tag: &str) -> Result<IngestReport, BackendError>;

    /// Run a query scoped to `run_tag` documents; returns matched case ids.
    async fn search(&self, query: &str, run_tag: &str) -> Result<HashSet<String>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{Rule, RuleBatch, Severity, TestCase, TestCategory};
    use serde_json::json;

    fn batch() -> RuleBatch {
        let mut payload = Map::new();
        payload.insert("process.command_line".into(), json!("vssadmin delete shadows"));
        payload.insert("user.name".into(), json!("SYSTEM"));
        RuleBatch {
            rules: vec![Rule {
                name: "shadow_copy_deletion".into(),
                description: String::new(),
                query: "process.name:*vssadmin* AND event.action:start".into(),
                severity: Severity::High,
                risk_score: None,
                test_cases: vec![TestCase::new(
                    TestCategory::TruePositive,
                    "attack",
                    payload,
                    true,
                )
                .unwrap()],
            }],
        }
    }

    #[test]
    fn wildcard_fields_become_pattern_capable() {
        let plan = FieldPlan::for_batch(&batch());
        assert_eq!(plan.fields.get("process.name"), Some(&FieldType::Pattern));
        assert_eq!(plan.fields.get("event.action"), Some(&FieldType::Keyword));
        // Payload-only fields get the keyword default.
        assert_eq!(plan.fields.get("user.name"), Some(&FieldType::Keyword));
        // Structural fields always present.
        assert_eq!(plan.fields.get(TIMESTAMP_FIELD), Some(&FieldType::Date));
        assert_eq!(plan.fields.get(RUN_TAG_FIELD), Some(&FieldType::Keyword));
    }

    #[test]
    fn plan_compatibility_ignores_extra_existing_fields() {
        let plan = FieldPlan::for_batch(&batch());
        let mut existing = plan.clone();
        existing
            .fields
            .insert("leftover.field".into(), FieldType::Keyword);
        assert!(plan.compatible_with(&existing));

        let mut mismatched = plan.clone();
        mismatched
            .fields
            .insert("process.name".into(), FieldType::Keyword);
        assert!(!plan.compatible_with(&mismatched));
    }
}
