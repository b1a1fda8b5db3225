//! Evaluation harness -- owns the lifecycle of one evaluation pass.
//!
//! Availability gate, schema provisioning, payload ingestion with a refresh
//! barrier, then one scoped query per rule. Every document in a pass carries
//! a fresh UUID run tag and queries are filtered to it, so concurrent or
//! historical passes against a reused cluster never contaminate each other.

use crate::backend::{
    BackendError, Document, FieldPlan, SearchBackend, CASE_ID_FIELD, CATEGORY_FIELD,
    RUN_TAG_FIELD, TIMESTAMP_FIELD,
};
use crate::classify::{ClassificationOutcome, MatchOutcome};
use crate::rules::{Rule, RuleBatch};
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default bound on concurrent rule queries against the backend.
pub const DEFAULT_WORKERS: usize = 4;
/// Default availability-probe timeout.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of one `evaluate` call.
#[derive(Debug)]
pub enum Evaluation {
    /// The availability gate (or provisioning) failed. Expected condition,
    /// not an error; the caller short-circuits to SkippedNoBackend.
    BackendUnavailable,
    Completed(EvaluationReport),
}

#[derive(Debug)]
pub struct EvaluationReport {
    pub run_tag: String,
    /// Rule name -> one outcome per test case, in case order.
    pub outcomes: BTreeMap<String, Vec<ClassificationOutcome>>,
    /// Queries the backend refused to execute, by rule name.
    pub query_errors: BTreeMap<String, String>,
}

pub struct Harness {
    backend: Arc<dyn SearchBackend>,
    health_timeout: Duration,
    workers: usize,
}

impl Harness {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self {
            backend,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Evaluate every (rule, test case) pair of the batch.
    ///
    /// Never blocks past the health-check timeout when the backend is down,
    /// and never fails the whole batch for a single bad payload: ingestion
    /// failures and rejected queries degrade to indeterminate outcomes on
    /// the affected cases only.
    pub async fn evaluate(&self, batch: &RuleBatch) -> Evaluation {
        if !self.backend.health_check(self.health_timeout).await {
            info!("Backend health check failed, skipping evaluation");
            return Evaluation::BackendUnavailable;
        }

        let plan = FieldPlan::for_batch(batch);
        if let Err(e) = self.backend.provision(&plan).await {
            // Provisioning failure is treated like the gate failing.
            warn!(error = %e, "Schema provisioning failed");
            return Evaluation::BackendUnavailable;
        }

        let run_tag = Uuid::new_v4().to_string();
        let docs = build_documents(batch, &run_tag);
        let failed_ingest: HashSet<String> = match self.backend.ingest(&docs, &run_tag).await {
            Ok(report) => {
                for (case_id, reason) in &report.failed {
                    warn!(case_id = %case_id, reason = %reason, "Payload ingest failed");
                }
                report.failed.into_iter().map(|(id, _)| id).collect()
            }
            Err(e) => {
                warn!(error = %e, "Bulk ingest failed");
                return Evaluation::BackendUnavailable;
            }
        };

        // One query per rule, bounded fan-out. Each rule gets exactly one
        // result slot, written once.
        let results: Vec<(String, Result<HashSet<String>, BackendError>)> =
            stream::iter(batch.rules.iter().map(|rule| {
                let backend = Arc::clone(&self.backend);
                let run_tag = run_tag.clone();
                async move {
                    let matched = backend.search(&rule.query, &run_tag).await;
                    (rule.name.clone(), matched)
                }
            }))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let matches: BTreeMap<String, Result<HashSet<String>, BackendError>> =
            results.into_iter().collect();

        let mut outcomes = BTreeMap::new();
        let mut query_errors = BTreeMap::new();
        for rule in &batch.rules {
            let matched = match matches.get(&rule.name) {
                Some(Ok(set)) => Some(set),
                Some(Err(e)) => {
                    warn!(rule = %rule.name, error = %e, "Query execution failed");
                    query_errors.insert(rule.name.clone(), e.to_string());
                    None
                }
                None => None,
            };
            outcomes.insert(
                rule.name.clone(),
                classify_rule(rule, matched, &failed_ingest),
            );
        }

        debug!(run_tag = %run_tag, rules = outcomes.len(), "Evaluation pass complete");
        Evaluation::Completed(EvaluationReport {
            run_tag,
            outcomes,
            query_errors,
        })
    }
}

/// Merge each payload with the structural fields the query layer requires.
fn build_documents(batch: &RuleBatch, run_tag: &str) -> Vec<Document> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut docs = Vec::new();
    for rule in &batch.rules {
        for (idx, case) in rule.test_cases.iter().enumerate() {
            let case_id = rule.case_id(idx);
            let mut body = case.log_entry.clone();
            body.entry(TIMESTAMP_FIELD.to_string())
                .or_insert_with(|| json!(now));
            body.insert(RUN_TAG_FIELD.to_string(), json!(run_tag));
            body.insert(CASE_ID_FIELD.to_string(), json!(case_id));
            body.insert(CATEGORY_FIELD.to_string(), json!(case.category.as_str()));
            docs.push(Document { case_id, body });
        }
    }
    docs
}

fn classify_rule(
    rule: &Rule,
    matched: Option<&HashSet<String>>,
    failed_ingest: &HashSet<String>,
) -> Vec<ClassificationOutcome> {
    rule.test_cases
        .iter()
        .enumerate()
        .map(|(idx, case)| {
            let case_id = rule.case_id(idx);
            let actual = match matched {
                _ if failed_ingest.contains(&case_id) => MatchOutcome::Indeterminate,
                None => MatchOutcome::Indeterminate,
                Some(set) if set.contains(&case_id) => MatchOutcome::Matched,
                Some(_) => MatchOutcome::NotMatched,
            };
            ClassificationOutcome::new(case_id, case.category, case.description.clone(), actual)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::backend::FieldType;
    use crate::classify::ConfusionCell;
    use crate::rules::{Severity, TestCase, TestCategory};
    use serde_json::{Map, Value};
    use std::time::Instant;

    fn payload(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    fn shadow_rule() -> Rule {
        Rule {
            name: "shadow_copy_deletion".into(),
            description: "vssadmin shadow copy deletion".into(),
            query: "process.name:*vssadmin* AND process.command_line:*delete*shadows*".into(),
            severity: Severity::High,
            risk_score: Some(73),
            test_cases: vec![
                TestCase::new(
                    TestCategory::TruePositive,
                    "standard deletion",
                    payload(&[
                        ("process.name", "vssadmin.exe"),
                        ("process.command_line", "vssadmin.exe delete shadows /all /quiet"),
                    ]),
                    true,
                )
                .unwrap(),
                TestCase::new(
                    TestCategory::TrueNegative,
                    "benign explorer",
                    payload(&[
                        ("process.name", "explorer.exe"),
                        ("process.command_line", "explorer.exe"),
                    ]),
                    false,
                )
                .unwrap(),
            ],
        }
    }

    fn batch() -> RuleBatch {
        RuleBatch {
            rules: vec![shadow_rule()],
        }
    }

    #[tokio::test]
    async fn correctly_provisioned_backend_yields_perfect_confusion_row() {
        let harness = Harness::new(Arc::new(MemoryBackend::new()));
        let report = match harness.evaluate(&batch()).await {
            Evaluation::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };

        let cells: Vec<ConfusionCell> = report.outcomes["shadow_copy_deletion"]
            .iter()
            .map(|o| o.cell)
            .collect();
        assert_eq!(
            cells,
            vec![ConfusionCell::TruePositive, ConfusionCell::TrueNegative]
        );
    }

    #[tokio::test]
    async fn exact_match_command_line_field_misses_the_attack() {
        // Pattern query against a keyword-typed field: the true positive
        // silently fails to match.
        let backend =
            MemoryBackend::new().with_field_override("process.command_line", FieldType::Keyword);
        let harness = Harness::new(Arc::new(backend));

        let report = match harness.evaluate(&batch()).await {
            Evaluation::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };
        let outcomes = &report.outcomes["shadow_copy_deletion"];
        assert_eq!(outcomes[0].cell, ConfusionCell::FalseNegative);
        assert_eq!(outcomes[1].cell, ConfusionCell::TrueNegative);
    }

    #[tokio::test]
    async fn unavailable_backend_short_circuits_within_timeout() {
        let backend = MemoryBackend::new();
        backend.set_unavailable(true);
        let harness = Harness::new(Arc::new(backend))
            .with_health_timeout(Duration::from_millis(200));

        let started = Instant::now();
        let evaluation = harness.evaluate(&batch()).await;
        assert!(matches!(evaluation, Evaluation::BackendUnavailable));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn malformed_query_errors_cases_without_aborting_batch() {
        let mut b = batch();
        b.rules.push(Rule {
            name: "broken".into(),
            description: String::new(),
            query: "(process.name:cmd.exe".into(),
            severity: Severity::Low,
            risk_score: None,
            test_cases: vec![TestCase::new(
                TestCategory::TruePositive,
                "attack",
                payload(&[("process.name", "cmd.exe")]),
                true,
            )
            .unwrap()],
        });

        let harness = Harness::new(Arc::new(MemoryBackend::new()));
        let report = match harness.evaluate(&b).await {
            Evaluation::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };

        assert!(report.query_errors.contains_key("broken"));
        assert!(report.outcomes["broken"]
            .iter()
            .all(|o| o.cell == ConfusionCell::Errored));
        // The healthy rule still scored normally.
        assert_eq!(
            report.outcomes["shadow_copy_deletion"][0].cell,
            ConfusionCell::TruePositive
        );
    }

    #[tokio::test]
    async fn ingest_failure_is_isolated_to_its_case() {
        let rule = shadow_rule();
        let failing_id = rule.case_id(0);
        let backend = MemoryBackend::new().with_ingest_failure(&failing_id);
        let harness = Harness::new(Arc::new(backend));

        let report = match harness.evaluate(&batch()).await {
            Evaluation::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        };
        let outcomes = &report.outcomes["shadow_copy_deletion"];
        assert_eq!(outcomes[0].cell, ConfusionCell::Errored);
        assert_eq!(outcomes[1].cell, ConfusionCell::TrueNegative);
    }

    #[tokio::test]
    async fn successive_evaluations_do_not_cross_contaminate() {
        let backend = Arc::new(MemoryBackend::new());
        let harness = Harness::new(backend);

        let first = match harness.evaluate(&batch()).await {
            Evaluation::Completed(r) => r,
            other => panic!("expected completion, got {other:?}"),
        };
        let second = match harness.evaluate(&batch()).await {
            Evaluation::Completed(r) => r,
            other => panic!("expected completion, got {other:?}"),
        };

        assert_ne!(first.run_tag, second.run_tag);
        // Same payloads ingested twice under different tags: each pass still
        // sees exactly one TP match, not two.
        assert_eq!(
            second.outcomes["shadow_copy_deletion"][0].cell,
            ConfusionCell::TruePositive
        );
        assert_eq!(second.outcomes["shadow_copy_deletion"].len(), 2);
    }
}
