//! Feedback synthesis -- turning failure patterns into correction signals.
//!
//! The report produced here is the only channel of information the external
//! generator sees between iterations. It is structured data, diagnosed from
//! confusion-matrix patterns by fixed rules, with a deterministic prompt
//! rendering; no backend internals leak into it.

use crate::classify::{ClassificationOutcome, ConfusionCell};
use crate::controller::QualityThresholds;
use crate::harness::EvaluationReport;
use crate::metrics::{AggregateMetrics, RuleMetrics};
use crate::rules::RuleBatch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;

/// Fixed failure taxonomy. Assignment is rule-based on the confusion
/// matrix, never free-form inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Diagnosis {
    /// The generator emitted no scorable test cases for this rule.
    NoTestCases,
    /// The backend refused to execute the query; fix syntax, not thresholds.
    QuerySyntaxError,
    /// Zero matches across every case despite positive payloads present:
    /// schema/field-type mismatch suspected rather than query logic.
    FieldTypeMismatch,
    /// Negative-class cases matched; the query needs exclusion filters.
    QueryTooBroad,
    /// Positive-class cases missed with no spurious matches; broaden.
    QueryTooNarrow,
    /// Both false positives and false negatives present.
    QueryUnbalanced,
}

impl Diagnosis {
    fn recommendation(self) -> &'static str {
        match self {
            Diagnosis::NoTestCases => {
                "Generate labeled test cases for this rule; it cannot be scored without them"
            }
            Diagnosis::QuerySyntaxError => {
                "Fix the query syntax (balanced parentheses, no empty clauses, valid operators)"
            }
            Diagnosis::FieldTypeMismatch => {
                "The query matched nothing at all; verify field names against the log schema and keep wildcard patterns on text-like fields"
            }
            Diagnosis::QueryTooBroad => {
                "Add exclusion filters or tighten conditions (parent process checks, user context, exact paths)"
            }
            Diagnosis::QueryTooNarrow => {
                "Broaden the query to cover attack variants (wildcards, alternate command patterns)"
            }
            Diagnosis::QueryUnbalanced => {
                "Fix false positives first (add filters), then broaden for the missed variants"
            }
        }
    }
}

/// One misclassified (or errored) case, with enough payload context for the
/// generator to understand what went wrong.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MisclassifiedCase {
    pub case_id: String,
    pub category: String,
    pub description: String,
    pub expected_match: bool,
    pub cell: ConfusionCell,
    pub payload_snippet: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleFeedback {
    pub rule: String,
    pub query: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub failing_metrics: Vec<String>,
    pub diagnosis: Diagnosis,
    pub misclassified: Vec<MisclassifiedCase>,
    /// FN-category cases that matched despite claiming to evade: a test
    /// data-quality problem, reported on the case rather than the rule.
    pub label_anomalies: Vec<String>,
}

/// The structured correction report handed back to the generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackReport {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub aggregate: AggregateMetrics,
    pub min_precision: f64,
    pub min_recall: f64,
    pub rules: Vec<RuleFeedback>,
}

/// Build the feedback report for every rule that missed a threshold.
pub fn synthesize(
    batch: &RuleBatch,
    report: &EvaluationReport,
    per_rule: &BTreeMap<String, RuleMetrics>,
    aggregate: &AggregateMetrics,
    thresholds: &QualityThresholds,
) -> FeedbackReport {
    let mut rules = Vec::new();

    for rule in &batch.rules {
        let Some(metrics) = per_rule.get(&rule.name) else {
            continue;
        };
        let outcomes = report
            .outcomes
            .get(&rule.name)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let mut failing = Vec::new();
        if metrics.precision() < thresholds.min_precision {
            failing.push(format!(
                "precision {:.3} < {:.2}",
                metrics.precision(),
                thresholds.min_precision
            ));
        }
        if metrics.recall() < thresholds.min_recall {
            failing.push(format!(
                "recall {:.3} < {:.2}",
                metrics.recall(),
                thresholds.min_recall
            ));
        }
        let has_query_error = report.query_errors.contains_key(&rule.name);
        if failing.is_empty() && !has_query_error && metrics.anomalies == 0 {
            continue;
        }

        let diagnosis = diagnose(metrics, has_query_error);
        let misclassified = outcomes
            .iter()
            .zip(&rule.test_cases)
            .filter(|(o, _)| {
                matches!(
                    o.cell,
                    ConfusionCell::FalsePositive
                        | ConfusionCell::FalseNegative
                        | ConfusionCell::Errored
                )
            })
            .map(|(o, case)| MisclassifiedCase {
                case_id: o.case_id.clone(),
                category: o.category.to_string(),
                description: o.description.clone(),
                expected_match: case.expected_match,
                cell: o.cell,
                payload_snippet: snippet(&case.log_entry),
            })
            .collect();
        let label_anomalies = outcomes
            .iter()
            .filter(|o| o.cell == ConfusionCell::EvasionContradicted)
            .map(|o| o.case_id.clone())
            .collect();

        rules.push(RuleFeedback {
            rule: rule.name.clone(),
            query: rule.query.clone(),
            precision: metrics.precision(),
            recall: metrics.recall(),
            f1: metrics.f1(),
            failing_metrics: failing,
            diagnosis,
            misclassified,
            label_anomalies,
        });
    }

    FeedbackReport {
        generated_at: chrono::Utc::now(),
        aggregate: aggregate.clone(),
        min_precision: thresholds.min_precision,
        min_recall: thresholds.min_recall,
        rules,
    }
}

/// Confusion-matrix pattern rules, checked in priority order.
fn diagnose(metrics: &RuleMetrics, has_query_error: bool) -> Diagnosis {
    if has_query_error {
        return Diagnosis::QuerySyntaxError;
    }
    if metrics.scorable() == 0 {
        return Diagnosis::NoTestCases;
    }
    // No matches anywhere, yet positive cases existed: the query logic may
    // be sound but the fields it touches are not indexed the way it assumes.
    if metrics.tp == 0 && metrics.fp == 0 && metrics.fn_ > 0 {
        return Diagnosis::FieldTypeMismatch;
    }
    match (metrics.fp > 0, metrics.fn_ > 0) {
        (true, false) => Diagnosis::QueryTooBroad,
        (false, true) => Diagnosis::QueryTooNarrow,
        (true, true) => Diagnosis::QueryUnbalanced,
        // Thresholds missed at the aggregate level, nothing wrong locally.
        (false, false) => Diagnosis::QueryTooNarrow,
    }
}

fn snippet(payload: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut s = serde_json::Value::Object(payload.clone()).to_string();
    if s.len() > 200 {
        s.truncate(197);
        s.push_str("...");
    }
    s
}

impl FeedbackReport {
    /// Render the deterministic digest the generator is re-prompted with.
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# DETECTION QUALITY ANALYSIS\n");
        let _ = writeln!(
            out,
            "Overall precision: {:.1}% (target >= {:.0}%)",
            self.aggregate.precision * 100.0,
            self.min_precision * 100.0
        );
        let _ = writeln!(
            out,
            "Overall recall: {:.1}% (target >= {:.0}%)\n",
            self.aggregate.recall * 100.0,
            self.min_recall * 100.0
        );
        if self.aggregate.precision < self.min_precision {
            let _ = writeln!(out, "TOO MANY FALSE POSITIVES - queries are too broad\n");
        }
        if self.aggregate.recall < self.min_recall {
            let _ = writeln!(out, "MISSING ATTACKS - queries are too narrow\n");
        }
        if !self.aggregate.unscored.is_empty() {
            let _ = writeln!(
                out,
                "Rules with no scorable test cases: {}\n",
                self.aggregate.unscored.join(", ")
            );
        }

        for rule in &self.rules {
            let _ = writeln!(out, "## Rule: {}\n", rule.rule);
            let _ = writeln!(out, "Query: `{}`", rule.query);
            let _ = writeln!(
                out,
                "Precision: {:.1}% | Recall: {:.1}% | F1: {:.3}",
                rule.precision * 100.0,
                rule.recall * 100.0,
                rule.f1
            );
            for failing in &rule.failing_metrics {
                let _ = writeln!(out, "FAILING: {failing}");
            }
            let _ = writeln!(out, "Diagnosis: {:?}", rule.diagnosis);
            let _ = writeln!(out, "Fix: {}\n", rule.diagnosis.recommendation());

            for case in &rule.misclassified {
                let expected = if case.expected_match {
                    "match (malicious activity)"
                } else {
                    "no match (benign activity)"
                };
                let actual = match case.cell {
                    ConfusionCell::FalsePositive => "matched (incorrect alert)",
                    ConfusionCell::FalseNegative => "no match (missed attack)",
                    ConfusionCell::Errored => "not evaluated (error)",
                    _ => "unexpected",
                };
                let _ = writeln!(
                    out,
                    "- [{}] {}: expected {expected}, actual {actual}\n  payload: {}",
                    case.category, case.case_id, case.payload_snippet
                );
            }
            for anomaly in &rule.label_anomalies {
                let _ = writeln!(
                    out,
                    "- DATA QUALITY: evasion case {anomaly} matched the query; its label is wrong, regenerate the test case"
                );
            }
            let _ = writeln!(out);
        }

        let _ = writeln!(out, "# REGENERATION INSTRUCTIONS\n");
        let _ = writeln!(
            out,
            "Regenerate the SAME detection rules with improvements:\n\
             1. Review the misclassified cases listed above\n\
             2. Apply the recommended fixes\n\
             3. Keep the same rule names and TTP coverage\n\
             4. Preserve test cases that were classified correctly"
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RuleMetrics;

    fn metrics(tp: u32, fp: u32, tn: u32, fn_: u32) -> RuleMetrics {
        RuleMetrics {
            tp,
            fp,
            tn,
            fn_,
            ..Default::default()
        }
    }

    #[test]
    fn many_fp_zero_fn_is_too_broad() {
        assert_eq!(diagnose(&metrics(2, 3, 1, 0), false), Diagnosis::QueryTooBroad);
    }

    #[test]
    fn many_fn_zero_fp_is_too_narrow() {
        assert_eq!(diagnose(&metrics(1, 0, 2, 3), false), Diagnosis::QueryTooNarrow);
    }

    #[test]
    fn zero_matches_suggests_field_type_mismatch_not_narrow_query() {
        // Scenario B: TP case failed to match because the field was
        // provisioned exact-match. tp=0, fp=0, fn=1.
        assert_eq!(
            diagnose(&metrics(0, 0, 1, 1), false),
            Diagnosis::FieldTypeMismatch
        );
    }

    #[test]
    fn query_errors_trump_confusion_patterns() {
        assert_eq!(diagnose(&metrics(0, 0, 0, 0), true), Diagnosis::QuerySyntaxError);
    }

    #[test]
    fn unscored_rule_diagnosed_as_no_test_cases() {
        assert_eq!(diagnose(&metrics(0, 0, 0, 0), false), Diagnosis::NoTestCases);
    }

    #[test]
    fn both_error_classes_is_unbalanced() {
        assert_eq!(
            diagnose(&metrics(2, 1, 1, 1), false),
            Diagnosis::QueryUnbalanced
        );
    }
}
