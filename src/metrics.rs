//! Confusion-matrix aggregation and derived quality scores. Pure functions.

use crate::classify::{ClassificationOutcome, ConfusionCell};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-rule confusion counts and derived scores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleMetrics {
    pub tp: u32,
    pub fp: u32,
    pub tn: u32,
    #[serde(rename = "fn")]
    pub fn_: u32,
    /// FN-category payloads confirmed to evade (tracked apart from TN).
    pub evasions_confirmed: u32,
    /// FN-category payloads that matched despite their label: test-case
    /// data-quality anomalies, excluded from the confusion matrix.
    pub anomalies: u32,
    /// Cases excluded from scoring (ingest/query failures).
    pub errored: u32,
}

impl RuleMetrics {
    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.tp + self.fp + self.tn + self.fn_)
    }

    /// Cases that contributed to any confusion cell. A rule with zero
    /// scorable cases cannot be judged at all.
    pub fn scorable(&self) -> u32 {
        self.tp + self.fp + self.tn + self.fn_
    }
}

fn ratio(num: u32, denom: u32) -> f64 {
    if denom == 0 {
        0.0
    } else {
        f64::from(num) / f64::from(denom)
    }
}

/// Fold a rule's classification outcomes into its metrics.
pub fn score(outcomes: &[ClassificationOutcome]) -> RuleMetrics {
    let mut m = RuleMetrics::default();
    for outcome in outcomes {
        match outcome.cell {
            ConfusionCell::TruePositive => m.tp += 1,
            ConfusionCell::FalsePositive => m.fp += 1,
            ConfusionCell::TrueNegative => m.tn += 1,
            ConfusionCell::FalseNegative => m.fn_ += 1,
            ConfusionCell::EvasionConfirmed => m.evasions_confirmed += 1,
            ConfusionCell::EvasionContradicted => m.anomalies += 1,
            ConfusionCell::Errored => m.errored += 1,
        }
    }
    m
}

/// Batch-level quality: arithmetic mean across rules that produced at least
/// one scorable case. Rules with none are listed in `unscored` instead --
/// the generator failed to emit usable test cases for them, which is a
/// different failure mode from a bad query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub scored_rules: usize,
    pub unscored: Vec<String>,
}

pub fn aggregate(per_rule: &BTreeMap<String, RuleMetrics>) -> AggregateMetrics {
    let mut agg = AggregateMetrics::default();
    let mut sums = (0.0, 0.0, 0.0);

    for (name, m) in per_rule {
        if m.scorable() == 0 {
            agg.unscored.push(name.clone());
            continue;
        }
        sums.0 += m.precision();
        sums.1 += m.recall();
        sums.2 += m.f1();
        agg.scored_rules += 1;
    }

    if agg.scored_rules > 0 {
        let n = agg.scored_rules as f64;
        agg.precision = sums.0 / n;
        agg.recall = sums.1 / n;
        agg.f1 = sums.2 / n;
    }
    agg
}
