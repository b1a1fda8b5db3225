//! Match classification -- turning raw query outcomes into confusion cells.

use crate::rules::TestCategory;
use serde::{Deserialize, Serialize};

/// What the backend reported for one (rule, test case) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOutcome {
    Matched,
    NotMatched,
    /// Backend unreachable mid-batch, ingestion failed, or the query could
    /// not be executed. Excluded from every metric denominator.
    Indeterminate,
}

/// The confusion-matrix cell one outcome contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfusionCell {
    TruePositive,
    FalsePositive,
    TrueNegative,
    FalseNegative,
    /// An FN-category payload that did not match: the claimed evasion is
    /// real. Tracked apart from ordinary TN.
    EvasionConfirmed,
    /// An FN-category payload that matched: the claimed evasion does not
    /// actually evade. A data-quality anomaly on the test case, not a rule
    /// failure; excluded from the rule's confusion matrix.
    EvasionContradicted,
    /// Indeterminate outcome; not scorable.
    Errored,
}

/// Result of evaluating one (rule, test case) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationOutcome {
    pub case_id: String,
    pub category: TestCategory,
    pub description: String,
    pub actual: MatchOutcome,
    pub cell: ConfusionCell,
}

impl ClassificationOutcome {
    pub fn new(
        case_id: impl Into<String>,
        category: TestCategory,
        description: impl Into<String>,
        actual: MatchOutcome,
    ) -> Self {
        Self {
            case_id: case_id.into(),
            category,
            description: description.into(),
            actual,
            cell: classify(category, actual),
        }
    }

    /// Did the backend's verdict agree with the case label?
    pub fn correct(&self) -> bool {
        match self.actual {
            MatchOutcome::Indeterminate => false,
            MatchOutcome::Matched => self.category.expects_match(),
            MatchOutcome::NotMatched => !self.category.expects_match(),
        }
    }
}

/// Derive the confusion cell for a labeled case and its observed outcome.
pub fn classify(category: TestCategory, actual: MatchOutcome) -> ConfusionCell {
    match (category, actual) {
        (_, MatchOutcome::Indeterminate) => ConfusionCell::Errored,

        (TestCategory::TruePositive, MatchOutcome::Matched) => ConfusionCell::TruePositive,
        // A TP payload the rule failed to fire on is a missed detection.
        (TestCategory::TruePositive, MatchOutcome::NotMatched) => ConfusionCell::FalseNegative,

        // Benign payloads: a match means the rule fired incorrectly.
        (TestCategory::FalsePositive | TestCategory::TrueNegative, MatchOutcome::Matched) => {
            ConfusionCell::FalsePositive
        }
        (TestCategory::FalsePositive | TestCategory::TrueNegative, MatchOutcome::NotMatched) => {
            ConfusionCell::TrueNegative
        }

        // Claimed evasions.
        (TestCategory::FalseNegative, MatchOutcome::NotMatched) => ConfusionCell::EvasionConfirmed,
        (TestCategory::FalseNegative, MatchOutcome::Matched) => ConfusionCell::EvasionContradicted,
    }
}
