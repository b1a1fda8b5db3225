//! Detection rule and test-case data model.
//!
//! Rules arrive from an external generator as loosely-typed YAML/JSON
//! documents. Everything is validated here, at the boundary: a `TestCase`
//! whose `expected_match` disagrees with its category cannot be constructed,
//! and a batch that violates the generator contract is rejected before it
//! reaches the evaluation harness.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("test case '{case_id}': expected_match={expected_match} is inconsistent with category {category} (must be true exactly for TP)")]
    InconsistentLabel {
        case_id: String,
        category: TestCategory,
        expected_match: bool,
    },

    #[error("rule '{0}' has an empty query")]
    EmptyQuery(String),

    #[error("generator contract violation: {0}")]
    ContractViolation(String),
}

/// The labeled category of a synthetic test payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestCategory {
    /// Malicious activity the rule must detect.
    #[serde(rename = "TP")]
    TruePositive,
    /// A known evasion: a technique variant expected to bypass the rule.
    #[serde(rename = "FN")]
    FalseNegative,
    /// Benign activity that superficially resembles the attack.
    #[serde(rename = "FP")]
    FalsePositive,
    /// Ordinary benign activity.
    #[serde(rename = "TN")]
    TrueNegative,
}

impl TestCategory {
    /// The only category whose payload the query is expected to match.
    pub fn expects_match(self) -> bool {
        matches!(self, TestCategory::TruePositive)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestCategory::TruePositive => "TP",
            TestCategory::FalseNegative => "FN",
            TestCategory::FalsePositive => "FP",
            TestCategory::TrueNegative => "TN",
        }
    }
}

impl std::fmt::Display for TestCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule severity tag, carried through from the generator.
///
/// Generators occasionally invent levels ("informational", "elevated");
/// an unrecognized value degrades to the default instead of failing the
/// whole batch parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl From<String> for Severity {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::default(),
        }
    }
}

/// A labeled synthetic event used to score a rule.
///
/// Construction enforces the label invariant: `expected_match` is true
/// exactly for TruePositive cases. Deserialization goes through the same
/// check via `try_from`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawTestCase")]
pub struct TestCase {
    #[serde(rename = "type")]
    pub category: TestCategory,
    #[serde(default)]
    pub description: String,
    /// Structured key-value document ingested into the backend.
    pub log_entry: Map<String, Value>,
    pub expected_match: bool,
}

#[derive(Debug, Deserialize)]
struct RawTestCase {
    #[serde(rename = "type")]
    category: TestCategory,
    #[serde(default)]
    description: String,
    log_entry: Map<String, Value>,
    /// Optional in rule files; defaults to the category's implied value.
    expected_match: Option<bool>,
}

impl TryFrom<RawTestCase> for TestCase {
    type Error = RuleError;

    fn try_from(raw: RawTestCase) -> Result<Self, RuleError> {
        let expected = raw.expected_match.unwrap_or(raw.category.expects_match());
        TestCase::new(raw.category, raw.description, raw.log_entry, expected)
    }
}

impl TestCase {
    pub fn new(
        category: TestCategory,
        description: impl Into<String>,
        log_entry: Map<String, Value>,
        expected_match: bool,
    ) -> Result<Self, RuleError> {
        let description = description.into();
        if expected_match != category.expects_match() {
            return Err(RuleError::InconsistentLabel {
                case_id: description,
                category,
                expected_match,
            });
        }
        Ok(Self {
            category,
            description,
            log_entry,
            expected_match,
        })
    }
}

/// A named detection unit produced by the generator.
///
/// Immutable within an iteration; a retry supersedes the whole rule rather
/// than mutating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Opaque query expression in the backend's query language.
    pub query: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub risk_score: Option<u8>,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

impl Rule {
    /// Stable document id for one (rule, case) pair within a batch.
    pub fn case_id(&self, index: usize) -> String {
        let category = self
            .test_cases
            .get(index)
            .map(|c| c.category.as_str())
            .unwrap_or("??");
        format!("{}_{}_{}", self.name, category, index)
    }
}

/// One iteration's worth of candidate rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleBatch {
    pub rules: Vec<Rule>,
}

impl RuleBatch {
    /// Validate the generator contract for a freshly generated batch.
    ///
    /// Hard failures: empty batch, duplicate rule names, rule with an empty
    /// query, rule with no TruePositive case. Missing negative-category
    /// cases only degrade
    /// precision measurement, so they surface as warnings, not errors.
    pub fn validate(&self) -> Result<Vec<String>, RuleError> {
        if self.rules.is_empty() {
            return Err(RuleError::ContractViolation(
                "generator returned an empty rule batch".into(),
            ));
        }

        let mut warnings = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            // Names key every downstream map; a collision would silently
            // overwrite one rule's results with another's.
            if !seen.insert(rule.name.as_str()) {
                return Err(RuleError::ContractViolation(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
            if rule.query.trim().is_empty() {
                return Err(RuleError::EmptyQuery(rule.name.clone()));
            }
            if rule.test_cases.is_empty() {
                return Err(RuleError::ContractViolation(format!(
                    "rule '{}' has no test cases",
                    rule.name
                )));
            }
            if !rule
                .test_cases
                .iter()
                .any(|c| c.category == TestCategory::TruePositive)
            {
                return Err(RuleError::ContractViolation(format!(
                    "rule '{}' has no TruePositive test case",
                    rule.name
                )));
            }
            for missing in [
                TestCategory::TrueNegative,
                TestCategory::FalsePositive,
                TestCategory::FalseNegative,
            ] {
                if !rule.test_cases.iter().any(|c| c.category == missing) {
                    warnings.push(format!(
                        "rule '{}' has no {} test case",
                        rule.name, missing
                    ));
                }
            }
        }
        Ok(warnings)
    }
}
