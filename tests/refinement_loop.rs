//! End-to-end refinement loop over the in-process backend, driven through
//! the public library surface the CLI uses.

use async_trait::async_trait;
use detquench::backend::memory::MemoryBackend;
use detquench::config::Config;
use detquench::controller::IterationStatus;
use detquench::feedback::FeedbackReport;
use detquench::generator::{GeneratorError, RuleGenerator};
use detquench::rules::{Rule, RuleBatch, Severity, TestCase, TestCategory};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

fn payload(pairs: &[(&str, &str)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), json!(v)))
        .collect()
}

fn case(category: TestCategory, description: &str, pairs: &[(&str, &str)]) -> TestCase {
    TestCase::new(
        category,
        description,
        payload(pairs),
        category.expects_match(),
    )
    .unwrap()
}

fn narrow_batch() -> RuleBatch {
    // Over-fit to one exact command line: the TP with a different flag
    // order slips through, so recall lands at 0.5.
    RuleBatch {
        rules: vec![Rule {
            name: "shadow_copy_deletion".into(),
            description: "Shadow copy deletion via vssadmin".into(),
            query: "process.command_line:\"vssadmin.exe delete shadows /all /quiet\"".into(),
            severity: Severity::High,
            risk_score: Some(73),
            test_cases: vec![
                case(
                    TestCategory::TruePositive,
                    "canonical invocation",
                    &[("process.command_line", "vssadmin.exe delete shadows /all /quiet")],
                ),
                case(
                    TestCategory::TruePositive,
                    "flags reordered",
                    &[("process.command_line", "vssadmin.exe delete shadows /quiet /all")],
                ),
                case(
                    TestCategory::TrueNegative,
                    "benign listing",
                    &[("process.command_line", "vssadmin.exe list shadows")],
                ),
            ],
        }],
    }
}

fn widened_batch() -> RuleBatch {
    RuleBatch {
        rules: vec![Rule {
            name: "shadow_copy_deletion".into(),
            description: "Shadow copy deletion via vssadmin".into(),
            query: "process.command_line:*delete*shadows*".into(),
            severity: Severity::High,
            risk_score: Some(73),
            test_cases: vec![
                case(
                    TestCategory::TruePositive,
                    "canonical invocation",
                    &[("process.command_line", "vssadmin.exe delete shadows /all /quiet")],
                ),
                case(
                    TestCategory::TruePositive,
                    "flags reordered",
                    &[("process.command_line", "vssadmin.exe delete shadows /quiet /all")],
                ),
                case(
                    TestCategory::TrueNegative,
                    "benign listing",
                    &[("process.command_line", "vssadmin.exe list shadows")],
                ),
            ],
        }],
    }
}

/// Plays back a scripted batch per invocation and records the feedback
/// prompts it was handed.
struct ScriptedGenerator {
    script: Vec<RuleBatch>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    fn new(script: Vec<RuleBatch>) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RuleGenerator for &ScriptedGenerator {
    async fn generate(
        &self,
        _cti: &str,
        feedback: Option<&FeedbackReport>,
    ) -> Result<RuleBatch, GeneratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(report) = feedback {
            self.prompts.lock().unwrap().push(report.to_prompt());
        }
        Ok(self
            .script
            .get(call)
            .cloned()
            .unwrap_or_else(|| self.script.last().cloned().unwrap()))
    }
}

#[tokio::test]
async fn narrow_rule_is_widened_on_the_second_iteration() {
    let config = Config::default();
    let generator = ScriptedGenerator::new(vec![narrow_batch(), widened_batch()]);
    let backend = Arc::new(MemoryBackend::new());

    let outcome = detquench::refine(&config, &generator, backend, "APT-41 CTI text")
        .await
        .unwrap();

    assert_eq!(outcome.status, IterationStatus::Accepted);
    assert_eq!(outcome.final_iteration, Some(2));
    assert_eq!(outcome.history.len(), 2);

    // First pass missed a TP, second caught both.
    assert_eq!(outcome.history[0].aggregate.recall, 0.5);
    assert_eq!(outcome.history[1].aggregate.recall, 1.0);

    // The generator saw exactly one feedback prompt, naming the narrow rule
    // and carrying the missed payload.
    let prompts = generator.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("shadow_copy_deletion"));
    assert!(prompts[0].contains("QueryTooNarrow"));
    assert!(prompts[0].contains("/quiet /all"));

    let accepted = outcome.final_batch().unwrap();
    assert_eq!(
        accepted.rules[0].query,
        "process.command_line:*delete*shadows*"
    );
}

#[tokio::test]
async fn dead_backend_short_circuits_the_run() {
    let config = Config::default();
    let generator = ScriptedGenerator::new(vec![widened_batch()]);
    let backend = MemoryBackend::new();
    backend.set_unavailable(true);

    let outcome = detquench::refine(&config, &generator, Arc::new(backend), "cti")
        .await
        .unwrap();

    assert_eq!(outcome.status, IterationStatus::SkippedNoBackend);
    assert!(outcome.final_batch().is_none());
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_run_retains_the_strongest_batch() {
    let mut config = Config::default();
    config.thresholds.min_precision = 1.1;
    config.thresholds.min_recall = 1.1;
    config.thresholds.max_iterations = 2;

    let generator = ScriptedGenerator::new(vec![widened_batch(), narrow_batch()]);
    let backend = Arc::new(MemoryBackend::new());

    let outcome = detquench::refine(&config, &generator, backend, "cti")
        .await
        .unwrap();

    assert_eq!(outcome.status, IterationStatus::ExhaustedRetries);
    // Iteration 1 had perfect recall and wins on F1 despite being older.
    assert_eq!(outcome.final_iteration, Some(1));
    assert_eq!(
        outcome.final_batch().unwrap().rules[0].query,
        "process.command_line:*delete*shadows*"
    );
}
