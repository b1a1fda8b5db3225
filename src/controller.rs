//! Retry controller -- the quality-driven refinement loop.
//!
//! Generate -> Evaluate -> Score -> Decide, at most `max_iterations` times.
//! Acceptance requires both aggregate precision and recall to meet their
//! thresholds; exhaustion keeps the best-scoring batch seen so far rather
//! than discarding the work. A dead backend is its own terminal state,
//! visibly distinct from rule-quality failure.

use crate::feedback::{self, FeedbackReport};
use crate::generator::{GeneratorError, RuleGenerator};
use crate::harness::{Evaluation, Harness};
use crate::metrics::{self, AggregateMetrics, RuleMetrics};
use crate::rules::{RuleBatch, RuleError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Generator(#[from] GeneratorError),

    /// Attributed to the generator, not to thresholds or the backend, and
    /// never silently consumes a retry.
    #[error("generator contract violation: {0}")]
    Contract(#[from] RuleError),
}

/// Quality gates for one run. Immutable; passed explicitly, never ambient.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub min_precision: f64,
    pub min_recall: f64,
    pub max_iterations: usize,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_precision: 0.60,
            min_recall: 0.70,
            max_iterations: 3,
        }
    }
}

/// Terminal decision for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationStatus {
    Accepted,
    RetryingWithFeedback,
    ExhaustedRetries,
    SkippedNoBackend,
}

/// Phase-level wall-clock stamps, recorded so a caller can spot a stuck
/// iteration externally; the controller itself imposes no per-iteration
/// timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub generation_started: DateTime<Utc>,
    pub generation_ended: DateTime<Utc>,
    pub evaluation_started: DateTime<Utc>,
    pub evaluation_ended: DateTime<Utc>,
    pub scoring_started: DateTime<Utc>,
    pub scoring_ended: DateTime<Utc>,
}

/// One full generate/evaluate/score pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationResult {
    /// 1-indexed.
    pub iteration: usize,
    pub batch: RuleBatch,
    pub per_rule: BTreeMap<String, RuleMetrics>,
    pub aggregate: AggregateMetrics,
    pub status: IterationStatus,
    pub elapsed: Duration,
    pub timings: PhaseTimings,
}

/// Final outcome of a controller run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: IterationStatus,
    /// Accepted batch, or the best-effort batch on exhaustion. Absent only
    /// when the backend was unavailable.
    pub final_iteration: Option<usize>,
    pub history: Vec<IterationResult>,
}

impl RunOutcome {
    pub fn final_batch(&self) -> Option<&RuleBatch> {
        let idx = self.final_iteration?;
        self.history.iter().find(|r| r.iteration == idx).map(|r| &r.batch)
    }
}

pub struct RetryController<G> {
    generator: G,
    harness: Harness,
    thresholds: QualityThresholds,
}

impl<G: RuleGenerator> RetryController<G> {
    pub fn new(generator: G, harness: Harness, thresholds: QualityThresholds) -> Self {
        Self {
            generator,
            harness,
            thresholds,
        }
    }

    /// Drive the loop to one of its terminal states. Performs at most
    /// `max_iterations` generator invocations; iterations are strictly
    /// sequential because each depends on the previous one's feedback.
    pub async fn run(&self, cti: &str) -> Result<RunOutcome, ControllerError> {
        let mut history: Vec<IterationResult> = Vec::new();
        let mut feedback: Option<FeedbackReport> = None;

        for iteration in 1..=self.thresholds.max_iterations.max(1) {
            info!(
                iteration,
                max = self.thresholds.max_iterations,
                "Starting refinement iteration"
            );

            let generation_started = Utc::now();
            let batch = self.generator.generate(cti, feedback.as_ref()).await?;
            let generation_ended = Utc::now();

            for warning in batch.validate()? {
                warn!(iteration, "{warning}");
            }

            let evaluation_started = Utc::now();
            let evaluation = self.harness.evaluate(&batch).await;
            let evaluation_ended = Utc::now();

            let report = match evaluation {
                Evaluation::BackendUnavailable => {
                    info!(iteration, "Backend unavailable, skipping run");
                    let now = Utc::now();
                    history.push(IterationResult {
                        iteration,
                        batch,
                        per_rule: BTreeMap::new(),
                        aggregate: AggregateMetrics::default(),
                        status: IterationStatus::SkippedNoBackend,
                        elapsed: elapsed_since(generation_started),
                        timings: PhaseTimings {
                            generation_started,
                            generation_ended,
                            evaluation_started,
                            evaluation_ended,
                            scoring_started: now,
                            scoring_ended: now,
                        },
                    });
                    return Ok(RunOutcome {
                        status: IterationStatus::SkippedNoBackend,
                        final_iteration: None,
                        history,
                    });
                }
                Evaluation::Completed(report) => report,
            };

            let scoring_started = Utc::now();
            let per_rule: BTreeMap<String, RuleMetrics> = report
                .outcomes
                .iter()
                .map(|(name, outcomes)| (name.clone(), metrics::score(outcomes)))
                .collect();
            let aggregate = metrics::aggregate(&per_rule);
            let scoring_ended = Utc::now();

            info!(
                iteration,
                precision = format!("{:.3}", aggregate.precision),
                recall = format!("{:.3}", aggregate.recall),
                f1 = format!("{:.3}", aggregate.f1),
                "Iteration scored"
            );

            let timings = PhaseTimings {
                generation_started,
                generation_ended,
                evaluation_started,
                evaluation_ended,
                scoring_started,
                scoring_ended,
            };
            let elapsed = elapsed_since(generation_started);

            let meets = aggregate.precision >= self.thresholds.min_precision
                && aggregate.recall >= self.thresholds.min_recall;

            if meets {
                history.push(IterationResult {
                    iteration,
                    batch,
                    per_rule,
                    aggregate,
                    status: IterationStatus::Accepted,
                    elapsed,
                    timings,
                });
                info!(iteration, "Thresholds met, accepting batch");
                return Ok(RunOutcome {
                    status: IterationStatus::Accepted,
                    final_iteration: Some(iteration),
                    history,
                });
            }

            if iteration >= self.thresholds.max_iterations {
                history.push(IterationResult {
                    iteration,
                    batch,
                    per_rule,
                    aggregate,
                    status: IterationStatus::ExhaustedRetries,
                    elapsed,
                    timings,
                });
                let best = best_iteration(&history);
                warn!(
                    iteration,
                    best_iteration = best,
                    "Retries exhausted, keeping best-effort batch"
                );
                return Ok(RunOutcome {
                    status: IterationStatus::ExhaustedRetries,
                    final_iteration: Some(best),
                    history,
                });
            }

            feedback = Some(feedback::synthesize(
                &batch,
                &report,
                &per_rule,
                &aggregate,
                &self.thresholds,
            ));
            history.push(IterationResult {
                iteration,
                batch,
                per_rule,
                aggregate,
                status: IterationStatus::RetryingWithFeedback,
                elapsed,
                timings,
            });
        }

        unreachable!("loop always returns from a terminal state")
    }
}

fn elapsed_since(start: DateTime<Utc>) -> Duration {
    (Utc::now() - start).to_std().unwrap_or_default()
}

/// Highest aggregate F1 wins; ties break on recall, then on recency.
fn best_iteration(history: &[IterationResult]) -> usize {
    let mut best = history
        .first()
        .map(|r| r.iteration)
        .unwrap_or(1);
    let mut best_key = (f64::MIN, f64::MIN);
    for result in history {
        let key = (result.aggregate.f1, result.aggregate.recall);
        if key >= best_key {
            best_key = key;
            best = result.iteration;
        }
    }
    best
}
