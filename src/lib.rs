//! detquench -- quality-driven refinement loop for generated detection rules.
//!
//! Turns CTI text into measured, iteratively improved detection rules: an
//! external generator proposes rule+test-case bundles, the evaluation
//! harness runs them against a disposable search backend, the metrics
//! engine scores the confusion matrix, and the retry controller decides to
//! accept, retry with synthesized feedback, or keep the best effort.

pub mod backend;
pub mod classify;
pub mod config;
pub mod controller;
pub mod feedback;
pub mod generator;
pub mod harness;
pub mod metrics;
pub mod query;
pub mod rules;

use anyhow::Result;
use backend::SearchBackend;
use config::Config;
use controller::{RetryController, RunOutcome};
use generator::RuleGenerator;
use harness::Harness;
use std::sync::Arc;
use std::time::Duration;

/// Wire a configured backend and generator into a controller and drive one
/// refinement run over the given CTI text.
pub async fn refine<G: RuleGenerator>(
    config: &Config,
    generator: G,
    backend: Arc<dyn SearchBackend>,
    cti: &str,
) -> Result<RunOutcome> {
    let harness = Harness::new(backend)
        .with_health_timeout(Duration::from_secs(config.health_timeout_secs))
        .with_workers(config.workers);
    let controller = RetryController::new(generator, harness, config.thresholds);
    let outcome = controller.run(cti).await?;
    Ok(outcome)
}
