//! The external rule generator, modeled as an injected collaborator.
//!
//! The controller never sees prompting or model internals; it only relies on
//! the contract that the generator can be called repeatedly with the same
//! CTI text and a different feedback value, with no in-process state carried
//! between calls.

pub mod command;
pub mod fixed;

use crate::feedback::FeedbackReport;
use crate::rules::RuleBatch;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("generator invocation failed: {0}")]
    Invocation(String),

    #[error("generator output could not be parsed: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Produces a candidate rule batch from CTI text, optionally steered by the
/// previous iteration's feedback report.
#[async_trait]
pub trait RuleGenerator: Send + Sync {
    async fn generate(
        &self,
        cti: &str,
        feedback: Option<&FeedbackReport>,
    ) -> Result<RuleBatch, GeneratorError>;
}

/// Parse a generator's YAML output into a batch.
///
/// Accepts either a top-level `rules:` list or a bare list of rule
/// documents; both shapes occur in the wild.
pub fn parse_batch(yaml: &str) -> Result<RuleBatch, GeneratorError> {
    let batch: RuleBatch = match serde_yaml::from_str::<RuleBatch>(yaml) {
        Ok(batch) => batch,
        Err(_) => {
            let rules = serde_yaml::from_str(yaml).map_err(|e| GeneratorError::Parse(e.to_string()))?;
            RuleBatch { rules }
        }
    };
    Ok(batch)
}
