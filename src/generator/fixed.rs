//! Generator adapter over a directory of pre-written YAML rule files.
//!
//! Returns the same batch on every call, feedback or not. Useful for
//! single-pass evaluation and offline validation of an existing rule corpus.

use super::{parse_batch, GeneratorError, RuleGenerator};
use crate::feedback::FeedbackReport;
use crate::rules::{Rule, RuleBatch};
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

pub struct FixedBatchGenerator {
    batch: RuleBatch,
}

impl FixedBatchGenerator {
    pub fn new(batch: RuleBatch) -> Self {
        Self { batch }
    }

    /// Load every `.yml`/`.yaml` file under `dir`. Each file holds either a
    /// single rule document or a batch.
    pub fn from_dir(dir: &Path) -> Result<Self, GeneratorError> {
        let mut rules: Vec<Rule> = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yml") | Some("yaml")
                )
            })
            .collect();
        entries.sort();

        for path in entries {
            let text = std::fs::read_to_string(&path)?;
            match serde_yaml::from_str::<Rule>(&text) {
                Ok(rule) => rules.push(rule),
                Err(_) => {
                    let batch = parse_batch(&text).map_err(|e| {
                        GeneratorError::Parse(format!("{}: {e}", path.display()))
                    })?;
                    rules.extend(batch.rules);
                }
            }
            debug!(file = %path.display(), "Loaded rule file");
        }
        Ok(Self {
            batch: RuleBatch { rules },
        })
    }

    pub fn batch(&self) -> &RuleBatch {
        &self.batch
    }
}

#[async_trait]
impl RuleGenerator for FixedBatchGenerator {
    async fn generate(
        &self,
        _cti: &str,
        _feedback: Option<&FeedbackReport>,
    ) -> Result<RuleBatch, GeneratorError> {
        Ok(self.batch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_rule_files_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("shadow.yml"),
            r#"
name: shadow_copy_deletion
query: "process.name:*vssadmin*"
test_cases:
  - type: TP
    log_entry:
      process.name: vssadmin.exe
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let generator = FixedBatchGenerator::from_dir(dir.path()).unwrap();
        assert_eq!(generator.batch().rules.len(), 1);
    }

    #[test]
    fn unparseable_rule_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yml"), "::: nope [").unwrap();
        assert!(FixedBatchGenerator::from_dir(dir.path()).is_err());
    }
}
