//! Generator adapter that shells out to an external command.
//!
//! The command receives the CTI text on stdin and, on retry iterations, the
//! rendered feedback digest via a file whose path is exported in
//! `DETQUENCH_FEEDBACK`. It must print a YAML rule batch on stdout. This
//! keeps the LLM toolchain entirely outside the process boundary.

use super::{parse_batch, GeneratorError, RuleGenerator};
use crate::feedback::FeedbackReport;
use crate::rules::RuleBatch;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

pub const FEEDBACK_ENV: &str = "DETQUENCH_FEEDBACK";

pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl RuleGenerator for CommandGenerator {
    async fn generate(
        &self,
        cti: &str,
        feedback: Option<&FeedbackReport>,
    ) -> Result<RuleBatch, GeneratorError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut feedback_path: Option<PathBuf> = None;
        if let Some(report) = feedback {
            let path = std::env::temp_dir().join(format!("detquench-feedback-{}.md", Uuid::new_v4()));
            tokio::fs::write(&path, report.to_prompt()).await?;
            cmd.env(FEEDBACK_ENV, &path);
            feedback_path = Some(path);
        }

        info!(program = %self.program, with_feedback = feedback.is_some(), "Invoking generator");
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(cti.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;

        if let Some(path) = feedback_path {
            let _ = tokio::fs::remove_file(path).await;
        }

        if !output.status.success() {
            return Err(GeneratorError::Invocation(format!(
                "generator exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(bytes = stdout.len(), "Generator output received");
        parse_batch(&stdout)
    }
}
