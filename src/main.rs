use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use detquench::backend::elastic::ElasticBackend;
use detquench::backend::memory::MemoryBackend;
use detquench::backend::SearchBackend;
use detquench::config::Config;
use detquench::controller::IterationStatus;
use detquench::generator::command::CommandGenerator;
use detquench::generator::fixed::FixedBatchGenerator;
use detquench::harness::{Evaluation, Harness};
use detquench::{metrics, query};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "detquench",
    about = "Quality-driven refinement loop for generated detection rules",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full generate -> evaluate -> refine loop over a CTI document
    Refine {
        /// CTI text file fed to the generator
        #[arg(long)]
        cti: PathBuf,

        /// Generator command (CTI on stdin, YAML batch on stdout)
        #[arg(long)]
        generator: Option<String>,

        /// Evaluate in-process instead of against a live cluster
        #[arg(long)]
        offline: bool,

        /// Minimum aggregate precision to accept
        #[arg(long)]
        min_precision: Option<f64>,

        /// Minimum aggregate recall to accept
        #[arg(long)]
        min_recall: Option<f64>,

        /// Maximum refinement iterations
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Write the final rule batch as YAML here
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Evaluate an existing rules directory once and report metrics
    Evaluate {
        /// Directory of YAML rule files
        #[arg(long, default_value = "rules")]
        rules_dir: PathBuf,

        /// Evaluate in-process instead of against a live cluster
        #[arg(long)]
        offline: bool,

        /// Write the YAML report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Validate rule structure and query syntax without a backend
    Validate {
        /// Directory of YAML rule files
        #[arg(long, default_value = "rules")]
        rules_dir: PathBuf,
    },

    /// Probe backend availability
    CheckBackend {
        /// Probe timeout in seconds
        #[arg(long, default_value = "3")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Refine {
            cti,
            generator,
            offline,
            min_precision,
            min_recall,
            max_iterations,
            output,
        } => {
            let mut config = config;
            if let Some(p) = min_precision {
                config.thresholds.min_precision = p;
            }
            if let Some(r) = min_recall {
                config.thresholds.min_recall = r;
            }
            if let Some(n) = max_iterations {
                config.thresholds.max_iterations = n;
            }

            let cti_text = std::fs::read_to_string(&cti)
                .with_context(|| format!("reading CTI file {}", cti.display()))?;

            let command = generator
                .or_else(|| config.generator.command.clone())
                .context("no generator command: pass --generator or set [generator] in config")?;
            let mut parts = command.split_whitespace();
            let program = parts.next().context("empty generator command")?.to_string();
            let mut args: Vec<String> = parts.map(str::to_string).collect();
            args.extend(config.generator.args.clone());
            let generator = CommandGenerator::new(program, args);

            let backend = make_backend(&config, offline)?;
            let outcome = detquench::refine(&config, generator, backend, &cti_text).await?;

            for result in &outcome.history {
                println!(
                    "iteration {}: precision={:.3} recall={:.3} f1={:.3} [{:?}]",
                    result.iteration,
                    result.aggregate.precision,
                    result.aggregate.recall,
                    result.aggregate.f1,
                    result.status,
                );
            }
            println!("final status: {:?}", outcome.status);

            if let (Some(path), Some(batch)) = (&output, outcome.final_batch()) {
                std::fs::write(path, serde_yaml::to_string(batch)?)?;
                println!("final batch written to {}", path.display());
            }

            // Backend absence is an infrastructure condition, not a rule
            // quality failure; only quality failures exit nonzero.
            if outcome.status == IterationStatus::ExhaustedRetries {
                std::process::exit(1);
            }
        }

        Commands::Evaluate {
            rules_dir,
            offline,
            output,
        } => {
            let generator = FixedBatchGenerator::from_dir(&rules_dir)
                .with_context(|| format!("loading rules from {}", rules_dir.display()))?;
            let batch = generator.batch().clone();
            for warning in &batch.validate()? {
                eprintln!("warning: {warning}");
            }

            let backend = make_backend(&config, offline)?;
            let harness = Harness::new(backend)
                .with_health_timeout(Duration::from_secs(config.health_timeout_secs))
                .with_workers(config.workers);

            match harness.evaluate(&batch).await {
                Evaluation::BackendUnavailable => {
                    eprintln!("backend unavailable; nothing evaluated");
                }
                Evaluation::Completed(report) => {
                    let per_rule: BTreeMap<_, _> = report
                        .outcomes
                        .iter()
                        .map(|(name, outcomes)| (name.clone(), metrics::score(outcomes)))
                        .collect();
                    let aggregate = metrics::aggregate(&per_rule);

                    #[derive(serde::Serialize)]
                    struct EvalReport {
                        timestamp: chrono::DateTime<chrono::Utc>,
                        aggregate: metrics::AggregateMetrics,
                        rules: BTreeMap<String, metrics::RuleMetrics>,
                        query_errors: BTreeMap<String, String>,
                    }
                    let rendered = serde_yaml::to_string(&EvalReport {
                        timestamp: chrono::Utc::now(),
                        aggregate,
                        rules: per_rule,
                        query_errors: report.query_errors,
                    })?;

                    match output {
                        Some(path) => {
                            std::fs::write(&path, rendered)?;
                            println!("report written to {}", path.display());
                        }
                        None => print!("{rendered}"),
                    }
                }
            }
        }

        Commands::Validate { rules_dir } => {
            let generator = FixedBatchGenerator::from_dir(&rules_dir)
                .with_context(|| format!("loading rules from {}", rules_dir.display()))?;
            let batch = generator.batch();

            let mut invalid = 0usize;
            match batch.validate() {
                Ok(warnings) => {
                    for warning in &warnings {
                        println!("  warning: {warning}");
                    }
                }
                Err(e) => {
                    println!("  error: {e}");
                    invalid += 1;
                }
            }
            for rule in &batch.rules {
                match query::parse(&rule.query) {
                    Ok(_) => println!("  ok: {} ({} test cases)", rule.name, rule.test_cases.len()),
                    Err(e) => {
                        println!("  error: {}: {e}", rule.name);
                        invalid += 1;
                    }
                }
            }
            println!("{} rule(s), {} problem(s)", batch.rules.len(), invalid);
            if invalid > 0 {
                std::process::exit(1);
            }
        }

        Commands::CheckBackend { timeout } => {
            let backend = ElasticBackend::new(&config.backend.url, &config.backend.index)?;
            let healthy = backend.health_check(Duration::from_secs(timeout)).await;
            println!(
                "{} -> {}",
                config.backend.url,
                if healthy { "available" } else { "unavailable" }
            );
            if !healthy {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn make_backend(config: &Config, offline: bool) -> Result<Arc<dyn SearchBackend>> {
    if offline {
        tracing::info!("Using in-process evaluation backend");
        Ok(Arc::new(MemoryBackend::new()))
    } else {
        Ok(Arc::new(ElasticBackend::new(
            &config.backend.url,
            &config.backend.index,
        )?))
    }
}
