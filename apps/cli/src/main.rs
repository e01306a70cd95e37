//! `train-cost-model`: trains a text + image cost model on one process of a
//! (possibly single-process) distributed launch.
//!
//! The launcher provides `RANK`, `WORLD_SIZE` and `LOCAL_RANK`; configuration
//! comes from `<config_root>/train/text_image_to_text/cost_model.yaml` plus
//! trailing `--<dotted.key> <value>` overrides.

mod args;

use aligner_local::{JsonlPreferenceProvider, LocalBackend, LocalModelProvider};
use aligner_training::config::{parse_overrides, read_defaults, ConfigMerger};
use aligner_training::cost_model::{CostModelTrainer, MODE, TASK};
use aligner_training::{LaunchEnv, LogProgressSink, ProcessGroup, RunSummary, TrainingResult};
use anyhow::Context;
use args::{split_args, Args};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => anyhow::bail!("unknown log level `{other}` (expected trace|debug|info|warn|error)"),
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install log subscriber")
}

fn train(args: &Args, override_args: &[String]) -> TrainingResult<RunSummary> {
    let overrides = parse_overrides(override_args)?;
    let (defaults, backend_config) = read_defaults(&args.config_root, MODE, TASK)?;
    let config = ConfigMerger::new(defaults).with_policy(args.unknown_keys.into()).merge_frozen(&overrides)?;
    let launch = LaunchEnv::from_env()?;

    let trainer = CostModelTrainer::new(
        Arc::new(LocalModelProvider::from_env()),
        Arc::new(JsonlPreferenceProvider::new()),
    );
    let mut lifecycle = trainer
        .into_lifecycle(config, Box::new(LocalBackend::new()))?
        .with_backend_config(backend_config)
        .with_process_group(ProcessGroup::global())
        .with_progress(Arc::new(LogProgressSink::for_rank(launch.rank)))
        .with_launch_env(launch);

    lifecycle.run()
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().collect();
    let (known, override_args) = split_args(&argv);
    let args = Args::parse_from(known);

    if let Err(err) = init_logging(&args.log_level) {
        eprintln!("Error: {err:#}");
        return ExitCode::FAILURE;
    }

    match train(&args, &override_args) {
        Ok(summary) => {
            info!(
                run_id = %summary.run_id,
                steps = summary.metrics.steps,
                checkpoint = %summary.final_checkpoint.display(),
                "training finished"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(kind = %err.kind(), "{err}");
            ExitCode::from(err.kind().exit_code())
        }
    }
}
