//! Trainer lifecycle.
//!
//! A [`TrainerLifecycle`] drives one run through a fixed sequence of states:
//!
//! ```text
//! CREATED -> SEEDED -> DISTRIBUTED_READY -> MODELS_READY -> DATA_READY
//!         -> TRAINING -> SAVED -> DONE
//! ```
//!
//! Any error moves the run to `FAILED`. Task-specific behaviour is injected
//! through [`ModelInitStrategy`] and [`DatasetInitStrategy`]; everything else
//! (seeding, process group formation, the step loop, checkpointing) is
//! shared.

use crate::artifacts::{collect_artifacts, RunId, TrainingManifest, TrainingMetrics};
use crate::backend::{Engine, InferOutput, TrainingBackend};
use crate::config::{BackendConfig, FrozenConfig};
use crate::dataset::{Batch, DataBundle, DataLoader};
use crate::distributed::{DistributedContext, LaunchEnv, ProcessGroup};
use crate::error::{TrainingError, TrainingResult};
use crate::layout::OutputLayout;
use crate::model::{ModelBundle, ShapeDeclaration};
use crate::progress::{LogProgressSink, ProgressEvent, ProgressSink};
use crate::settings::{EvalStrategy, TrainSettings};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Config key recorded in the manifest as the model reference.
pub const MODEL_REF_KEY: &str = "model_cfgs.model_name_or_path";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Created,
    Seeded,
    DistributedReady,
    ModelsReady,
    DataReady,
    Training,
    Saved,
    Done,
    Failed,
}

impl LifecycleState {
    #[must_use]
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            (Self::Created, Self::Seeded)
            | (Self::Seeded, Self::DistributedReady)
            | (Self::DistributedReady, Self::ModelsReady)
            | (Self::ModelsReady, Self::DataReady)
            | (Self::DataReady, Self::Training)
            | (Self::Training, Self::Saved)
            | (Self::Saved, Self::Done) => true,
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Seeded => "SEEDED",
            Self::DistributedReady => "DISTRIBUTED_READY",
            Self::ModelsReady => "MODELS_READY",
            Self::DataReady => "DATA_READY",
            Self::Training => "TRAINING",
            Self::Saved => "SAVED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// What the initialization strategies may read.
pub struct InitContext<'a> {
    pub config: &'a FrozenConfig,
    pub backend_config: Option<&'a BackendConfig>,
    pub distributed: &'a DistributedContext,
    pub settings: &'a TrainSettings,
}

impl InitContext<'_> {
    /// The deployment shape to declare before loading, if the backend
    /// partitions parameters at construction.
    #[must_use]
    pub fn shape_declaration(&self) -> Option<ShapeDeclaration> {
        self.backend_config
            .and_then(|backend| ShapeDeclaration::declare(backend, self.distributed.world_size()))
    }
}

/// Produces the model, tokenizer and optional processor for a run.
pub trait ModelInitStrategy: Send + Sync {
    fn init_models(&self, ctx: &InitContext<'_>) -> TrainingResult<ModelBundle>;
}

/// Produces the train and eval loaders. Called only once models exist.
pub trait DatasetInitStrategy: Send + Sync {
    fn init_datasets(&self, ctx: &InitContext<'_>, models: &ModelBundle) -> TrainingResult<DataBundle>;
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub state: LifecycleState,
    pub metrics: TrainingMetrics,
    /// Periodic checkpoints still on disk, oldest first.
    pub checkpoints: Vec<PathBuf>,
    pub final_checkpoint: PathBuf,
    /// Written by rank 0 only.
    pub manifest: Option<PathBuf>,
}

pub struct TrainerLifecycle {
    run_id: RunId,
    task: String,
    config: FrozenConfig,
    backend_config: Option<BackendConfig>,
    settings: TrainSettings,
    models: Arc<dyn ModelInitStrategy>,
    datasets: Arc<dyn DatasetInitStrategy>,
    backend: Box<dyn TrainingBackend>,
    group: Arc<ProcessGroup>,
    launch: LaunchEnv,
    progress: Arc<dyn ProgressSink>,
    state: LifecycleState,
    /// Kept after a successful run for [`TrainerLifecycle::infer_batch`].
    engine: Option<Box<dyn Engine>>,
}

impl fmt::Debug for TrainerLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrainerLifecycle")
            .field("run_id", &self.run_id)
            .field("task", &self.task)
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl TrainerLifecycle {
    /// Resolves the loop settings from `config`; configuration errors surface
    /// here, before anything is seeded or initialized.
    pub fn new(
        config: FrozenConfig,
        models: Arc<dyn ModelInitStrategy>,
        datasets: Arc<dyn DatasetInitStrategy>,
        backend: Box<dyn TrainingBackend>,
    ) -> TrainingResult<Self> {
        let settings = TrainSettings::from_config(&config)?;
        Ok(Self {
            run_id: RunId::new(),
            task: String::from("custom"),
            config,
            backend_config: None,
            settings,
            models,
            datasets,
            backend,
            group: ProcessGroup::global(),
            launch: LaunchEnv::single_process(),
            progress: Arc::new(LogProgressSink::default()),
            state: LifecycleState::Created,
            engine: None,
        })
    }

    #[must_use]
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    #[must_use]
    pub fn with_backend_config(mut self, backend_config: Option<BackendConfig>) -> Self {
        self.backend_config = backend_config;
        self
    }

    #[must_use]
    pub fn with_process_group(mut self, group: Arc<ProcessGroup>) -> Self {
        self.group = group;
        self
    }

    #[must_use]
    pub fn with_launch_env(mut self, launch: LaunchEnv) -> Self {
        self.launch = launch;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    #[must_use]
    pub fn settings(&self) -> &TrainSettings {
        &self.settings
    }

    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Scores `batch` with the trained engine. `Ok(None)` when the backend
    /// has no inference path; a lifecycle error before the run is `DONE`.
    pub fn infer_batch(&mut self, batch: &Batch) -> TrainingResult<Option<InferOutput>> {
        match self.engine.as_mut() {
            Some(engine) if self.state == LifecycleState::Done => engine.infer_batch(batch),
            _ => Err(TrainingError::Lifecycle { from: self.state.to_string(), to: "inference".to_string() }),
        }
    }

    /// Runs the lifecycle to `DONE`. On error the state is `FAILED` and the
    /// error is returned unchanged.
    pub fn run(&mut self) -> TrainingResult<RunSummary> {
        if self.state != LifecycleState::Created {
            return Err(TrainingError::Lifecycle {
                from: self.state.to_string(),
                to: LifecycleState::Seeded.to_string(),
            });
        }

        match self.drive() {
            Ok(summary) => Ok(summary),
            Err(err) => {
                error!(
                    run_id = %self.run_id,
                    state = %self.state,
                    kind = %err.kind(),
                    error = %err,
                    "training run failed"
                );
                if self.state.can_transition_to(LifecycleState::Failed) {
                    self.state = LifecycleState::Failed;
                }
                Err(err)
            }
        }
    }

    fn advance(&mut self, to: LifecycleState) -> TrainingResult<()> {
        if !self.state.can_transition_to(to) {
            return Err(TrainingError::Lifecycle { from: self.state.to_string(), to: to.to_string() });
        }
        let from = std::mem::replace(&mut self.state, to);
        self.progress.on_event(ProgressEvent::StateChanged { run_id: self.run_id.clone(), from, to });
        Ok(())
    }

    fn drive(&mut self) -> TrainingResult<RunSummary> {
        let config = self.config.clone();
        let backend_config = self.backend_config.clone();
        let settings = self.settings.clone();

        self.progress.on_event(ProgressEvent::Started {
            run_id: self.run_id.clone(),
            rank: self.launch.rank,
            world_size: self.launch.world_size,
        });

        self.backend.manual_seed(settings.seed);
        self.advance(LifecycleState::Seeded)?;

        let distributed = DistributedContext::initialize(&self.group, &self.launch, self.backend.as_mut())?;
        self.advance(LifecycleState::DistributedReady)?;

        let ctx = InitContext {
            config: &config,
            backend_config: backend_config.as_ref(),
            distributed: &distributed,
            settings: &settings,
        };

        let models = self.models.init_models(&ctx)?;
        self.advance(LifecycleState::ModelsReady)?;

        let data = self.datasets.init_datasets(&ctx, &models)?;
        self.advance(LifecycleState::DataReady)?;

        let total_steps = settings.total_steps(data.train.len());
        let optimizer = settings.optimizer_config(total_steps, backend_config.as_ref(), distributed.world_size());
        let mut engine = self.backend.wrap_for_distributed_training(&models, &optimizer)?;
        self.advance(LifecycleState::Training)?;

        let layout = OutputLayout::new(settings.output_dir.clone());
        layout.ensure_root()?;

        let mut run = RunLoop {
            run_id: &self.run_id,
            settings: &settings,
            layout: &layout,
            progress: self.progress.as_ref(),
            main_process: distributed.is_main_process(),
            total_steps,
            metrics: TrainingMetrics::default(),
        };
        run.train(engine.as_mut(), &data)?;
        let metrics = run.metrics;
        engine.flush()?;

        let final_dir = layout.final_dir();
        engine.save(&final_dir)?;
        self.progress.on_event(ProgressEvent::Saved {
            run_id: self.run_id.clone(),
            step: metrics.steps,
            path: final_dir.clone(),
        });
        self.advance(LifecycleState::Saved)?;

        let manifest = if distributed.is_main_process() {
            let path = layout.manifest_path();
            let manifest = TrainingManifest {
                run_id: self.run_id.clone(),
                created_at: Utc::now(),
                task: self.task.clone(),
                model: config.opt_str(MODEL_REF_KEY).ok().flatten().map(str::to_string),
                world_size: distributed.world_size(),
                metrics: metrics.clone(),
                artifacts: collect_artifacts(&final_dir)?,
            };
            manifest.write(&path)?;
            debug!(path = %path.display(), artifacts = manifest.artifacts.len(), "wrote training manifest");
            Some(path)
        } else {
            None
        };

        self.progress.on_event(ProgressEvent::Finished { run_id: self.run_id.clone(), steps: metrics.steps });
        self.advance(LifecycleState::Done)?;
        distributed.shutdown();
        self.engine = Some(engine);

        info!(
            run_id = %self.run_id,
            steps = metrics.steps,
            skipped = metrics.skipped_steps,
            output = %final_dir.display(),
            "training complete"
        );

        Ok(RunSummary {
            run_id: self.run_id.clone(),
            state: self.state,
            metrics,
            checkpoints: layout.periodic_slices()?.into_iter().map(|(_, path)| path).collect(),
            final_checkpoint: final_dir,
            manifest,
        })
    }
}

/// Mutable state of the step loop.
struct RunLoop<'a> {
    run_id: &'a RunId,
    settings: &'a TrainSettings,
    layout: &'a OutputLayout,
    progress: &'a dyn ProgressSink,
    main_process: bool,
    total_steps: u64,
    metrics: TrainingMetrics,
}

impl RunLoop<'_> {
    fn train(&mut self, engine: &mut dyn Engine, data: &DataBundle) -> TrainingResult<()> {
        let mut consecutive_failures = 0_u32;

        'epochs: for epoch in 0..self.settings.epochs {
            for batch in data.train.epoch(epoch) {
                if self.metrics.steps >= self.total_steps {
                    break 'epochs;
                }
                self.metrics.steps += 1;
                self.metrics.epochs = epoch + 1;
                let step = self.metrics.steps;

                let failure = match engine.step(&batch) {
                    Ok(out) if out.loss.is_finite() => {
                        consecutive_failures = 0;
                        self.metrics.train_loss = Some(out.loss);
                        self.progress.on_event(ProgressEvent::Step {
                            run_id: self.run_id.clone(),
                            step,
                            epoch,
                            loss: out.loss,
                            total: Some(self.total_steps),
                        });
                        None
                    }
                    Ok(out) => Some(format!("non-finite loss {}", out.loss)),
                    Err(err) => Some(err.to_string()),
                };

                if let Some(reason) = failure {
                    consecutive_failures += 1;
                    self.metrics.skipped_steps += 1;
                    self.progress.on_event(ProgressEvent::StepSkipped {
                        run_id: self.run_id.clone(),
                        step,
                        reason: reason.clone(),
                        consecutive: consecutive_failures,
                    });
                    if consecutive_failures > self.settings.max_consecutive_failures {
                        return Err(TrainingError::step(
                            step,
                            format!("{consecutive_failures} consecutive steps failed, last: {reason}"),
                        ));
                    }
                }

                if let EvalStrategy::Steps(interval) = self.settings.eval_strategy {
                    if step % interval == 0 {
                        self.evaluate(engine, &data.eval, step)?;
                    }
                }

                if let Some(interval) = self.settings.save_interval {
                    if step % interval == 0 {
                        self.save_periodic(engine, step)?;
                    }
                }
            }

            if self.settings.eval_strategy == EvalStrategy::Epoch {
                self.evaluate(engine, &data.eval, self.metrics.steps)?;
            }
        }
        Ok(())
    }

    /// Averages each metric over the eval batches.
    fn evaluate(&mut self, engine: &mut dyn Engine, eval: &DataLoader, step: u64) -> TrainingResult<()> {
        if eval.is_empty() {
            return Ok(());
        }

        let mut sums: BTreeMap<String, (f64, u32)> = BTreeMap::new();
        for batch in eval.epoch(0) {
            for (name, value) in engine.evaluate(&batch)?.metrics {
                let entry = sums.entry(name).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }

        let metrics: BTreeMap<String, f64> =
            sums.into_iter().map(|(name, (sum, n))| (name, sum / f64::from(n))).collect();
        self.progress.on_event(ProgressEvent::Evaluated { run_id: self.run_id.clone(), step, metrics: metrics.clone() });
        self.metrics.eval = metrics;
        Ok(())
    }

    fn save_periodic(&mut self, engine: &mut dyn Engine, step: u64) -> TrainingResult<()> {
        let dir = self.layout.slice_dir(step);
        engine.save(&dir)?;
        self.progress.on_event(ProgressEvent::Saved { run_id: self.run_id.clone(), step, path: dir });

        if self.main_process {
            if let Some(limit) = self.settings.save_total_limit {
                self.layout.prune(limit)?;
            }
        }
        Ok(())
    }
}
