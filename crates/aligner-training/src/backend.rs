//! Training backend contract.
//!
//! The backend owns gradient computation, optimizer stepping, collective
//! communication and the checkpoint format. The lifecycle only sequences
//! calls to it.

use crate::config::BackendConfig;
use crate::dataset::Batch;
use crate::distributed::{Device, LaunchEnv};
use crate::error::TrainingResult;
use crate::model::ModelBundle;
use std::collections::BTreeMap;
use std::path::Path;

/// Optimizer and schedule settings handed to the backend when the model is
/// wrapped for distributed training.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub lr_scheduler_type: String,
    pub lr_warmup_ratio: f64,
    pub gradient_accumulation_steps: u64,
    pub bf16: bool,
    pub fp16: bool,
    /// Training steps planned for the whole run, one per batch.
    pub total_steps: u64,
    /// Backend document stamped with the batch and precision keys.
    pub backend: Option<BackendConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f64,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvalOutput {
    pub metrics: BTreeMap<String, f64>,
}

/// Costs for each sample of a batch, from a forward pass without gradients.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferOutput {
    pub better: Vec<f64>,
    pub worse: Vec<f64>,
}

impl EvalOutput {
    #[must_use]
    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }
}

pub trait TrainingBackend {
    fn name(&self) -> &str;

    /// Seeds every random source the backend owns.
    fn manual_seed(&mut self, seed: u64);

    /// Forms the process group. Blocks until every rank has joined.
    fn init_distributed(&mut self, env: &LaunchEnv) -> TrainingResult<()>;

    fn accelerator_count(&self) -> usize;

    /// Makes `device` the default compute device for this process.
    fn bind_device(&mut self, device: Device) -> TrainingResult<()>;

    /// Hands the model to the backend. From here on parameters change only
    /// through [`Engine::step`].
    fn wrap_for_distributed_training(
        &mut self,
        models: &ModelBundle,
        optimizer: &OptimizerConfig,
    ) -> TrainingResult<Box<dyn Engine>>;
}

pub trait Engine {
    /// Forward, backward and (at accumulation boundaries) optimizer step.
    fn step(&mut self, batch: &Batch) -> TrainingResult<StepOutput>;

    fn evaluate(&mut self, batch: &Batch) -> TrainingResult<EvalOutput>;

    /// Batch inference, for engines whose model supports it. `None` means
    /// the engine has no inference path.
    fn infer_batch(&mut self, _batch: &Batch) -> TrainingResult<Option<InferOutput>> {
        Ok(None)
    }

    /// Applies gradients still held for an unfinished accumulation window.
    /// Called once after the last training step, before the final save.
    fn flush(&mut self) -> TrainingResult<()> {
        Ok(())
    }

    /// Collective on every rank: each must call it with the same directory.
    fn save(&mut self, dir: &Path) -> TrainingResult<()>;
}
