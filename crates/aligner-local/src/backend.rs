use aligner_training::{
    Batch, Device, Engine, EvalOutput, InferOutput, LaunchEnv, ModelBundle, OptimizerConfig, PreferenceSample, StepOutput,
    TrainingBackend, TrainingError, TrainingResult,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::f64::consts::PI;
use std::path::Path;
use tracing::debug;

pub const ENGINE_STATE_FILE: &str = "engine_state.json";
pub const OPTIMIZER_CONFIG_FILE: &str = "optimizer_config.json";

/// A single-process, CPU-only backend.
#[derive(Debug, Default)]
pub struct LocalBackend {
    seed: u64,
    joined: bool,
    device: Option<Device>,
}

impl LocalBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn device(&self) -> Option<Device> {
        self.device
    }
}

impl TrainingBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn manual_seed(&mut self, seed: u64) {
        self.seed = seed;
    }

    fn init_distributed(&mut self, env: &LaunchEnv) -> TrainingResult<()> {
        if env.world_size != 1 {
            return Err(TrainingError::DistributedInit(format!(
                "the local backend runs a single process, got WORLD_SIZE={}",
                env.world_size
            )));
        }
        self.joined = true;
        debug!(rank = env.rank, "local process group formed");
        Ok(())
    }

    fn accelerator_count(&self) -> usize {
        0
    }

    fn bind_device(&mut self, device: Device) -> TrainingResult<()> {
        match device {
            Device::Cpu => {
                self.device = Some(device);
                Ok(())
            }
            Device::Accelerator(_) => {
                Err(TrainingError::DistributedInit(format!("the local backend cannot bind {device}")))
            }
        }
    }

    fn wrap_for_distributed_training(
        &mut self,
        models: &ModelBundle,
        optimizer: &OptimizerConfig,
    ) -> TrainingResult<Box<dyn Engine>> {
        if !self.joined {
            return Err(TrainingError::DistributedInit(
                "wrap_for_distributed_training called before init_distributed".to_string(),
            ));
        }
        Ok(Box::new(LocalEngine::new(models, optimizer.clone(), self.seed)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EngineState {
    weights: Vec<f64>,
    steps: u64,
    updates: u64,
}

/// Scores a response as the mean of per-token weights and trains those
/// weights with a pairwise cost loss plus a safety sign loss.
#[derive(Debug)]
pub struct LocalEngine {
    weights: Vec<f64>,
    grad: Vec<f64>,
    pending: u64,
    steps: u64,
    updates: u64,
    trainable: bool,
    optimizer: OptimizerConfig,
}

struct PairLoss {
    loss: f64,
    correct: bool,
}

impl LocalEngine {
    #[must_use]
    pub fn new(models: &ModelBundle, optimizer: OptimizerConfig, seed: u64) -> Self {
        let vocab = models.tokenizer.vocab_size.max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = (0..vocab).map(|_| rng.gen_range(-0.01..0.01)).collect();
        Self {
            weights,
            grad: vec![0.0; vocab],
            pending: 0,
            steps: 0,
            updates: 0,
            trainable: models.model.parameters.iter().any(|p| p.trainable),
            optimizer,
        }
    }

    #[must_use]
    pub fn updates(&self) -> u64 {
        self.updates
    }

    fn cost(&self, ids: &[u32]) -> f64 {
        if ids.is_empty() {
            return 0.0;
        }
        let sum: f64 = ids.iter().map(|&id| self.weights[id as usize % self.weights.len()]).sum();
        sum / ids.len() as f64
    }

    /// Adds `scale * d(cost)/d(w)` for `ids` into the gradient buffer.
    fn accumulate(&mut self, ids: &[u32], scale: f64) {
        if ids.is_empty() {
            return;
        }
        let share = scale / ids.len() as f64;
        let vocab = self.grad.len();
        for &id in ids {
            self.grad[id as usize % vocab] += share;
        }
    }

    fn pair_loss(&mut self, sample: &PreferenceSample, weight: f64, with_grad: bool) -> PairLoss {
        let better = self.cost(&sample.better_input_ids);
        let worse = self.cost(&sample.worse_input_ids);

        // the worse response should cost more
        let margin = worse - better;
        let mut loss = softplus(-margin);
        let mut d_better = sigmoid(-margin);
        let mut d_worse = -sigmoid(-margin);

        // safe responses score below zero, unsafe ones above
        if let (Some(better_safe), Some(worse_safe)) = (sample.better_safe, sample.worse_safe) {
            let (sb, sw) = (safety_sign(better_safe), safety_sign(worse_safe));
            loss += softplus(-sb * better) + softplus(-sw * worse);
            d_better -= sb * sigmoid(-sb * better);
            d_worse -= sw * sigmoid(-sw * worse);
        }

        if with_grad {
            self.accumulate(&sample.better_input_ids, d_better * weight);
            self.accumulate(&sample.worse_input_ids, d_worse * weight);
        }
        PairLoss { loss, correct: worse > better }
    }

    fn batch_loss(&mut self, batch: &Batch, with_grad: bool) -> (f64, f64) {
        let weight = 1.0 / batch.len() as f64;
        let mut loss = 0.0;
        let mut correct = 0_usize;
        for sample in &batch.samples {
            let pair = self.pair_loss(sample, weight, with_grad);
            loss += pair.loss * weight;
            correct += usize::from(pair.correct);
        }
        (loss, correct as f64 * weight)
    }

    fn learning_rate(&self) -> f64 {
        let accumulation = self.optimizer.gradient_accumulation_steps.max(1);
        let total = (self.optimizer.total_steps / accumulation).max(1) as f64;
        let warmup = (self.optimizer.lr_warmup_ratio * total).ceil();
        let t = self.updates as f64;
        let base = self.optimizer.learning_rate;

        if t < warmup {
            return base * (t + 1.0) / warmup;
        }
        let progress = ((t - warmup) / (total - warmup).max(1.0)).min(1.0);
        match self.optimizer.lr_scheduler_type.as_str() {
            "linear" => base * (1.0 - progress),
            "cosine" => base * 0.5 * (1.0 + (PI * progress).cos()),
            _ => base,
        }
    }

    fn apply_update(&mut self) {
        let lr = self.learning_rate();
        let decay = self.optimizer.weight_decay;
        let pending = self.pending as f64;
        for (w, g) in self.weights.iter_mut().zip(self.grad.iter_mut()) {
            *w -= lr * (*g / pending + decay * *w);
            *g = 0.0;
        }
        self.pending = 0;
        self.updates += 1;
    }
}

impl Engine for LocalEngine {
    fn step(&mut self, batch: &Batch) -> TrainingResult<StepOutput> {
        if batch.is_empty() {
            return Err(TrainingError::step(self.steps + 1, "empty batch"));
        }
        self.steps += 1;

        let (loss, accuracy) = self.batch_loss(batch, self.trainable);
        if !loss.is_finite() {
            self.grad.iter_mut().for_each(|g| *g = 0.0);
            self.pending = 0;
            return Ok(StepOutput { loss, accuracy: Some(accuracy) });
        }

        if self.trainable {
            self.pending += 1;
            if self.pending >= self.optimizer.gradient_accumulation_steps.max(1) {
                self.apply_update();
            }
        }
        Ok(StepOutput { loss, accuracy: Some(accuracy) })
    }

    fn evaluate(&mut self, batch: &Batch) -> TrainingResult<EvalOutput> {
        if batch.is_empty() {
            return Ok(EvalOutput::default());
        }
        let (loss, accuracy) = self.batch_loss(batch, false);
        Ok(EvalOutput::default().with_metric("eval_loss", loss).with_metric("eval_accuracy", accuracy))
    }

    fn infer_batch(&mut self, batch: &Batch) -> TrainingResult<Option<InferOutput>> {
        let (better, worse) = batch
            .samples
            .iter()
            .map(|sample| (self.cost(&sample.better_input_ids), self.cost(&sample.worse_input_ids)))
            .unzip();
        Ok(Some(InferOutput { better, worse }))
    }

    fn flush(&mut self) -> TrainingResult<()> {
        if self.pending > 0 {
            debug!(pending = self.pending, "applying partial accumulation window");
            self.apply_update();
        }
        Ok(())
    }

    fn save(&mut self, dir: &Path) -> TrainingResult<()> {
        std::fs::create_dir_all(dir)?;

        let state = EngineState { weights: self.weights.clone(), steps: self.steps, updates: self.updates };
        write_json(&dir.join(ENGINE_STATE_FILE), &state)?;

        let opt = &self.optimizer;
        let optimizer = json!({
            "learning_rate": opt.learning_rate,
            "weight_decay": opt.weight_decay,
            "adam_beta1": opt.adam_beta1,
            "adam_beta2": opt.adam_beta2,
            "lr_scheduler_type": opt.lr_scheduler_type,
            "lr_warmup_ratio": opt.lr_warmup_ratio,
            "gradient_accumulation_steps": opt.gradient_accumulation_steps,
            "bf16": opt.bf16,
            "fp16": opt.fp16,
            "total_steps": opt.total_steps,
            "backend": opt.backend.as_ref().map(|b| b.to_json()),
        });
        write_json(&dir.join(OPTIMIZER_CONFIG_FILE), &optimizer)?;

        debug!(path = %dir.display(), steps = self.steps, "saved local engine state");
        Ok(())
    }
}

fn safety_sign(is_safe: bool) -> f64 {
    if is_safe { -1.0 } else { 1.0 }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// `ln(1 + e^x)`, stable for large `|x|`.
fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> TrainingResult<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}
