use crate::backend::OptimizerConfig;
use crate::config::{BackendConfig, BackendStamp, FrozenConfig};
use crate::error::{TrainingError, TrainingResult};
use std::path::PathBuf;

pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalStrategy {
    /// After every epoch.
    Epoch,
    /// Every N training steps.
    Steps(u64),
    No,
}

/// Optimizer fields read from `train_cfgs`.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub lr_scheduler_type: String,
    pub lr_warmup_ratio: f64,
    pub bf16: bool,
    pub fp16: bool,
}

/// Loop settings resolved from the frozen configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainSettings {
    pub seed: u64,
    pub epochs: u64,
    pub max_steps: Option<u64>,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: u64,
    pub eval_strategy: EvalStrategy,
    /// Periodic checkpoint cadence in training steps. A training step is one
    /// train batch, skipped or not, so with gradient accumulation several
    /// steps make up one optimizer update.
    pub save_interval: Option<u64>,
    pub save_total_limit: Option<usize>,
    pub max_consecutive_failures: u32,
    pub output_dir: PathBuf,
    pub optimizer: OptimizerSettings,
}

impl TrainSettings {
    pub fn from_config(config: &FrozenConfig) -> TrainingResult<Self> {
        let train = config.section("train_cfgs")?;
        let logger = config.section("logger_cfgs")?;

        let epochs = train.u64("epochs")?;
        if epochs == 0 {
            return Err(TrainingError::config("train_cfgs.epochs", "must be at least 1"));
        }

        let per_device_train_batch_size = positive(train.usize("per_device_train_batch_size")?, "train_cfgs.per_device_train_batch_size")?;
        let per_device_eval_batch_size = match train.opt_u64("per_device_eval_batch_size")? {
            Some(n) => positive(to_usize(n, "train_cfgs.per_device_eval_batch_size")?, "train_cfgs.per_device_eval_batch_size")?,
            None => per_device_train_batch_size,
        };
        let gradient_accumulation_steps = train.opt_u64("gradient_accumulation_steps")?.unwrap_or(1);
        if gradient_accumulation_steps == 0 {
            return Err(TrainingError::config("train_cfgs.gradient_accumulation_steps", "must be at least 1"));
        }

        let eval_strategy = match train.opt_str("eval_strategy")?.map(str::to_ascii_lowercase).as_deref() {
            None | Some("epoch") => EvalStrategy::Epoch,
            Some("no") => EvalStrategy::No,
            Some("steps") => {
                let interval = train.u64("eval_interval")?;
                if interval == 0 {
                    return Err(TrainingError::config("train_cfgs.eval_interval", "must be at least 1"));
                }
                EvalStrategy::Steps(interval)
            }
            Some(other) => {
                return Err(TrainingError::config(
                    "train_cfgs.eval_strategy",
                    format!("expected epoch|steps|no, found `{other}`"),
                ));
            }
        };

        let max_consecutive_failures = match train.opt_u64("max_consecutive_failures")? {
            Some(n) => u32::try_from(n)
                .map_err(|_| TrainingError::config("train_cfgs.max_consecutive_failures", "value is too large"))?,
            None => DEFAULT_MAX_CONSECUTIVE_FAILURES,
        };

        let save_total_limit = match logger.opt_u64("save_total_limit")? {
            Some(n) => Some(to_usize(n, "logger_cfgs.save_total_limit")?),
            None => None,
        };

        let bf16 = train.opt_bool("bf16")?.unwrap_or(false);
        let fp16 = train.opt_bool("fp16")?.unwrap_or(false);
        if bf16 && fp16 {
            return Err(TrainingError::config("train_cfgs.fp16", "bf16 and fp16 are mutually exclusive"));
        }

        Ok(Self {
            seed: train.u64("seed")?,
            epochs,
            max_steps: train.opt_u64("max_steps")?.filter(|n| *n > 0),
            per_device_train_batch_size,
            per_device_eval_batch_size,
            gradient_accumulation_steps,
            eval_strategy,
            save_interval: train.opt_u64("save_interval")?.filter(|n| *n > 0),
            save_total_limit,
            max_consecutive_failures,
            output_dir: PathBuf::from(logger.str("output_dir")?),
            optimizer: OptimizerSettings {
                learning_rate: train.opt_f64("learning_rate")?.unwrap_or(1e-5),
                weight_decay: train.opt_f64("weight_decay")?.unwrap_or(0.0),
                adam_beta1: train.opt_f64("adam_beta1")?.unwrap_or(0.9),
                adam_beta2: train.opt_f64("adam_beta2")?.unwrap_or(0.95),
                lr_scheduler_type: train.opt_str("lr_scheduler_type")?.unwrap_or("constant").to_string(),
                lr_warmup_ratio: train.opt_f64("lr_warmup_ratio")?.unwrap_or(0.0),
                bf16,
                fp16,
            },
        })
    }

    /// Training steps in the whole run for a loader of `batches_per_epoch`.
    #[must_use]
    pub fn total_steps(&self, batches_per_epoch: usize) -> u64 {
        let planned = self.epochs * batches_per_epoch as u64;
        self.max_steps.map_or(planned, |cap| planned.min(cap))
    }

    /// Assembles the optimizer configuration and stamps the backend document.
    #[must_use]
    pub fn optimizer_config(
        &self,
        total_steps: u64,
        backend: Option<&BackendConfig>,
        world_size: usize,
    ) -> OptimizerConfig {
        let opt = &self.optimizer;
        let stamp = BackendStamp {
            micro_batch_size: self.per_device_train_batch_size,
            gradient_accumulation_steps: self.gradient_accumulation_steps,
            world_size,
            bf16: opt.bf16,
            fp16: opt.fp16,
        };
        OptimizerConfig {
            learning_rate: opt.learning_rate,
            weight_decay: opt.weight_decay,
            adam_beta1: opt.adam_beta1,
            adam_beta2: opt.adam_beta2,
            lr_scheduler_type: opt.lr_scheduler_type.clone(),
            lr_warmup_ratio: opt.lr_warmup_ratio,
            gradient_accumulation_steps: self.gradient_accumulation_steps,
            bf16: opt.bf16,
            fp16: opt.fp16,
            total_steps,
            backend: backend.map(|b| b.stamped(&stamp)),
        }
    }
}

fn positive(n: usize, path: &str) -> TrainingResult<usize> {
    if n == 0 {
        return Err(TrainingError::config(path, "must be at least 1"));
    }
    Ok(n)
}

fn to_usize(n: u64, path: &str) -> TrainingResult<usize> {
    usize::try_from(n).map_err(|_| TrainingError::config(path, format!("{n} does not fit the platform size")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigTree;

    const MINIMAL: &str = "
train_cfgs:
  seed: 42
  epochs: 2
  per_device_train_batch_size: 4
logger_cfgs:
  output_dir: /tmp/out
";

    fn settings(yaml: &str) -> TrainingResult<TrainSettings> {
        TrainSettings::from_config(&ConfigTree::from_yaml_str(yaml, "test")?.freeze())
    }

    #[test]
    fn test_defaults_for_optional_fields() {
        let s = settings(MINIMAL).unwrap();
        assert_eq!(s.seed, 42);
        assert_eq!(s.per_device_eval_batch_size, 4);
        assert_eq!(s.gradient_accumulation_steps, 1);
        assert_eq!(s.eval_strategy, EvalStrategy::Epoch);
        assert_eq!(s.max_consecutive_failures, DEFAULT_MAX_CONSECUTIVE_FAILURES);
        assert_eq!(s.save_total_limit, None);
    }

    #[test]
    fn test_missing_seed_cites_path() {
        let err = settings("train_cfgs:\n  epochs: 1\n  per_device_train_batch_size: 1\nlogger_cfgs:\n  output_dir: o\n")
            .unwrap_err();
        assert!(err.to_string().contains("train_cfgs.seed"));
    }

    #[test]
    fn test_steps_eval_strategy_needs_interval() {
        let yaml = format!("{MINIMAL}\n");
        let mut tree = ConfigTree::from_yaml_str(&yaml, "test").unwrap();
        tree.set(&"train_cfgs.eval_strategy".parse().unwrap(), "steps".into()).unwrap();
        assert!(TrainSettings::from_config(&tree.clone().freeze()).is_err());

        tree.set(&"train_cfgs.eval_interval".parse().unwrap(), 10_i64.into()).unwrap();
        let s = TrainSettings::from_config(&tree.freeze()).unwrap();
        assert_eq!(s.eval_strategy, EvalStrategy::Steps(10));
    }

    #[test]
    fn test_total_steps_respects_max_steps() {
        let mut s = settings(MINIMAL).unwrap();
        assert_eq!(s.total_steps(5), 10);
        s.max_steps = Some(3);
        assert_eq!(s.total_steps(5), 3);
    }

    #[test]
    fn test_optimizer_config_stamps_backend() {
        let s = settings(MINIMAL).unwrap();
        let backend = BackendConfig::from_value(serde_json::json!({"zero_optimization": {"stage": 3}})).unwrap();
        let cfg = s.optimizer_config(10, Some(&backend), 2);

        let stamped = cfg.backend.unwrap();
        assert_eq!(stamped.get("train_batch_size"), Some(&serde_json::json!(8)));
        assert_eq!(cfg.total_steps, 10);
    }
}
