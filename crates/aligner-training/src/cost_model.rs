//! Cost model over text + image preference pairs.
//!
//! A reward-style model whose language-modeling head is replaced by a scalar
//! score, trained on preference pairs that carry per-response safety labels.

use crate::backend::TrainingBackend;
use crate::config::FrozenConfig;
use crate::dataset::{DataBundle, DatasetInitializer, DatasetKind, DatasetProvider, SplitConfig};
use crate::error::{TrainingError, TrainingResult};
use crate::lifecycle::{DatasetInitStrategy, InitContext, ModelInitStrategy, TrainerLifecycle};
use crate::model::{FreezingPolicy, LoadRequest, ModelBundle, ModelInitializer, ModelProvider, ModelRef, PaddingSide};
use std::sync::Arc;
use tracing::debug;

pub const MODE: &str = "train";
pub const TASK: &str = "text_image_to_text/cost_model";

pub struct CostModelTrainer {
    models: Arc<dyn ModelProvider>,
    datasets: Arc<dyn DatasetProvider>,
}

impl CostModelTrainer {
    pub fn new(models: Arc<dyn ModelProvider>, datasets: Arc<dyn DatasetProvider>) -> Self {
        Self { models, datasets }
    }

    /// A lifecycle that uses this trainer for both initialization steps.
    pub fn into_lifecycle(
        self,
        config: FrozenConfig,
        backend: Box<dyn TrainingBackend>,
    ) -> TrainingResult<TrainerLifecycle> {
        let strategy = Arc::new(self);
        Ok(TrainerLifecycle::new(config, strategy.clone(), strategy, backend)?.with_task(TASK))
    }

    fn load_request(config: &FrozenConfig) -> TrainingResult<LoadRequest> {
        let model_cfgs = config.section("model_cfgs")?;
        let train_cfgs = config.section("train_cfgs")?;

        let reference = ModelRef::parse(model_cfgs.str("model_name_or_path")?)?;
        let max_length = model_cfgs.usize("model_max_length")?;
        if max_length == 0 {
            return Err(TrainingError::config("model_cfgs.model_max_length", "must be at least 1"));
        }

        let processor_options = train_cfgs
            .opt_table("processor_kwargs")?
            .map(|table| table.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            .unwrap_or_default();

        Ok(LoadRequest {
            reference,
            max_length,
            freezing: FreezingPolicy {
                freeze_multimodal_projector: train_cfgs.opt_bool("freeze_mm_proj")?.unwrap_or(false),
                freeze_vision_tower: train_cfgs.opt_bool("freeze_vision_tower")?.unwrap_or(false),
                freeze_language_backbone: train_cfgs.opt_bool("freeze_language_model")?.unwrap_or(false),
            },
            as_reward_model: true,
            processor_options,
            trust_remote_code: model_cfgs.opt_bool("trust_remote_code")?.unwrap_or(false),
            padding_side: PaddingSide::Right,
        })
    }
}

impl ModelInitStrategy for CostModelTrainer {
    fn init_models(&self, ctx: &InitContext<'_>) -> TrainingResult<ModelBundle> {
        let request = Self::load_request(ctx.config)?;

        // must exist before loading so the provider can partition at construction
        let shape = ctx.shape_declaration();
        if let Some(shape) = &shape {
            debug!(zero_stage = shape.zero_stage, world_size = shape.world_size, "declared deployment shape");
        }

        ModelInitializer::new(Arc::clone(&self.models)).load(&request, shape.as_ref())
    }
}

impl DatasetInitStrategy for CostModelTrainer {
    fn init_datasets(&self, ctx: &InitContext<'_>, models: &ModelBundle) -> TrainingResult<DataBundle> {
        let splits = SplitConfig::from_config(&ctx.config.section("data_cfgs")?)?;

        DatasetInitializer::new(Arc::clone(&self.datasets), ctx.distributed.shard(), ctx.settings.seed)
            .with_batch_sizes(ctx.settings.per_device_train_batch_size, ctx.settings.per_device_eval_batch_size)
            .build(DatasetKind::SafetyPreference, &splits, &models.tokenizer, models.processor.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigTree;

    fn config(extra: &str) -> FrozenConfig {
        let yaml = format!(
            "model_cfgs:\n  model_name_or_path: org/model\n  model_max_length: 512\n  trust_remote_code: true\n\
             train_cfgs:\n  freeze_mm_proj: true\n  freeze_vision_tower: false\n{extra}"
        );
        ConfigTree::from_yaml_str(&yaml, "test").unwrap().freeze()
    }

    #[test]
    fn test_load_request_from_config() {
        let request = CostModelTrainer::load_request(&config("")).unwrap();
        assert_eq!(request.reference, ModelRef::Registry("org/model".to_string()));
        assert_eq!(request.max_length, 512);
        assert!(request.as_reward_model);
        assert!(request.trust_remote_code);
        assert!(request.freezing.freeze_multimodal_projector);
        assert!(!request.freezing.freeze_vision_tower);
        assert!(!request.freezing.freeze_language_backbone);
        assert_eq!(request.padding_side, PaddingSide::Right);
    }

    #[test]
    fn test_processor_kwargs_forwarded() {
        let request = CostModelTrainer::load_request(&config("  processor_kwargs:\n    image_size: 336\n")).unwrap();
        assert_eq!(request.processor_options.get("image_size"), Some(&serde_json::json!(336)));
    }

    #[test]
    fn test_zero_max_length_rejected() {
        let cfg = ConfigTree::from_yaml_str(
            "model_cfgs:\n  model_name_or_path: org/model\n  model_max_length: 0\ntrain_cfgs: {}\n",
            "test",
        )
        .unwrap()
        .freeze();
        let err = CostModelTrainer::load_request(&cfg).unwrap_err();
        assert!(err.to_string().contains("model_cfgs.model_max_length"));
    }
}
