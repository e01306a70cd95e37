//! Pretrained model resolution, freezing and reward-head adaptation.

use crate::config::BackendConfig;
use crate::error::{TrainingError, TrainingResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Where a pretrained model comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ModelRef {
    Local(PathBuf),
    /// `org/name` identifier resolved by the provider.
    Registry(String),
}

impl ModelRef {
    /// An existing path is local; otherwise the reference must look like
    /// `org/name`.
    pub fn parse(raw: &str) -> TrainingResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TrainingError::model_load(raw, "model reference is empty"));
        }

        let path = Path::new(raw);
        if path.exists() {
            return Ok(Self::Local(path.to_path_buf()));
        }

        if is_registry_id(raw) {
            return Ok(Self::Registry(raw.to_string()));
        }

        Err(TrainingError::model_load(
            raw,
            "neither an existing path nor an `org/name` registry identifier",
        ))
    }
}

fn is_registry_id(raw: &str) -> bool {
    let mut parts = raw.split('/');
    let (Some(org), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let valid = |s: &str| {
        !s.is_empty()
            && !s.starts_with('.')
            && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    valid(org) && valid(name)
}

impl FromStr for ModelRef {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Registry(id) => f.write_str(id),
        }
    }
}

/// Which parameter subsets stop receiving gradient updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezingPolicy {
    pub freeze_multimodal_projector: bool,
    pub freeze_vision_tower: bool,
    pub freeze_language_backbone: bool,
}

impl FreezingPolicy {
    #[must_use]
    pub fn freezes(&self, group: ParameterGroup) -> bool {
        match group {
            ParameterGroup::VisionTower => self.freeze_vision_tower,
            ParameterGroup::MultimodalProjector => self.freeze_multimodal_projector,
            ParameterGroup::LanguageBackbone => self.freeze_language_backbone,
            ParameterGroup::OutputHead | ParameterGroup::Other => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterGroup {
    VisionTower,
    MultimodalProjector,
    LanguageBackbone,
    OutputHead,
    Other,
}

impl ParameterGroup {
    /// Classifies a parameter by its dotted name.
    #[must_use]
    pub fn classify(name: &str) -> Self {
        let has = |needle: &str| name.split('.').any(|segment| segment == needle);

        if has("lm_head") || has("score_head") {
            Self::OutputHead
        } else if has("vision_tower") || has("vision_model") {
            Self::VisionTower
        } else if has("multi_modal_projector") || has("mm_projector") {
            Self::MultimodalProjector
        } else if has("language_model") || has("embed_tokens") || name.starts_with("model.layers.") {
            Self::LanguageBackbone
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub group: ParameterGroup,
    pub numel: u64,
    pub trainable: bool,
}

impl Parameter {
    pub fn new(name: impl Into<String>, numel: u64) -> Self {
        let name = name.into();
        let group = ParameterGroup::classify(&name);
        Self { name, group, numel, trainable: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputHead {
    LanguageModeling { vocab_size: usize },
    Score { dim: usize },
}

/// How parameters are materialized when the model is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Materialization {
    Full,
    Partitioned { world_size: usize },
}

/// Deployment shape declared ahead of model construction when the backend
/// partitions parameters across ranks.
#[derive(Debug, Clone, PartialEq)]
pub struct ShapeDeclaration {
    pub zero_stage: u64,
    pub world_size: usize,
    pub backend: BackendConfig,
}

impl ShapeDeclaration {
    /// `Some` only for backends that need the shape before construction.
    #[must_use]
    pub fn declare(backend: &BackendConfig, world_size: usize) -> Option<Self> {
        if !backend.requires_shape_declaration() {
            return None;
        }
        Some(Self { zero_stage: backend.zero_stage().unwrap_or(3), world_size, backend: backend.clone() })
    }

    #[must_use]
    pub fn materialization(&self) -> Materialization {
        Materialization::Partitioned { world_size: self.world_size }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PretrainedModel {
    pub architecture: String,
    pub hidden_size: usize,
    pub max_position_embeddings: usize,
    pub parameters: Vec<Parameter>,
    pub head: OutputHead,
    /// Whether the architecture can carry a scalar score head.
    pub supports_score_head: bool,
    pub materialization: Materialization,
}

impl PretrainedModel {
    #[must_use]
    pub fn num_parameters(&self) -> u64 {
        self.parameters.iter().map(|p| p.numel).sum()
    }

    #[must_use]
    pub fn num_trainable_parameters(&self) -> u64 {
        self.parameters.iter().filter(|p| p.trainable).map(|p| p.numel).sum()
    }

    pub fn parameters_in(&self, group: ParameterGroup) -> impl Iterator<Item = &Parameter> {
        self.parameters.iter().filter(move |p| p.group == group)
    }

    #[must_use]
    pub fn is_reward_model(&self) -> bool {
        matches!(self.head, OutputHead::Score { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingSide {
    Left,
    #[default]
    Right,
}

impl FromStr for PaddingSide {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(TrainingError::config("padding_side", format!("expected left|right, found `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokenizer {
    pub name: String,
    pub model_max_length: usize,
    #[serde(default)]
    pub padding_side: PaddingSide,
    pub vocab_size: usize,
}

impl Tokenizer {
    /// Whitespace tokenization with hashed ids, truncated to
    /// `model_max_length`.
    #[must_use]
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let vocab = self.vocab_size.max(1) as u64;
        text.split_whitespace()
            .take(self.model_max_length)
            .map(|word| u32::try_from(fnv1a(word.as_bytes()) % vocab).unwrap_or(u32::MAX))
            .collect()
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3))
}

/// Multimodal input processor (image preprocessing settings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processor {
    pub name: String,
    pub image_size: Option<u64>,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl Processor {
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&serde_json::Value> {
        self.options.get(key)
    }
}

/// Options forwarded to [`ModelProvider::load_pretrained`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PretrainedOptions {
    pub trust_remote_code: bool,
    pub padding_side: PaddingSide,
    pub processor_options: serde_json::Map<String, serde_json::Value>,
    pub shape: Option<ShapeDeclaration>,
}

#[derive(Debug, Clone)]
pub struct Pretrained {
    pub model: PretrainedModel,
    pub tokenizer: Tokenizer,
    pub processor: Option<Processor>,
}

/// Resolves and loads pretrained weights, tokenizer and processor.
pub trait ModelProvider: Send + Sync {
    fn load_pretrained(&self, reference: &ModelRef, options: &PretrainedOptions) -> TrainingResult<Pretrained>;
}

/// Model, tokenizer and processor as owned by the trainer. Shared with the
/// backend once training starts.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    pub model: Arc<PretrainedModel>,
    pub tokenizer: Arc<Tokenizer>,
    pub processor: Option<Arc<Processor>>,
}

#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub reference: ModelRef,
    pub max_length: usize,
    pub freezing: FreezingPolicy,
    pub as_reward_model: bool,
    pub processor_options: serde_json::Map<String, serde_json::Value>,
    pub trust_remote_code: bool,
    pub padding_side: PaddingSide,
}

impl LoadRequest {
    #[must_use]
    pub fn new(reference: ModelRef, max_length: usize) -> Self {
        Self {
            reference,
            max_length,
            freezing: FreezingPolicy::default(),
            as_reward_model: false,
            processor_options: serde_json::Map::new(),
            trust_remote_code: false,
            padding_side: PaddingSide::Right,
        }
    }
}

pub struct ModelInitializer {
    provider: Arc<dyn ModelProvider>,
}

impl ModelInitializer {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }

    /// Loads the model and applies reward adaptation, then freezing, then the
    /// tokenizer length stamp.
    ///
    /// `shape` must be declared by the caller before this call when the
    /// backend partitions parameters at construction.
    pub fn load(&self, request: &LoadRequest, shape: Option<&ShapeDeclaration>) -> TrainingResult<ModelBundle> {
        let reference = &request.reference;
        let options = PretrainedOptions {
            trust_remote_code: request.trust_remote_code,
            padding_side: request.padding_side,
            processor_options: request.processor_options.clone(),
            shape: shape.cloned(),
        };

        let Pretrained { mut model, mut tokenizer, processor } =
            self.provider.load_pretrained(reference, &options).map_err(|e| match e {
                TrainingError::ModelLoad { .. } => e,
                other => TrainingError::model_load(reference, other.to_string()),
            })?;

        if request.as_reward_model {
            adapt_to_reward_model(&mut model, reference)?;
        }

        let frozen = apply_freezing(&mut model, &request.freezing);

        // the provider may have applied its own default
        tokenizer.model_max_length = request.max_length;
        if request.max_length > model.max_position_embeddings {
            warn!(
                max_length = request.max_length,
                max_position_embeddings = model.max_position_embeddings,
                "model_max_length exceeds the model's positional capacity"
            );
        }

        info!(
            model = %reference,
            architecture = %model.architecture,
            parameters = model.num_parameters(),
            trainable = model.num_trainable_parameters(),
            frozen_tensors = frozen,
            reward_model = model.is_reward_model(),
            max_length = tokenizer.model_max_length,
            "model initialized"
        );

        Ok(ModelBundle {
            model: Arc::new(model),
            tokenizer: Arc::new(tokenizer),
            processor: processor.map(Arc::new),
        })
    }
}

/// Swaps the language-modeling head for a one-dimensional score head.
fn adapt_to_reward_model(model: &mut PretrainedModel, reference: &ModelRef) -> TrainingResult<()> {
    if model.is_reward_model() {
        return Ok(());
    }
    if !model.supports_score_head {
        return Err(TrainingError::model_load(
            reference,
            format!("architecture `{}` does not support reward-model adaptation", model.architecture),
        ));
    }

    model.parameters.retain(|p| p.group != ParameterGroup::OutputHead);
    model.parameters.push(Parameter::new("score_head.weight", model.hidden_size as u64));
    model.head = OutputHead::Score { dim: 1 };
    Ok(())
}

/// Returns the number of tensors marked non-trainable.
fn apply_freezing(model: &mut PretrainedModel, policy: &FreezingPolicy) -> usize {
    let mut frozen = 0;
    for param in &mut model.parameters {
        if policy.freezes(param.group) {
            param.trainable = false;
            frozen += 1;
        }
    }
    frozen
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct StubProvider {
        supports_score_head: bool,
        seen: Mutex<Vec<PretrainedOptions>>,
    }

    impl StubProvider {
        fn new(supports_score_head: bool) -> Arc<Self> {
            Arc::new(Self { supports_score_head, seen: Mutex::new(Vec::new()) })
        }
    }

    impl ModelProvider for StubProvider {
        fn load_pretrained(&self, _reference: &ModelRef, options: &PretrainedOptions) -> TrainingResult<Pretrained> {
            self.seen.lock().unwrap().push(options.clone());
            let parameters = vec![
                Parameter::new("vision_tower.encoder.layers.0.weight", 64),
                Parameter::new("multi_modal_projector.linear_1.weight", 32),
                Parameter::new("language_model.model.layers.0.mlp.weight", 128),
                Parameter::new("language_model.lm_head.weight", 256),
            ];
            Ok(Pretrained {
                model: PretrainedModel {
                    architecture: "LlavaForConditionalGeneration".to_string(),
                    hidden_size: 16,
                    max_position_embeddings: 4096,
                    parameters,
                    head: OutputHead::LanguageModeling { vocab_size: 100 },
                    supports_score_head: self.supports_score_head,
                    materialization: options.shape.as_ref().map_or(Materialization::Full, ShapeDeclaration::materialization),
                },
                tokenizer: Tokenizer {
                    name: "stub".to_string(),
                    model_max_length: 1_000_000,
                    padding_side: options.padding_side,
                    vocab_size: 100,
                },
                processor: None,
            })
        }
    }

    fn request() -> LoadRequest {
        LoadRequest::new(ModelRef::Registry("org/stub".to_string()), 512)
    }

    #[test]
    fn test_classify_parameter_groups() {
        assert_eq!(ParameterGroup::classify("vision_tower.blocks.0.attn.qkv"), ParameterGroup::VisionTower);
        assert_eq!(ParameterGroup::classify("model.vision_model.embeddings"), ParameterGroup::VisionTower);
        assert_eq!(ParameterGroup::classify("mm_projector.0.weight"), ParameterGroup::MultimodalProjector);
        assert_eq!(ParameterGroup::classify("model.layers.3.self_attn.q_proj"), ParameterGroup::LanguageBackbone);
        assert_eq!(ParameterGroup::classify("language_model.lm_head.weight"), ParameterGroup::OutputHead);
        assert_eq!(ParameterGroup::classify("logit_scale"), ParameterGroup::Other);
    }

    #[test]
    fn test_model_ref_parse() {
        assert_eq!(ModelRef::parse("llava-hf/llava-1.5-7b-hf").unwrap(), ModelRef::Registry("llava-hf/llava-1.5-7b-hf".to_string()));
        assert!(ModelRef::parse("not a model").is_err());
        assert!(ModelRef::parse("").is_err());

        let temp = tempfile::TempDir::new().unwrap();
        let local = ModelRef::parse(temp.path().to_str().unwrap()).unwrap();
        assert!(matches!(local, ModelRef::Local(_)));
    }

    #[test]
    fn test_tokenizer_max_length_is_restamped() {
        let init = ModelInitializer::new(StubProvider::new(true));
        let bundle = init.load(&request(), None).unwrap();
        assert_eq!(bundle.tokenizer.model_max_length, 512);
    }

    #[test]
    fn test_freeze_vision_tower_only() {
        let init = ModelInitializer::new(StubProvider::new(true));
        let mut req = request();
        req.freezing.freeze_vision_tower = true;

        let bundle = init.load(&req, None).unwrap();
        for param in &bundle.model.parameters {
            assert_eq!(param.trainable, param.group != ParameterGroup::VisionTower, "{}", param.name);
        }
    }

    #[test]
    fn test_reward_adaptation_replaces_head() {
        let init = ModelInitializer::new(StubProvider::new(true));
        let mut req = request();
        req.as_reward_model = true;
        req.freezing = FreezingPolicy {
            freeze_multimodal_projector: true,
            freeze_vision_tower: true,
            freeze_language_backbone: true,
        };

        let bundle = init.load(&req, None).unwrap();
        assert_eq!(bundle.model.head, OutputHead::Score { dim: 1 });
        let heads: Vec<_> = bundle.model.parameters_in(ParameterGroup::OutputHead).collect();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].name, "score_head.weight");
        assert!(heads[0].trainable);
        assert_eq!(bundle.model.num_trainable_parameters(), 16);
    }

    #[test]
    fn test_reward_adaptation_unsupported_is_model_load_error() {
        let init = ModelInitializer::new(StubProvider::new(false));
        let mut req = request();
        req.as_reward_model = true;

        let err = init.load(&req, None).unwrap_err();
        assert!(matches!(err, TrainingError::ModelLoad { .. }));
        assert!(err.to_string().contains("org/stub"));
    }

    #[test]
    fn test_shape_declaration_reaches_provider() {
        let provider = StubProvider::new(true);
        let init = ModelInitializer::new(provider.clone());
        let backend = BackendConfig::from_value(json!({"zero_optimization": {"stage": 3}})).unwrap();
        let shape = ShapeDeclaration::declare(&backend, 4).unwrap();

        let bundle = init.load(&request(), Some(&shape)).unwrap();
        assert_eq!(bundle.model.materialization, Materialization::Partitioned { world_size: 4 });
        assert!(provider.seen.lock().unwrap()[0].shape.is_some());

        let stage2 = BackendConfig::from_value(json!({"zero_optimization": {"stage": 2}})).unwrap();
        assert!(ShapeDeclaration::declare(&stage2, 4).is_none());
    }

    #[test]
    fn test_encode_truncates_to_max_length() {
        let tok = Tokenizer { name: "t".to_string(), model_max_length: 3, padding_side: PaddingSide::Right, vocab_size: 50 };
        let ids = tok.encode("a b c d e");
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| *id < 50));
        assert_eq!(tok.encode("same words"), tok.encode("same words"));
    }
}
