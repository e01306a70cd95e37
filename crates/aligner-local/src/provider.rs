use aligner_training::{
    Materialization, ModelProvider, ModelRef, OutputHead, Parameter, Pretrained, PretrainedModel,
    PretrainedOptions, Processor, ShapeDeclaration, Tokenizer, TrainingError, TrainingResult,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the directory registry identifiers resolve in.
pub const MODEL_CACHE_ENV: &str = "ALIGNER_MODEL_CACHE";

const MODEL_CONFIG_FILE: &str = "config.json";
const TOKENIZER_CONFIG_FILE: &str = "tokenizer_config.json";
const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";

/// Tokenizer limit when `tokenizer_config.json` sets none.
const UNBOUNDED_MAX_LENGTH: usize = 1 << 30;

/// Architectures whose outputs cannot be replaced by a score head.
const NO_SCORE_HEAD: &[&str] = &["encoder_decoder", "t5", "bart"];

#[derive(Debug, Deserialize)]
struct ModelConfigFile {
    #[serde(default)]
    architectures: Vec<String>,
    #[serde(default)]
    model_type: Option<String>,
    hidden_size: usize,
    max_position_embeddings: usize,
    vocab_size: usize,
    #[serde(default)]
    num_hidden_layers: Option<usize>,
    #[serde(default)]
    vision_hidden_size: Option<usize>,
    /// Explicit tensor listing; synthesized from the sizes when absent.
    #[serde(default)]
    parameters: Option<Vec<ParameterEntry>>,
    #[serde(default)]
    auto_map: Option<Value>,
    #[serde(default)]
    supports_score_head: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ParameterEntry {
    name: String,
    numel: u64,
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfigFile {
    #[serde(default)]
    model_max_length: Option<f64>,
    #[serde(default)]
    tokenizer_class: Option<String>,
}

/// Loads pretrained models from local directories.
///
/// `ModelRef::Registry("org/name")` resolves to `<cache_root>/org/name`.
#[derive(Debug, Clone)]
pub struct LocalModelProvider {
    cache_root: PathBuf,
}

impl LocalModelProvider {
    #[must_use]
    pub fn new(cache_root: PathBuf) -> Self {
        Self { cache_root }
    }

    /// `$ALIGNER_MODEL_CACHE`, else `<user cache dir>/aligner`.
    #[must_use]
    pub fn from_env() -> Self {
        let root = std::env::var_os(MODEL_CACHE_ENV).map_or_else(
            || dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache")).join("aligner"),
            PathBuf::from,
        );
        Self::new(root)
    }

    #[must_use]
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn resolve(&self, reference: &ModelRef) -> TrainingResult<PathBuf> {
        let dir = match reference {
            ModelRef::Local(path) => path.clone(),
            ModelRef::Registry(id) => id.split('/').fold(self.cache_root.clone(), |dir, part| dir.join(part)),
        };
        if !dir.join(MODEL_CONFIG_FILE).is_file() {
            return Err(TrainingError::model_load(
                reference,
                format!("no {MODEL_CONFIG_FILE} in {}", dir.display()),
            ));
        }
        Ok(dir)
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, reference: &ModelRef) -> TrainingResult<T> {
    let bytes = std::fs::read(path)
        .map_err(|e| TrainingError::model_load(reference, format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TrainingError::model_load(reference, format!("failed to parse {}: {e}", path.display())))
}

fn synthesize_parameters(config: &ModelConfigFile) -> Vec<Parameter> {
    let hidden = config.hidden_size as u64;
    let layers = config.num_hidden_layers.unwrap_or(1);
    let mut params = Vec::new();

    if let Some(vision) = config.vision_hidden_size {
        let vision = vision as u64;
        params.push(Parameter::new("vision_tower.vision_model.embeddings.patch_embedding.weight", vision * 588));
        params.push(Parameter::new("vision_tower.vision_model.encoder.layers.0.mlp.fc1.weight", vision * vision * 4));
        params.push(Parameter::new("multi_modal_projector.linear_1.weight", vision * hidden));
        params.push(Parameter::new("multi_modal_projector.linear_2.weight", hidden * hidden));
    }

    params.push(Parameter::new("language_model.model.embed_tokens.weight", config.vocab_size as u64 * hidden));
    for layer in 0..layers {
        params.push(Parameter::new(
            format!("language_model.model.layers.{layer}.self_attn.qkv_proj.weight"),
            hidden * hidden * 3,
        ));
        params.push(Parameter::new(format!("language_model.model.layers.{layer}.mlp.weight"), hidden * hidden * 8));
    }
    params.push(Parameter::new("language_model.lm_head.weight", config.vocab_size as u64 * hidden));
    params
}

fn read_processor(
    dir: &Path,
    reference: &ModelRef,
    overrides: &Map<String, Value>,
) -> TrainingResult<Option<Processor>> {
    let path = dir.join(PREPROCESSOR_CONFIG_FILE);
    if !path.is_file() {
        return Ok(None);
    }

    let mut options: Map<String, Value> = read_json(&path, reference)?;
    for (key, value) in overrides {
        options.insert(key.clone(), value.clone());
    }

    let name = options
        .get("processor_class")
        .or_else(|| options.get("image_processor_type"))
        .and_then(Value::as_str)
        .unwrap_or("ImageProcessor")
        .to_string();
    let image_size = options
        .get("image_size")
        .or_else(|| options.get("crop_size"))
        .and_then(|v| v.as_u64().or_else(|| v.get("height").and_then(Value::as_u64)));

    Ok(Some(Processor { name, image_size, options }))
}

impl ModelProvider for LocalModelProvider {
    fn load_pretrained(&self, reference: &ModelRef, options: &PretrainedOptions) -> TrainingResult<Pretrained> {
        let dir = self.resolve(reference)?;
        let config: ModelConfigFile = read_json(&dir.join(MODEL_CONFIG_FILE), reference)?;

        if config.auto_map.is_some() && !options.trust_remote_code {
            return Err(TrainingError::model_load(
                reference,
                "model ships custom code; set model_cfgs.trust_remote_code to load it",
            ));
        }

        let tokenizer_path = dir.join(TOKENIZER_CONFIG_FILE);
        let tokenizer_config = if tokenizer_path.is_file() {
            read_json::<TokenizerConfigFile>(&tokenizer_path, reference)?
        } else {
            TokenizerConfigFile::default()
        };

        let model_type = config.model_type.clone().unwrap_or_default();
        let supports_score_head = config
            .supports_score_head
            .unwrap_or_else(|| !NO_SCORE_HEAD.contains(&model_type.as_str()));

        let parameters = match &config.parameters {
            Some(entries) => entries.iter().map(|e| Parameter::new(e.name.clone(), e.numel)).collect(),
            None => synthesize_parameters(&config),
        };

        let materialization = options.shape.as_ref().map_or(Materialization::Full, ShapeDeclaration::materialization);

        let model = PretrainedModel {
            architecture: config.architectures.first().cloned().unwrap_or_else(|| model_type.clone()),
            hidden_size: config.hidden_size,
            max_position_embeddings: config.max_position_embeddings,
            parameters,
            head: OutputHead::LanguageModeling { vocab_size: config.vocab_size },
            supports_score_head,
            materialization,
        };

        let model_max_length = tokenizer_config
            .model_max_length
            .filter(|n| n.is_finite() && *n >= 1.0 && *n < UNBOUNDED_MAX_LENGTH as f64)
            .map_or(UNBOUNDED_MAX_LENGTH, |n| n as usize);
        let tokenizer = Tokenizer {
            name: tokenizer_config.tokenizer_class.unwrap_or_else(|| "Tokenizer".to_string()),
            model_max_length,
            padding_side: options.padding_side,
            vocab_size: config.vocab_size,
        };

        let processor = read_processor(&dir, reference, &options.processor_options)?;

        debug!(
            model = %reference,
            path = %dir.display(),
            architecture = %model.architecture,
            materialization = ?model.materialization,
            processor = processor.is_some(),
            "loaded pretrained model"
        );

        Ok(Pretrained { model, tokenizer, processor })
    }
}

impl Default for LocalModelProvider {
    fn default() -> Self {
        Self::from_env()
    }
}
