use crate::error::{TrainingError, TrainingResult};
use serde_json::{json, Map, Value};
use std::path::Path;

/// Backend optimization document (ZeRO stage, micro batch sizes, precision).
///
/// The document is owned by the training backend; the bootstrap only reads
/// the partitioning stage and stamps the batch/precision keys it derives
/// from the training configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendConfig {
    document: Map<String, Value>,
}

/// Keys derived from `train_cfgs` that must agree with the backend document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackendStamp {
    pub micro_batch_size: usize,
    pub gradient_accumulation_steps: u64,
    pub world_size: usize,
    pub bf16: bool,
    pub fp16: bool,
}

impl BackendConfig {
    pub fn from_value(value: Value) -> TrainingResult<Self> {
        match value {
            Value::Object(document) => Ok(Self { document }),
            other => Err(TrainingError::config(
                "train_cfgs.ds_cfgs",
                format!("backend document must be a JSON object, found {other}"),
            )),
        }
    }

    pub fn from_path(path: &Path) -> TrainingResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            TrainingError::config("train_cfgs.ds_cfgs", format!("failed to read {}: {e}", path.display()))
        })?;
        let value: Value = serde_json::from_slice(&bytes).map_err(|e| {
            TrainingError::config("train_cfgs.ds_cfgs", format!("failed to parse {}: {e}", path.display()))
        })?;
        Self::from_value(value)
    }

    #[must_use]
    pub fn zero_stage(&self) -> Option<u64> {
        self.document.get("zero_optimization")?.get("stage")?.as_u64()
    }

    /// Stage 3 partitions parameters at construction time, so the deployment
    /// shape must be declared before the model is loaded.
    #[must_use]
    pub fn requires_shape_declaration(&self) -> bool {
        self.zero_stage() == Some(3)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.document.get(key)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Object(self.document.clone())
    }

    /// A copy with the batch and precision keys set from the training config.
    #[must_use]
    pub fn stamped(&self, stamp: &BackendStamp) -> Self {
        let mut document = self.document.clone();
        let global = stamp.micro_batch_size as u64 * stamp.gradient_accumulation_steps * stamp.world_size as u64;

        document.insert("train_micro_batch_size_per_gpu".to_string(), json!(stamp.micro_batch_size));
        document.insert("gradient_accumulation_steps".to_string(), json!(stamp.gradient_accumulation_steps));
        document.insert("train_batch_size".to_string(), json!(global));
        set_enabled(&mut document, "bf16", stamp.bf16);
        set_enabled(&mut document, "fp16", stamp.fp16);

        Self { document }
    }
}

fn set_enabled(document: &mut Map<String, Value>, key: &str, enabled: bool) {
    match document.get_mut(key) {
        Some(Value::Object(section)) => {
            section.insert("enabled".to_string(), Value::Bool(enabled));
        }
        _ => {
            document.insert(key.to_string(), json!({ "enabled": enabled }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_stage_three_requires_shape_declaration() {
        let cfg = BackendConfig::from_value(json!({"zero_optimization": {"stage": 3}})).unwrap();
        assert_eq!(cfg.zero_stage(), Some(3));
        assert!(cfg.requires_shape_declaration());

        let cfg = BackendConfig::from_value(json!({"zero_optimization": {"stage": 2}})).unwrap();
        assert!(!cfg.requires_shape_declaration());

        let cfg = BackendConfig::from_value(json!({})).unwrap();
        assert_eq!(cfg.zero_stage(), None);
    }

    #[test]
    fn test_non_object_document_is_rejected() {
        assert!(BackendConfig::from_value(json!([1, 2])).is_err());
    }

    #[test]
    fn test_stamped_sets_batch_and_precision_keys() {
        let cfg = BackendConfig::from_value(json!({"bf16": {"enabled": false, "loss_scale": 0}})).unwrap();
        let stamped = cfg.stamped(&BackendStamp {
            micro_batch_size: 4,
            gradient_accumulation_steps: 2,
            world_size: 8,
            bf16: true,
            fp16: false,
        });

        assert_eq!(stamped.get("train_micro_batch_size_per_gpu"), Some(&json!(4)));
        assert_eq!(stamped.get("train_batch_size"), Some(&json!(64)));
        assert_eq!(stamped.get("bf16"), Some(&json!({"enabled": true, "loss_scale": 0})));
        assert_eq!(stamped.get("fp16"), Some(&json!({"enabled": false})));
        // the source document is untouched
        assert_eq!(cfg.get("train_batch_size"), None);
    }
}
