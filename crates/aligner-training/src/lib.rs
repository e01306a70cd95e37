//! Aligner Training
//!
//! Backend-agnostic bootstrap for distributed preference-model training:
//! - Layered configuration (`ConfigMerger`, `FrozenConfig`)
//! - Process group formation and device binding (`DistributedContext`)
//! - Model and dataset initialization (`ModelInitializer`, `DatasetInitializer`)
//! - The trainer lifecycle with injected init strategies (`TrainerLifecycle`)
//! - Checkpoint layout and training manifests

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod cost_model;
pub mod dataset;
pub mod distributed;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod model;
pub mod progress;
pub mod settings;

pub use artifacts::{ArtifactKind, RunId, TrainingArtifact, TrainingManifest, TrainingMetrics};
pub use backend::{Engine, EvalOutput, InferOutput, OptimizerConfig, StepOutput, TrainingBackend};
pub use config::{
    parse_overrides, read_defaults, BackendConfig, ConfigMerger, ConfigPath, ConfigTree, ConfigValue, FrozenConfig,
    Override, UnknownKeyPolicy,
};
pub use cost_model::CostModelTrainer;
pub use dataset::{
    Batch, DataBundle, DataLoader, DatasetInitializer, DatasetKind, DatasetProvider, PreferenceSample, SplitConfig,
    SplitSpec, DEFAULT_EVAL_SPLIT, DEFAULT_TRAIN_SPLIT,
};
pub use distributed::{Device, DistributedContext, LaunchEnv, ProcessGroup, ShardSpec};
pub use error::{ErrorKind, TrainingError, TrainingResult};
pub use layout::OutputLayout;
pub use lifecycle::{DatasetInitStrategy, InitContext, LifecycleState, ModelInitStrategy, RunSummary, TrainerLifecycle};
pub use model::{
    FreezingPolicy, LoadRequest, Materialization, ModelBundle, ModelInitializer, ModelProvider, ModelRef, OutputHead,
    PaddingSide, Parameter, ParameterGroup, Pretrained, PretrainedModel, PretrainedOptions, Processor,
    ShapeDeclaration, Tokenizer,
};
pub use progress::{LogProgressSink, ProgressEvent, ProgressSink};
pub use settings::{EvalStrategy, TrainSettings};
