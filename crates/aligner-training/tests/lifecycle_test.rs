use aligner_training::{
    BackendConfig, Batch, ConfigMerger, ConfigTree, CostModelTrainer, DataBundle, DataLoader, DatasetInitStrategy,
    DatasetKind, DatasetProvider, Device, Engine, ErrorKind, EvalOutput, FrozenConfig, InitContext, LaunchEnv,
    LifecycleState, LogProgressSink, Materialization, ModelBundle, ModelInitStrategy, ModelProvider, ModelRef, OptimizerConfig,
    OutputHead, Override, Parameter, ParameterGroup, PreferenceSample, Pretrained, PretrainedModel,
    PretrainedOptions, ProcessGroup, Processor, SplitSpec, StepOutput, Tokenizer, TrainerLifecycle, TrainingBackend,
    TrainingError, TrainingManifest, TrainingResult,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const DEFAULTS: &str = "
train_cfgs:
  seed: 42
  epochs: 1
  per_device_train_batch_size: 1
  per_device_eval_batch_size: 1
  eval_strategy: 'no'
  max_consecutive_failures: 3
  freeze_vision_tower: false
model_cfgs:
  model_name_or_path: org/stub-llava
  model_max_length: 512
data_cfgs:
  train_datasets: stub-train
  eval_datasets: null
logger_cfgs:
  output_dir: unset
  save_total_limit: null
";

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

type LossFn = Arc<dyn Fn(u64) -> f64 + Send + Sync>;

struct StubBackend {
    rec: Recorder,
    loss: LossFn,
    wrapped: Arc<Mutex<Option<(ModelBundle, OptimizerConfig)>>>,
}

impl StubBackend {
    fn new(rec: &Recorder) -> Self {
        Self { rec: rec.clone(), loss: Arc::new(|_| 0.5), wrapped: Arc::default() }
    }

    fn with_loss(mut self, loss: impl Fn(u64) -> f64 + Send + Sync + 'static) -> Self {
        self.loss = Arc::new(loss);
        self
    }
}

impl TrainingBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn manual_seed(&mut self, seed: u64) {
        self.rec.push(format!("seed:{seed}"));
    }

    fn init_distributed(&mut self, _env: &LaunchEnv) -> TrainingResult<()> {
        self.rec.push("init_distributed");
        Ok(())
    }

    fn accelerator_count(&self) -> usize {
        0
    }

    fn bind_device(&mut self, device: Device) -> TrainingResult<()> {
        self.rec.push(format!("bind:{device}"));
        Ok(())
    }

    fn wrap_for_distributed_training(
        &mut self,
        models: &ModelBundle,
        optimizer: &OptimizerConfig,
    ) -> TrainingResult<Box<dyn Engine>> {
        self.rec.push("wrap");
        *self.wrapped.lock().unwrap() = Some((models.clone(), optimizer.clone()));
        Ok(Box::new(StubEngine { rec: self.rec.clone(), loss: Arc::clone(&self.loss), calls: 0 }))
    }
}

struct StubEngine {
    rec: Recorder,
    loss: LossFn,
    calls: u64,
}

impl Engine for StubEngine {
    fn step(&mut self, _batch: &Batch) -> TrainingResult<StepOutput> {
        self.calls += 1;
        self.rec.push("step");
        Ok(StepOutput { loss: (self.loss)(self.calls), accuracy: None })
    }

    fn evaluate(&mut self, batch: &Batch) -> TrainingResult<EvalOutput> {
        self.rec.push("evaluate");
        Ok(EvalOutput::default().with_metric("eval_loss", batch.indices[0] as f64))
    }

    fn flush(&mut self) -> TrainingResult<()> {
        self.rec.push("flush");
        Ok(())
    }

    fn save(&mut self, dir: &Path) -> TrainingResult<()> {
        std::fs::create_dir_all(dir)?;
        std::fs::write(dir.join("engine_state.json"), b"{}")?;
        self.rec.push("save");
        Ok(())
    }
}

fn model_bundle() -> ModelBundle {
    let pretrained = stub_pretrained(&PretrainedOptions::default());
    ModelBundle {
        model: Arc::new(pretrained.model),
        tokenizer: Arc::new(pretrained.tokenizer),
        processor: None,
    }
}

fn stub_pretrained(options: &PretrainedOptions) -> Pretrained {
    Pretrained {
        model: PretrainedModel {
            architecture: "LlavaForConditionalGeneration".to_string(),
            hidden_size: 8,
            max_position_embeddings: 4096,
            parameters: vec![
                Parameter::new("vision_tower.vision_model.encoder.layers.0.weight", 10),
                Parameter::new("vision_tower.vision_model.post_layernorm.weight", 2),
                Parameter::new("multi_modal_projector.linear_1.weight", 6),
                Parameter::new("language_model.model.layers.0.self_attn.q_proj.weight", 20),
                Parameter::new("language_model.lm_head.weight", 40),
            ],
            head: OutputHead::LanguageModeling { vocab_size: 64 },
            supports_score_head: true,
            materialization: options.shape.as_ref().map_or(Materialization::Full, |s| s.materialization()),
        },
        tokenizer: Tokenizer {
            name: "stub".to_string(),
            model_max_length: 2048,
            padding_side: options.padding_side,
            vocab_size: 64,
        },
        processor: Some(Processor { name: "stub".to_string(), image_size: Some(336), options: options.processor_options.clone() }),
    }
}

fn samples(n: usize) -> Vec<PreferenceSample> {
    (0..n)
        .map(|i| PreferenceSample {
            better_input_ids: vec![i as u32],
            worse_input_ids: vec![i as u32 + 1],
            better_safe: Some(true),
            worse_safe: Some(false),
            image: None,
        })
        .collect()
}

/// Both strategies, recording when they run.
struct StubStrategy {
    rec: Recorder,
    train: usize,
    eval: usize,
    fail_models: bool,
}

impl StubStrategy {
    fn new(rec: &Recorder, train: usize) -> Arc<Self> {
        Arc::new(Self { rec: rec.clone(), train, eval: 0, fail_models: false })
    }
}

impl ModelInitStrategy for StubStrategy {
    fn init_models(&self, _ctx: &InitContext<'_>) -> TrainingResult<ModelBundle> {
        self.rec.push("init_models");
        if self.fail_models {
            return Err(TrainingError::model_load("org/missing", "not found"));
        }
        Ok(model_bundle())
    }
}

impl DatasetInitStrategy for StubStrategy {
    fn init_datasets(&self, ctx: &InitContext<'_>, _models: &ModelBundle) -> TrainingResult<DataBundle> {
        self.rec.push("init_datasets");
        let shard = ctx.distributed.shard();
        let train = DataLoader::new(samples(self.train), ctx.settings.per_device_train_batch_size, true, ctx.settings.seed, shard)?;
        let eval = if self.eval == 0 {
            DataLoader::empty()
        } else {
            DataLoader::new(samples(self.eval), 1, false, ctx.settings.seed, shard)?
        };
        Ok(DataBundle { train, eval })
    }
}

fn config(out: &Path, overrides: &[(&str, &str)]) -> TrainingResult<FrozenConfig> {
    let merger = ConfigMerger::new(ConfigTree::from_yaml_str(DEFAULTS, "defaults.yaml")?);
    let mut all = vec![Override::new("logger_cfgs.output_dir", out.display().to_string())];
    all.extend(overrides.iter().map(|(k, v)| Override::new(*k, *v)));
    merger.merge_frozen(&all)
}

fn lifecycle(
    config: FrozenConfig,
    strategy: Arc<StubStrategy>,
    backend: StubBackend,
) -> TrainingResult<TrainerLifecycle> {
    Ok(TrainerLifecycle::new(config, strategy.clone(), strategy, Box::new(backend))?
        .with_process_group(Arc::new(ProcessGroup::new())))
}

#[test]
fn test_end_to_end_four_batches() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let mut trainer =
        lifecycle(config(temp.path(), &[]).unwrap(), StubStrategy::new(&rec, 4), StubBackend::new(&rec)).unwrap();

    let summary = trainer.run().unwrap();

    assert_eq!(summary.state, LifecycleState::Done);
    assert_eq!(trainer.state(), LifecycleState::Done);
    assert_eq!(rec.count("step"), 4);
    assert_eq!(rec.count("save"), 1);
    assert_eq!(summary.metrics.steps, 4);
    assert_eq!(summary.metrics.skipped_steps, 0);
    assert_eq!(summary.final_checkpoint, temp.path().join("slice_end"));
    assert!(summary.checkpoints.is_empty());

    let manifest = TrainingManifest::read(&summary.manifest.unwrap()).unwrap();
    assert_eq!(manifest.model.as_deref(), Some("org/stub-llava"));
    assert_eq!(manifest.metrics.steps, 4);
    assert_eq!(manifest.artifacts.len(), 1);
}

#[test]
fn test_call_order() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let mut trainer =
        lifecycle(config(temp.path(), &[]).unwrap(), StubStrategy::new(&rec, 2), StubBackend::new(&rec)).unwrap();
    trainer.run().unwrap();

    let order: Vec<usize> = ["seed:42", "init_distributed", "bind:cpu", "init_models", "init_datasets", "wrap", "step", "flush", "save"]
        .iter()
        .map(|e| rec.position(e).unwrap_or_else(|| panic!("{e} never happened")))
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{:?}", rec.events());
}

#[test]
fn test_infer_batch_needs_a_finished_run() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let mut trainer =
        lifecycle(config(temp.path(), &[]).unwrap(), StubStrategy::new(&rec, 2), StubBackend::new(&rec)).unwrap();
    let batch = Batch { indices: vec![0], samples: samples(1) };

    assert!(matches!(trainer.infer_batch(&batch), Err(TrainingError::Lifecycle { .. })));

    trainer.run().unwrap();
    assert_eq!(rec.count("flush"), 1);
    // the stub engine has no inference path
    assert_eq!(trainer.infer_batch(&batch).unwrap(), None);
}

#[test]
fn test_non_numeric_seed_override_fails_before_distributed_init() {
    let temp = TempDir::new().unwrap();
    let err = config(temp.path(), &[("train_cfgs.seed", "abc")]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("train_cfgs.seed"));
}

#[test]
fn test_schema_less_seed_fails_at_construction() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let mut tree = config(temp.path(), &[]).unwrap().thaw();
    tree.set(&"train_cfgs.seed".parse().unwrap(), "abc".into()).unwrap();

    let err = lifecycle(tree.freeze(), StubStrategy::new(&rec, 4), StubBackend::new(&rec)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(rec.events().is_empty());
}

#[test]
fn test_non_finite_loss_is_skipped() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let backend = StubBackend::new(&rec).with_loss(|call| if call == 2 { f64::NAN } else { 0.25 });
    let mut trainer = lifecycle(config(temp.path(), &[]).unwrap(), StubStrategy::new(&rec, 4), backend).unwrap();

    let summary = trainer.run().unwrap();
    assert_eq!(rec.count("step"), 4);
    assert_eq!(summary.metrics.skipped_steps, 1);
    assert_eq!(summary.metrics.train_loss, Some(0.25));
}

#[test]
fn test_consecutive_failures_abort() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let backend = StubBackend::new(&rec).with_loss(|_| f64::INFINITY);
    let cfg = config(temp.path(), &[("train_cfgs.max_consecutive_failures", "2")]).unwrap();
    let mut trainer = lifecycle(cfg, StubStrategy::new(&rec, 8), backend).unwrap();

    let err = trainer.run().unwrap_err();
    assert!(matches!(err, TrainingError::TrainingStep { step: 3, .. }), "{err}");
    assert_eq!(trainer.state(), LifecycleState::Failed);
    assert_eq!(rec.count("step"), 3);
    assert_eq!(rec.count("save"), 0);
}

#[test]
fn test_model_failure_stops_before_datasets() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let group = Arc::new(ProcessGroup::new());
    let strategy = Arc::new(StubStrategy { rec: rec.clone(), train: 4, eval: 0, fail_models: true });
    let mut trainer = TrainerLifecycle::new(
        config(temp.path(), &[]).unwrap(),
        strategy.clone(),
        strategy,
        Box::new(StubBackend::new(&rec)),
    )
    .unwrap()
    .with_process_group(Arc::clone(&group));

    let err = trainer.run().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ModelLoad);
    assert_eq!(trainer.state(), LifecycleState::Failed);
    assert_eq!(rec.position("init_datasets"), None);
    assert!(!group.is_formed());
    assert!(group.is_torn_down());

    // a finished lifecycle cannot be re-run
    assert!(matches!(trainer.run(), Err(TrainingError::Lifecycle { .. })));
}

#[test]
fn test_default_progress_sink_quiets_non_main_rank() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let sink = Arc::new(LogProgressSink::default());
    let launch = LaunchEnv { rank: 1, world_size: 2, local_rank: 0, master_addr: None, master_port: None };
    let mut trainer = lifecycle(config(temp.path(), &[]).unwrap(), StubStrategy::new(&rec, 4), StubBackend::new(&rec))
        .unwrap()
        .with_progress(sink.clone())
        .with_launch_env(launch);

    let summary = trainer.run().unwrap();
    assert!(sink.is_quiet());
    assert_eq!(summary.metrics.steps, 2);
    assert!(summary.manifest.is_none());
}

#[test]
fn test_periodic_saves_are_pruned() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let cfg = config(temp.path(), &[("train_cfgs.save_interval", "1"), ("logger_cfgs.save_total_limit", "2")]).unwrap();
    let mut trainer = lifecycle(cfg, StubStrategy::new(&rec, 4), StubBackend::new(&rec)).unwrap();

    let summary = trainer.run().unwrap();
    assert_eq!(rec.count("save"), 5);
    assert_eq!(summary.checkpoints, vec![temp.path().join("slice_3"), temp.path().join("slice_4")]);
}

#[test]
fn test_step_cadence_evaluation_averages_metrics() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let strategy = Arc::new(StubStrategy { rec: rec.clone(), train: 4, eval: 2, fail_models: false });
    let cfg = config(temp.path(), &[("train_cfgs.eval_strategy", "steps"), ("train_cfgs.eval_interval", "2")]).unwrap();
    let mut trainer = lifecycle(cfg, strategy, StubBackend::new(&rec)).unwrap();

    let summary = trainer.run().unwrap();
    assert_eq!(rec.count("evaluate"), 4);
    assert_eq!(summary.metrics.eval.get("eval_loss"), Some(&0.5));
}

#[test]
fn test_max_steps_caps_the_loop() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let cfg = config(temp.path(), &[("train_cfgs.epochs", "3"), ("train_cfgs.max_steps", "5")]).unwrap();
    let backend = StubBackend::new(&rec);
    let wrapped = Arc::clone(&backend.wrapped);
    let mut trainer = lifecycle(cfg, StubStrategy::new(&rec, 4), backend).unwrap();

    let summary = trainer.run().unwrap();
    assert_eq!(rec.count("step"), 5);
    assert_eq!(summary.metrics.steps, 5);
    assert_eq!(summary.metrics.epochs, 2);
    assert_eq!(wrapped.lock().unwrap().as_ref().unwrap().1.total_steps, 5);
}

#[test]
fn test_max_steps_on_epoch_boundary_counts_only_entered_epochs() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let cfg = config(temp.path(), &[("train_cfgs.epochs", "3"), ("train_cfgs.max_steps", "4")]).unwrap();
    let mut trainer = lifecycle(cfg, StubStrategy::new(&rec, 4), StubBackend::new(&rec)).unwrap();

    let summary = trainer.run().unwrap();
    assert_eq!(summary.metrics.steps, 4);
    assert_eq!(summary.metrics.epochs, 1);
}

#[test]
fn test_save_interval_counts_skipped_steps() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let backend = StubBackend::new(&rec).with_loss(|call| if call == 2 { f64::INFINITY } else { 0.25 });
    let cfg = config(
        temp.path(),
        &[
            ("train_cfgs.save_interval", "2"),
            ("train_cfgs.gradient_accumulation_steps", "4"),
            ("logger_cfgs.save_total_limit", "5"),
        ],
    )
    .unwrap();
    let mut trainer = lifecycle(cfg, StubStrategy::new(&rec, 4), backend).unwrap();

    let summary = trainer.run().unwrap();
    assert_eq!(summary.metrics.skipped_steps, 1);
    assert_eq!(summary.checkpoints, vec![temp.path().join("slice_2"), temp.path().join("slice_4")]);
}

struct StubModelProvider {
    saw_shape: Mutex<Vec<bool>>,
}

impl ModelProvider for StubModelProvider {
    fn load_pretrained(&self, reference: &ModelRef, options: &PretrainedOptions) -> TrainingResult<Pretrained> {
        assert_eq!(reference, &ModelRef::Registry("org/stub-llava".to_string()));
        self.saw_shape.lock().unwrap().push(options.shape.is_some());
        Ok(stub_pretrained(options))
    }
}

struct StubDatasetProvider;

impl DatasetProvider for StubDatasetProvider {
    fn load_split(
        &self,
        kind: DatasetKind,
        split: &SplitSpec,
        tokenizer: &Tokenizer,
        processor: Option<&Processor>,
    ) -> TrainingResult<Vec<PreferenceSample>> {
        assert_eq!(kind, DatasetKind::SafetyPreference);
        assert_eq!(split.path, "stub-train");
        assert_eq!(tokenizer.model_max_length, 512);
        assert!(processor.is_some());
        Ok(samples(4))
    }
}

#[test]
fn test_cost_model_trainer_end_to_end() {
    let temp = TempDir::new().unwrap();
    let rec = Recorder::default();
    let provider = Arc::new(StubModelProvider { saw_shape: Mutex::new(Vec::new()) });
    let backend = StubBackend::new(&rec);
    let wrapped = Arc::clone(&backend.wrapped);
    let cfg = config(temp.path(), &[("train_cfgs.freeze_vision_tower", "true")]).unwrap();
    let stage3 = BackendConfig::from_value(serde_json::json!({"zero_optimization": {"stage": 3}})).unwrap();

    let mut trainer = CostModelTrainer::new(provider.clone(), Arc::new(StubDatasetProvider))
        .into_lifecycle(cfg, Box::new(backend))
        .unwrap()
        .with_backend_config(Some(stage3))
        .with_process_group(Arc::new(ProcessGroup::new()));

    let summary = trainer.run().unwrap();
    assert_eq!(summary.metrics.steps, 4);
    assert_eq!(rec.count("save"), 1);
    assert_eq!(*provider.saw_shape.lock().unwrap(), vec![true]);

    let guard = wrapped.lock().unwrap();
    let (models, optimizer) = guard.as_ref().unwrap();
    assert_eq!(models.tokenizer.model_max_length, 512);
    assert_eq!(models.model.head, OutputHead::Score { dim: 1 });
    assert_eq!(models.model.materialization, Materialization::Partitioned { world_size: 1 });
    for param in &models.model.parameters {
        assert_eq!(param.trainable, param.group != ParameterGroup::VisionTower, "{}", param.name);
    }
    assert!(optimizer.backend.as_ref().unwrap().get("train_batch_size").is_some());

    let manifest = TrainingManifest::read(&summary.manifest.unwrap()).unwrap();
    assert_eq!(manifest.task, "text_image_to_text/cost_model");
}
