use crate::config::FrozenConfig;
use crate::distributed::ShardSpec;
use crate::error::{TrainingError, TrainingResult};
use crate::model::{Processor, Tokenizer};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Preference pairs that also carry a safe/unsafe label per response.
    SafetyPreference,
    Preference,
}

impl DatasetKind {
    #[must_use]
    pub fn requires_safety_labels(self) -> bool {
        matches!(self, Self::SafetyPreference)
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SafetyPreference => f.write_str("safety_preference"),
            Self::Preference => f.write_str("preference"),
        }
    }
}

/// Split read from a dataset directory when `train_split` is unset.
pub const DEFAULT_TRAIN_SPLIT: &str = "train";
/// Split read from a dataset directory when `eval_split` is unset.
pub const DEFAULT_EVAL_SPLIT: &str = "test";

/// One configured split (`data_cfgs.train_*` or `data_cfgs.eval_*`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitSpec {
    pub path: String,
    pub template: Option<String>,
    pub subset: Option<String>,
    pub split: Option<String>,
    pub size: Option<usize>,
    pub data_files: Option<String>,
}

impl SplitSpec {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Reads `<prefix>_datasets`, `<prefix>_template` and friends from the
    /// `data_cfgs` section. `None` when `<prefix>_datasets` is absent or empty.
    /// An unset `<prefix>_split` falls back to `default_split`.
    fn from_section(data: &FrozenConfig, prefix: &str, default_split: &str) -> TrainingResult<Option<Self>> {
        let key = |name: &str| format!("{prefix}_{name}");

        let Some(path) = data.opt_str(&key("datasets"))?.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(None);
        };

        let size = match data.opt_u64(&key("size"))? {
            Some(n) => Some(usize::try_from(n).map_err(|_| {
                TrainingError::config(data.path().join(&key("size")), format!("{n} does not fit the platform size"))
            })?),
            None => None,
        };

        Ok(Some(Self {
            path: path.to_string(),
            template: data.opt_str(&key("template"))?.map(str::to_string),
            subset: data.opt_str(&key("subset"))?.map(str::to_string),
            split: Some(data.opt_str(&key("split"))?.unwrap_or(default_split).to_string()),
            size,
            data_files: data.opt_str(&key("data_files"))?.map(str::to_string),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitConfig {
    pub train: SplitSpec,
    pub eval: Option<SplitSpec>,
}

impl SplitConfig {
    /// Builds the split configuration from the `data_cfgs` section.
    pub fn from_config(data: &FrozenConfig) -> TrainingResult<Self> {
        let train = SplitSpec::from_section(data, "train", DEFAULT_TRAIN_SPLIT)?
            .ok_or_else(|| TrainingError::DataInit(format!("{} is not set", data.path().join("train_datasets"))))?;
        let eval = SplitSpec::from_section(data, "eval", DEFAULT_EVAL_SPLIT)?;
        Ok(Self { train, eval })
    }
}

/// A tokenized preference pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceSample {
    pub better_input_ids: Vec<u32>,
    pub worse_input_ids: Vec<u32>,
    #[serde(default)]
    pub better_safe: Option<bool>,
    #[serde(default)]
    pub worse_safe: Option<bool>,
    #[serde(default)]
    pub image: Option<String>,
}

/// Reads and tokenizes a split. Tokenization and collation belong to the
/// provider.
pub trait DatasetProvider: Send + Sync {
    fn load_split(
        &self,
        kind: DatasetKind,
        split: &SplitSpec,
        tokenizer: &Tokenizer,
        processor: Option<&Processor>,
    ) -> TrainingResult<Vec<PreferenceSample>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Positions of the samples in the full split.
    pub indices: Vec<usize>,
    pub samples: Vec<PreferenceSample>,
}

impl Batch {
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Rank-sharded, batched view over a split.
///
/// Every rank draws the same per-epoch permutation (seeded with
/// `seed + epoch`) and takes every `world_size`-th index starting at its
/// rank, truncated so all ranks get the same number of samples.
#[derive(Debug, Clone)]
pub struct DataLoader {
    samples: Arc<Vec<PreferenceSample>>,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    shard: ShardSpec,
}

impl DataLoader {
    pub fn new(
        samples: Vec<PreferenceSample>,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        shard: ShardSpec,
    ) -> TrainingResult<Self> {
        if batch_size == 0 {
            return Err(TrainingError::DataInit("batch size must be positive".to_string()));
        }
        if shard.world_size == 0 || shard.rank >= shard.world_size {
            return Err(TrainingError::DataInit(format!(
                "invalid shard: rank {} of world size {}",
                shard.rank, shard.world_size
            )));
        }
        Ok(Self { samples: Arc::new(samples), batch_size, shuffle, seed, shard })
    }

    /// A loader that yields nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self { samples: Arc::new(Vec::new()), batch_size: 1, shuffle: false, seed: 0, shard: ShardSpec::single() }
    }

    #[must_use]
    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Samples this rank sees per epoch.
    #[must_use]
    pub fn shard_len(&self) -> usize {
        self.samples.len() / self.shard.world_size
    }

    /// Batches per epoch on this rank.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shard_len().div_ceil(self.batch_size)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Lazily yields this rank's batches for `epoch`.
    #[must_use]
    pub fn epoch(&self, epoch: u64) -> Batches<'_> {
        Batches { loader: self, order: self.shard_indices(epoch), cursor: 0 }
    }

    fn shard_indices(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch));
            order.shuffle(&mut rng);
        }
        order
            .into_iter()
            .skip(self.shard.rank)
            .step_by(self.shard.world_size)
            .take(self.shard_len())
            .collect()
    }
}

pub struct Batches<'a> {
    loader: &'a DataLoader,
    order: Vec<usize>,
    cursor: usize,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.batch_size).min(self.order.len());
        let indices = self.order[self.cursor..end].to_vec();
        self.cursor = end;

        let samples = indices.iter().map(|&i| self.loader.samples[i].clone()).collect();
        Some(Batch { indices, samples })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.cursor).div_ceil(self.loader.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}

#[derive(Debug, Clone)]
pub struct DataBundle {
    pub train: DataLoader,
    pub eval: DataLoader,
}

pub struct DatasetInitializer {
    provider: Arc<dyn DatasetProvider>,
    shard: ShardSpec,
    seed: u64,
    train_batch_size: usize,
    eval_batch_size: usize,
}

impl DatasetInitializer {
    pub fn new(provider: Arc<dyn DatasetProvider>, shard: ShardSpec, seed: u64) -> Self {
        Self { provider, shard, seed, train_batch_size: 1, eval_batch_size: 1 }
    }

    #[must_use]
    pub fn with_batch_sizes(mut self, train: usize, eval: usize) -> Self {
        self.train_batch_size = train;
        self.eval_batch_size = eval;
        self
    }

    pub fn build(
        &self,
        kind: DatasetKind,
        splits: &SplitConfig,
        tokenizer: &Tokenizer,
        processor: Option<&Processor>,
    ) -> TrainingResult<DataBundle> {
        let train_samples = self.load(kind, &splits.train, tokenizer, processor)?;
        if train_samples.is_empty() {
            return Err(TrainingError::DataInit(format!("train split `{}` is empty", splits.train.path)));
        }
        let total = train_samples.len();
        let train = DataLoader::new(train_samples, self.train_batch_size, true, self.seed, self.shard)?;
        if train.is_empty() {
            return Err(TrainingError::DataInit(format!(
                "train split `{}` has {total} sample(s), fewer than the world size {}",
                splits.train.path, self.shard.world_size
            )));
        }

        let eval = match &splits.eval {
            Some(spec) => {
                let samples = self.load(kind, spec, tokenizer, processor)?;
                DataLoader::new(samples, self.eval_batch_size, false, self.seed, self.shard)?
            }
            None => DataLoader::empty(),
        };

        info!(
            kind = %kind,
            rank = self.shard.rank,
            train_samples = train.shard_len(),
            train_batches = train.len(),
            eval_batches = eval.len(),
            "datasets initialized"
        );

        Ok(DataBundle { train, eval })
    }

    fn load(
        &self,
        kind: DatasetKind,
        spec: &SplitSpec,
        tokenizer: &Tokenizer,
        processor: Option<&Processor>,
    ) -> TrainingResult<Vec<PreferenceSample>> {
        let samples = self.provider.load_split(kind, spec, tokenizer, processor).map_err(|e| match e {
            TrainingError::DataInit(_) => e,
            other => TrainingError::DataInit(format!("failed to load `{}`: {other}", spec.path)),
        })?;

        if kind.requires_safety_labels() {
            if let Some(idx) = samples.iter().position(|s| s.better_safe.is_none() || s.worse_safe.is_none()) {
                return Err(TrainingError::DataInit(format!(
                    "sample {idx} of `{}` has no safety labels",
                    spec.path
                )));
            }
        }

        Ok(samples)
    }
}
