use aligner_training::{
    DatasetKind, DatasetProvider, PreferenceSample, Processor, SplitSpec, Tokenizer, TrainingError, TrainingResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// One line of a preference JSONL file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    pub prompt: String,
    #[serde(default)]
    pub image: Option<String>,
    pub better_response: String,
    pub worse_response: String,
    #[serde(default)]
    pub is_better_safe: Option<bool>,
    #[serde(default)]
    pub is_worse_safe: Option<bool>,
}

/// How prompt and response are joined before tokenization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptTemplate {
    #[default]
    Plain,
    Chat,
}

impl PromptTemplate {
    #[must_use]
    pub fn render(self, prompt: &str, response: &str, has_image: bool) -> String {
        match self {
            Self::Plain => format!("{prompt} {response}"),
            Self::Chat if has_image => format!("USER: <image> {prompt} ASSISTANT: {response}"),
            Self::Chat => format!("USER: {prompt} ASSISTANT: {response}"),
        }
    }
}

impl FromStr for PromptTemplate {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" => Ok(Self::Plain),
            "chat" => Ok(Self::Chat),
            other => Err(TrainingError::DataInit(format!("unknown template `{other}` (expected plain|chat)"))),
        }
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plain => f.write_str("plain"),
            Self::Chat => f.write_str("chat"),
        }
    }
}

/// Reads preference pairs from JSONL files.
///
/// `SplitSpec::path` is either the file itself or a directory holding
/// `data_files`, or `<subset>/<split>.jsonl` when `data_files` is unset.
#[derive(Debug, Clone, Default)]
pub struct JsonlPreferenceProvider {
    base_dir: Option<PathBuf>,
}

impl JsonlPreferenceProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Relative dataset paths resolve against `dir`.
    #[must_use]
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn resolve(&self, split: &SplitSpec) -> TrainingResult<PathBuf> {
        let mut root = PathBuf::from(&split.path);
        if root.is_relative() {
            if let Some(base) = &self.base_dir {
                root = base.join(root);
            }
        }

        let file = if root.is_dir() {
            match &split.data_files {
                Some(files) => root.join(files),
                None => {
                    let Some(name) = split.split.as_deref() else {
                        return Err(TrainingError::DataInit(format!(
                            "{} is a directory but neither a split nor data files were given",
                            root.display()
                        )));
                    };
                    let dir = split.subset.as_ref().map_or_else(|| root.clone(), |subset| root.join(subset));
                    dir.join(format!("{name}.jsonl"))
                }
            }
        } else {
            root
        };

        if !file.is_file() {
            return Err(TrainingError::DataInit(format!("dataset file {} does not exist", file.display())));
        }
        Ok(file)
    }

    pub fn read_records(&self, split: &SplitSpec) -> TrainingResult<Vec<PreferenceRecord>> {
        let path = self.resolve(split)?;
        let file = std::fs::File::open(&path)
            .map_err(|e| TrainingError::DataInit(format!("failed to open {}: {e}", path.display())))?;

        let limit = split.size.unwrap_or(usize::MAX);
        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            if records.len() >= limit {
                break;
            }
            let line = line.map_err(|e| TrainingError::DataInit(format!("{}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line)
                .map_err(|e| TrainingError::DataInit(format!("{}:{}: {e}", path.display(), index + 1)))?;
            records.push(record);
        }

        debug!(path = %path.display(), records = records.len(), "read preference records");
        Ok(records)
    }
}

fn resolve_image(image: &str, dataset: &Path) -> String {
    let path = Path::new(image);
    if path.is_absolute() {
        return image.to_string();
    }
    dataset.parent().map_or_else(|| image.to_string(), |dir| dir.join(path).display().to_string())
}

impl DatasetProvider for JsonlPreferenceProvider {
    fn load_split(
        &self,
        kind: DatasetKind,
        split: &SplitSpec,
        tokenizer: &Tokenizer,
        processor: Option<&Processor>,
    ) -> TrainingResult<Vec<PreferenceSample>> {
        let template: PromptTemplate = split.template.as_deref().map(str::parse).transpose()?.unwrap_or_default();
        let dataset = self.resolve(split)?;
        let records = self.read_records(split)?;

        let mut dropped_images = 0usize;
        let samples = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                if kind.requires_safety_labels() && (record.is_better_safe.is_none() || record.is_worse_safe.is_none())
                {
                    return Err(TrainingError::DataInit(format!(
                        "{}: record {} is missing is_better_safe/is_worse_safe",
                        dataset.display(),
                        index + 1
                    )));
                }

                let image = match (record.image.as_deref(), processor) {
                    (Some(image), Some(_)) => Some(resolve_image(image, &dataset)),
                    (Some(_), None) => {
                        dropped_images += 1;
                        None
                    }
                    (None, _) => None,
                };
                let has_image = image.is_some();

                Ok(PreferenceSample {
                    better_input_ids: tokenizer.encode(&template.render(&record.prompt, &record.better_response, has_image)),
                    worse_input_ids: tokenizer.encode(&template.render(&record.prompt, &record.worse_response, has_image)),
                    better_safe: record.is_better_safe,
                    worse_safe: record.is_worse_safe,
                    image,
                })
            })
            .collect::<TrainingResult<Vec<_>>>()?;

        if dropped_images > 0 {
            warn!(count = dropped_images, "model has no processor; images ignored");
        }
        Ok(samples)
    }
}
