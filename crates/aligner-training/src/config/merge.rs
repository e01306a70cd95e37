use crate::config::frozen::FrozenConfig;
use crate::config::value::{parse_bool, parse_float, parse_int, ConfigPath, ConfigTree, ConfigValue, ValueKind};
use crate::error::{TrainingError, TrainingResult};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A single `--dotted.key value` pair taken from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pub key: String,
    pub raw: String,
}

impl Override {
    pub fn new(key: impl Into<String>, raw: impl Into<String>) -> Self {
        Self { key: key.into(), raw: raw.into() }
    }
}

/// Pairs each `--flag` with the token that follows it (or the text after `=`),
/// preserving command-line order.
pub fn parse_overrides<I, S>(args: I) -> TrainingResult<Vec<Override>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut overrides = Vec::new();
    let mut tokens = args.into_iter();

    while let Some(token) = tokens.next() {
        let token = token.as_ref();
        let Some(flag) = token.strip_prefix("--") else {
            return Err(TrainingError::config(
                token,
                "expected a `--<dotted.key>` flag before each override value",
            ));
        };

        let (key, raw) = match flag.split_once('=') {
            Some((key, raw)) => (key.to_string(), raw.to_string()),
            None => {
                let raw = tokens
                    .next()
                    .ok_or_else(|| TrainingError::config(flag, "missing value for override"))?;
                (flag.to_string(), raw.as_ref().to_string())
            }
        };

        if key.trim().is_empty() {
            return Err(TrainingError::config(token, "override flag has no key"));
        }
        overrides.push(Override { key, raw });
    }

    Ok(overrides)
}

/// What to do with an override whose path does not exist in the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownKeyPolicy {
    /// Create the path and store the raw text as a string leaf.
    #[default]
    Tolerate,
    /// Fail with a configuration error.
    Reject,
}

/// Declared leaf kinds, snapshotted from the default document.
#[derive(Debug, Clone, Default)]
pub struct ConfigSchema {
    leaves: BTreeMap<ConfigPath, ValueKind>,
    sections: BTreeSet<ConfigPath>,
}

impl ConfigSchema {
    #[must_use]
    pub fn from_tree(tree: &ConfigTree) -> Self {
        let mut schema = Self::default();
        for (path, value) in tree.leaves() {
            let mut parent = ConfigPath::root();
            for segment in &path.segments()[..path.segments().len() - 1] {
                parent = parent.join(segment);
                schema.sections.insert(parent.clone());
            }
            schema.leaves.insert(path, value.kind());
        }
        schema
    }

    #[must_use]
    pub fn kind_of(&self, path: &ConfigPath) -> Option<ValueKind> {
        if self.sections.contains(path) {
            return Some(ValueKind::Table);
        }
        self.leaves.get(path).copied()
    }

    /// Whether `path` sits below a leaf the defaults declare as `null`. Such
    /// leaves (e.g. `processor_kwargs: null`) are free-form sections.
    #[must_use]
    pub fn is_below_null(&self, path: &ConfigPath) -> bool {
        let segments = path.segments();
        let mut parent = ConfigPath::root();
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            parent = parent.join(segment);
            if self.leaves.get(&parent) == Some(&ValueKind::Null) {
                return true;
            }
        }
        false
    }

    /// Whether the defaults declare `path`, directly or as part of a free-form
    /// section.
    #[must_use]
    pub fn is_declared(&self, path: &ConfigPath) -> bool {
        self.kind_of(path).is_some() || self.is_below_null(path)
    }

    /// Converts `raw` against the declared kind of `path`. Keys inside a
    /// free-form section take the type their literal spells.
    pub fn coerce(&self, path: &ConfigPath, raw: &str) -> TrainingResult<ConfigValue> {
        match self.kind_of(path) {
            Some(ValueKind::Bool) => parse_bool(raw)
                .map(ConfigValue::Bool)
                .ok_or_else(|| TrainingError::config(path, format!("expected boolean, found `{raw}`"))),
            Some(ValueKind::Int) => parse_int(raw)
                .map(ConfigValue::Int)
                .ok_or_else(|| TrainingError::config(path, format!("expected integer, found `{raw}`"))),
            Some(ValueKind::Float) => parse_float(raw)
                .map(ConfigValue::Float)
                .ok_or_else(|| TrainingError::config(path, format!("expected float, found `{raw}`"))),
            Some(ValueKind::Null) => {
                let trimmed = raw.trim();
                if trimmed.eq_ignore_ascii_case("null") || trimmed.eq_ignore_ascii_case("none") {
                    Ok(ConfigValue::Null)
                } else {
                    Ok(ConfigValue::Str(raw.to_string()))
                }
            }
            Some(ValueKind::Table) => {
                Err(TrainingError::config(path, "cannot override a section with a scalar value"))
            }
            None if self.is_below_null(path) => Ok(infer_literal(raw)),
            Some(ValueKind::Str) | None => Ok(ConfigValue::Str(raw.to_string())),
        }
    }
}

fn infer_literal(raw: &str) -> ConfigValue {
    if let Some(b) = parse_bool(raw) {
        ConfigValue::Bool(b)
    } else if let Some(i) = parse_int(raw) {
        ConfigValue::Int(i)
    } else if let Some(f) = parse_float(raw) {
        ConfigValue::Float(f)
    } else {
        ConfigValue::Str(raw.to_string())
    }
}

/// Layers command-line overrides over a default document.
#[derive(Debug, Clone)]
pub struct ConfigMerger {
    defaults: ConfigTree,
    schema: ConfigSchema,
    policy: UnknownKeyPolicy,
}

impl ConfigMerger {
    #[must_use]
    pub fn new(defaults: ConfigTree) -> Self {
        let schema = ConfigSchema::from_tree(&defaults);
        Self { defaults, schema, policy: UnknownKeyPolicy::default() }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: UnknownKeyPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn schema(&self) -> &ConfigSchema {
        &self.schema
    }

    #[must_use]
    pub fn defaults(&self) -> &ConfigTree {
        &self.defaults
    }

    /// Parses `dotted_key`, converts `raw` against the schema, and stores it
    /// in `tree`, creating intermediate sections as needed.
    pub fn apply_override(&self, tree: &mut ConfigTree, dotted_key: &str, raw: &str) -> TrainingResult<()> {
        let path = ConfigPath::parse(dotted_key)?;
        if self.policy == UnknownKeyPolicy::Reject && !self.schema.is_declared(&path) {
            return Err(TrainingError::config(&path, "unknown configuration key"));
        }

        let value = self.schema.coerce(&path, raw)?;
        debug!(key = %path, value = %value, "applying configuration override");
        tree.set(&path, value)?;
        Ok(())
    }

    /// Applies `overrides` to a copy of the defaults, in order.
    pub fn merge(&self, overrides: &[Override]) -> TrainingResult<ConfigTree> {
        let mut tree = self.defaults.clone();
        for o in overrides {
            self.apply_override(&mut tree, &o.key, &o.raw)?;
        }
        Ok(tree)
    }

    pub fn merge_frozen(&self, overrides: &[Override]) -> TrainingResult<FrozenConfig> {
        Ok(self.merge(overrides)?.freeze())
    }
}
