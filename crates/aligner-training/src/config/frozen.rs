use crate::config::value::{
    lookup, parse_bool, parse_float, parse_int, ConfigPath, ConfigTable, ConfigTree, ConfigValue,
};
use crate::error::{TrainingError, TrainingResult};
use std::sync::Arc;

/// Read-only configuration tree, built once at startup.
///
/// Clones share the same underlying tree. Sections are addressed with
/// [`FrozenConfig::section`], leaves through the typed getters, which report
/// missing or mistyped values as configuration errors citing the full
/// dotted path.
///
/// There is no way to mutate a frozen tree:
///
/// ```compile_fail
/// use aligner_training::config::{ConfigPath, ConfigTree, ConfigValue};
///
/// let frozen = ConfigTree::new().freeze();
/// frozen.set(&ConfigPath::parse("train_cfgs.seed").unwrap(), ConfigValue::Int(7));
/// ```
///
/// Use [`FrozenConfig::thaw`] to obtain an independent mutable copy.
#[derive(Debug, Clone)]
pub struct FrozenConfig {
    root: Arc<ConfigTable>,
    prefix: ConfigPath,
}

impl FrozenConfig {
    pub(crate) fn new(root: ConfigTable) -> Self {
        Self { root: Arc::new(root), prefix: ConfigPath::root() }
    }

    /// Path of this view relative to the document root.
    #[must_use]
    pub fn path(&self) -> &ConfigPath {
        &self.prefix
    }

    fn full_path(&self, path: &str) -> TrainingResult<ConfigPath> {
        Ok(self.prefix.concat(&ConfigPath::parse(path)?))
    }

    fn node(&self) -> Option<&ConfigTable> {
        if self.prefix.is_root() {
            return Some(&self.root);
        }
        lookup(&self.root, &self.prefix).and_then(ConfigValue::as_table)
    }

    /// Returns the node at `path`, or `None` when absent.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&ConfigValue> {
        let full = self.full_path(path).ok()?;
        lookup(&self.root, &full)
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    pub fn value(&self, path: &str) -> TrainingResult<&ConfigValue> {
        let full = self.full_path(path)?;
        lookup(&self.root, &full).ok_or_else(|| TrainingError::config(&full, "missing required value"))
    }

    /// Looks up `path`, treating an explicit `null` the same as absence.
    fn optional(&self, path: &str) -> TrainingResult<Option<(ConfigPath, &ConfigValue)>> {
        let full = self.full_path(path)?;
        Ok(lookup(&self.root, &full)
            .filter(|v| !matches!(v, ConfigValue::Null))
            .map(|v| (full, v)))
    }

    fn required(&self, path: &str) -> TrainingResult<(ConfigPath, &ConfigValue)> {
        let full = self.full_path(path)?;
        match lookup(&self.root, &full) {
            Some(ConfigValue::Null) | None => Err(TrainingError::config(&full, "missing required value")),
            Some(value) => Ok((full, value)),
        }
    }

    pub fn section(&self, path: &str) -> TrainingResult<Self> {
        let full = self.full_path(path)?;
        match lookup(&self.root, &full) {
            Some(ConfigValue::Table(_)) => Ok(Self { root: Arc::clone(&self.root), prefix: full }),
            Some(other) => Err(TrainingError::config(
                &full,
                format!("expected a section, found {}", other.kind()),
            )),
            None => Err(TrainingError::config(&full, "missing required section")),
        }
    }

    pub fn str(&self, path: &str) -> TrainingResult<&str> {
        let (full, value) = self.required(path)?;
        as_str(&full, value)
    }

    pub fn opt_str(&self, path: &str) -> TrainingResult<Option<&str>> {
        self.optional(path)?.map(|(full, value)| as_str(&full, value)).transpose()
    }

    pub fn bool(&self, path: &str) -> TrainingResult<bool> {
        let (full, value) = self.required(path)?;
        as_bool(&full, value)
    }

    pub fn opt_bool(&self, path: &str) -> TrainingResult<Option<bool>> {
        self.optional(path)?.map(|(full, value)| as_bool(&full, value)).transpose()
    }

    pub fn i64(&self, path: &str) -> TrainingResult<i64> {
        let (full, value) = self.required(path)?;
        as_i64(&full, value)
    }

    pub fn u64(&self, path: &str) -> TrainingResult<u64> {
        let (full, value) = self.required(path)?;
        as_u64(&full, value)
    }

    pub fn opt_u64(&self, path: &str) -> TrainingResult<Option<u64>> {
        self.optional(path)?.map(|(full, value)| as_u64(&full, value)).transpose()
    }

    pub fn usize(&self, path: &str) -> TrainingResult<usize> {
        let (full, value) = self.required(path)?;
        let n = as_u64(&full, value)?;
        usize::try_from(n).map_err(|_| TrainingError::config(&full, format!("{n} does not fit the platform size")))
    }

    pub fn f64(&self, path: &str) -> TrainingResult<f64> {
        let (full, value) = self.required(path)?;
        as_f64(&full, value)
    }

    pub fn opt_f64(&self, path: &str) -> TrainingResult<Option<f64>> {
        self.optional(path)?.map(|(full, value)| as_f64(&full, value)).transpose()
    }

    pub fn table(&self, path: &str) -> TrainingResult<&ConfigTable> {
        let full = self.full_path(path)?;
        self.opt_table(path)?.ok_or_else(|| TrainingError::config(&full, "missing required section"))
    }

    /// A nested section as a raw table, or `None` when absent or null.
    pub fn opt_table(&self, path: &str) -> TrainingResult<Option<&ConfigTable>> {
        match self.optional(path)? {
            None => Ok(None),
            Some((_, ConfigValue::Table(t))) => Ok(Some(t)),
            Some((full, other)) => Err(TrainingError::config(
                &full,
                format!("expected a section, found {}", other.kind()),
            )),
        }
    }

    /// An independent mutable copy of this view.
    #[must_use]
    pub fn thaw(&self) -> ConfigTree {
        ConfigTree::from_table(self.node().cloned().unwrap_or_default())
    }
}

fn mismatch(path: &ConfigPath, expected: &str, value: &ConfigValue) -> TrainingError {
    match value {
        ConfigValue::Str(raw) => TrainingError::config(path, format!("expected {expected}, found `{raw}`")),
        other => TrainingError::config(path, format!("expected {expected}, found {}", other.kind())),
    }
}

fn as_str<'a>(path: &ConfigPath, value: &'a ConfigValue) -> TrainingResult<&'a str> {
    match value {
        ConfigValue::Str(s) => Ok(s),
        other => Err(mismatch(path, "string", other)),
    }
}

fn as_bool(path: &ConfigPath, value: &ConfigValue) -> TrainingResult<bool> {
    match value {
        ConfigValue::Bool(b) => Ok(*b),
        ConfigValue::Str(raw) => parse_bool(raw).ok_or_else(|| mismatch(path, "boolean", value)),
        other => Err(mismatch(path, "boolean", other)),
    }
}

fn as_i64(path: &ConfigPath, value: &ConfigValue) -> TrainingResult<i64> {
    match value {
        ConfigValue::Int(i) => Ok(*i),
        ConfigValue::Str(raw) => parse_int(raw).ok_or_else(|| mismatch(path, "integer", value)),
        other => Err(mismatch(path, "integer", other)),
    }
}

fn as_u64(path: &ConfigPath, value: &ConfigValue) -> TrainingResult<u64> {
    let i = as_i64(path, value)?;
    u64::try_from(i).map_err(|_| TrainingError::config(path, format!("expected a non-negative integer, found {i}")))
}

fn as_f64(path: &ConfigPath, value: &ConfigValue) -> TrainingResult<f64> {
    match value {
        ConfigValue::Float(f) => Ok(*f),
        ConfigValue::Int(i) => Ok(*i as f64),
        ConfigValue::Str(raw) => parse_float(raw).ok_or_else(|| mismatch(path, "float", value)),
        other => Err(mismatch(path, "float", other)),
    }
}
