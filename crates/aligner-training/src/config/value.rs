use crate::config::frozen::FrozenConfig;
use crate::error::{TrainingError, TrainingResult};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type ConfigTable = BTreeMap<String, ConfigValue>;

/// A node in the configuration tree. Leaves are scalars or strings.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Table(ConfigTable),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Table,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "boolean",
            Self::Int => "integer",
            Self::Float => "float",
            Self::Str => "string",
            Self::Table => "section",
        };
        f.write_str(name)
    }
}

impl ConfigValue {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Str(_) => ValueKind::Str,
            Self::Table(_) => ValueKind::Table,
        }
    }

    #[must_use]
    pub fn as_table(&self) -> Option<&ConfigTable> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_table(&self) -> bool {
        matches!(self, Self::Table(_))
    }

    /// JSON rendering; non-finite floats become `null`.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;

        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(x) => serde_json::Number::from_f64(*x).map_or(Value::Null, Value::Number),
            Self::Str(s) => Value::String(s.clone()),
            Self::Table(t) => Value::Object(t.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
        }
    }

    fn from_yaml(value: serde_yaml::Value, path: &ConfigPath) -> TrainingResult<Self> {
        use serde_yaml::Value;

        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(b) => Ok(Self::Bool(b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Self::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Self::Float(f))
                } else {
                    Err(TrainingError::config(path, format!("unsupported number `{n}`")))
                }
            }
            Value::String(s) => Ok(Self::Str(s)),
            Value::Sequence(_) => Err(TrainingError::config(
                path,
                "sequences are not supported, use one key per element",
            )),
            Value::Mapping(mapping) => {
                let mut table = ConfigTable::new();
                for (key, value) in mapping {
                    let key = match key {
                        Value::String(s) => s,
                        Value::Number(n) => n.to_string(),
                        Value::Bool(b) => b.to_string(),
                        other => {
                            return Err(TrainingError::config(
                                path,
                                format!("unsupported mapping key `{other:?}`"),
                            ));
                        }
                    };
                    let child = path.join_checked(&key)?;
                    table.insert(key, Self::from_yaml(value, &child)?);
                }
                Ok(Self::Table(table))
            }
            Value::Tagged(tagged) => Self::from_yaml(tagged.value, path),
        }
    }

    fn from_toml(value: toml::Value, path: &ConfigPath) -> TrainingResult<Self> {
        use toml::Value;

        match value {
            Value::String(s) => Ok(Self::Str(s)),
            Value::Integer(i) => Ok(Self::Int(i)),
            Value::Float(f) => Ok(Self::Float(f)),
            Value::Boolean(b) => Ok(Self::Bool(b)),
            Value::Datetime(dt) => Ok(Self::Str(dt.to_string())),
            Value::Array(_) => Err(TrainingError::config(
                path,
                "arrays are not supported, use one key per element",
            )),
            Value::Table(t) => {
                let mut table = ConfigTable::new();
                for (key, value) in t {
                    let child = path.join_checked(&key)?;
                    let converted = Self::from_toml(value, &child)?;
                    table.insert(key, converted);
                }
                Ok(Self::Table(table))
            }
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
            Self::Table(t) => write!(f, "{{{} keys}}", t.len()),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ConfigValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("true") {
        Some(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

pub(crate) fn parse_int(raw: &str) -> Option<i64> {
    raw.trim().parse().ok()
}

pub(crate) fn parse_float(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|f| !f.is_nan())
}

/// A dotted configuration path such as `train_cfgs.seed`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigPath(Vec<String>);

impl ConfigPath {
    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn parse(dotted: &str) -> TrainingResult<Self> {
        let dotted = dotted.trim();
        if dotted.is_empty() {
            return Err(TrainingError::config("<empty>", "configuration key must not be empty"));
        }
        let segments: Vec<String> = dotted.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(TrainingError::config(dotted, "configuration key has an empty segment"));
        }
        Ok(Self(segments))
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn join(&self, segment: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Self(segments)
    }

    #[must_use]
    pub fn concat(&self, other: &Self) -> Self {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        Self(segments)
    }

    fn join_checked(&self, key: &str) -> TrainingResult<Self> {
        if key.is_empty() || key.contains('.') {
            return Err(TrainingError::config(
                self.join(key),
                "keys must be non-empty and must not contain `.`",
            ));
        }
        Ok(self.join(key))
    }
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<root>");
        }
        f.write_str(&self.0.join("."))
    }
}

impl FromStr for ConfigPath {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

pub(crate) fn lookup<'a>(table: &'a ConfigTable, path: &ConfigPath) -> Option<&'a ConfigValue> {
    let (last, parents) = path.segments().split_last()?;
    let mut node = table;
    for segment in parents {
        node = node.get(segment)?.as_table()?;
    }
    node.get(last)
}

/// Mutable configuration tree used while layering defaults and overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigTree {
    root: ConfigTable,
}

impl ConfigTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_table(root: ConfigTable) -> Self {
        Self { root }
    }

    pub fn from_yaml_str(source: &str, origin: &str) -> TrainingResult<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(source)?;
        match ConfigValue::from_yaml(value, &ConfigPath::root())? {
            ConfigValue::Table(root) => Ok(Self { root }),
            ConfigValue::Null => Ok(Self::new()),
            other => Err(TrainingError::config(
                origin,
                format!("document root must be a mapping, found {}", other.kind()),
            )),
        }
    }

    pub fn from_toml_str(source: &str) -> TrainingResult<Self> {
        let table: toml::Table = toml::from_str(source)?;
        match ConfigValue::from_toml(toml::Value::Table(table), &ConfigPath::root())? {
            ConfigValue::Table(root) => Ok(Self { root }),
            other => Err(TrainingError::config(
                ConfigPath::root(),
                format!("document root must be a table, found {}", other.kind()),
            )),
        }
    }

    #[must_use]
    pub fn table(&self) -> &ConfigTable {
        &self.root
    }

    #[must_use]
    pub fn get(&self, path: &ConfigPath) -> Option<&ConfigValue> {
        lookup(&self.root, path)
    }

    /// Sets `value` at `path`, creating intermediate sections. A null
    /// intermediate is replaced by an empty section. Returns the value
    /// previously stored there.
    pub fn set(&mut self, path: &ConfigPath, value: ConfigValue) -> TrainingResult<Option<ConfigValue>> {
        let Some((leaf, parents)) = path.segments().split_last() else {
            return Err(TrainingError::config(path, "cannot replace the configuration root"));
        };

        let mut node = &mut self.root;
        let mut walked = ConfigPath::root();
        for segment in parents {
            walked = walked.join(segment);
            let entry = node.entry(segment.clone()).or_insert_with(|| ConfigValue::Table(ConfigTable::new()));
            if matches!(entry, ConfigValue::Null) {
                *entry = ConfigValue::Table(ConfigTable::new());
            }
            node = match entry {
                ConfigValue::Table(table) => table,
                other => {
                    return Err(TrainingError::config(
                        &walked,
                        format!("cannot descend into a {} value", other.kind()),
                    ));
                }
            };
        }

        if node.get(leaf).is_some_and(ConfigValue::is_table) && !value.is_table() {
            return Err(TrainingError::config(path, "cannot replace a section with a scalar value"));
        }
        Ok(node.insert(leaf.clone(), value))
    }

    /// Every non-section node with its full path.
    #[must_use]
    pub fn leaves(&self) -> Vec<(ConfigPath, &ConfigValue)> {
        fn walk<'a>(table: &'a ConfigTable, prefix: &ConfigPath, out: &mut Vec<(ConfigPath, &'a ConfigValue)>) {
            for (key, value) in table {
                let path = prefix.join(key);
                match value {
                    ConfigValue::Table(child) => walk(child, &path, out),
                    leaf => out.push((path, leaf)),
                }
            }
        }

        let mut out = Vec::new();
        walk(&self.root, &ConfigPath::root(), &mut out);
        out
    }

    /// Converts into the read-only, shareable tree used after startup.
    #[must_use]
    pub fn freeze(self) -> FrozenConfig {
        FrozenConfig::new(self.root)
    }
}
