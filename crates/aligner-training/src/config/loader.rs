use crate::config::backend::BackendConfig;
use crate::config::value::{ConfigPath, ConfigTree, ConfigValue};
use crate::error::{TrainingError, TrainingResult};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the directory that holds default documents.
pub const CONFIG_ROOT_ENV: &str = "ALIGNER_CONFIG_ROOT";

/// Key naming the backend document inside `<config_root>/deepspeed/`.
pub const BACKEND_CONFIG_KEY: &str = "train_cfgs.ds_cfgs";

const BACKEND_CONFIG_DIR: &str = "deepspeed";

/// Default config root: `$ALIGNER_CONFIG_ROOT`, else `./configs`.
#[must_use]
pub fn default_config_root() -> PathBuf {
    std::env::var_os(CONFIG_ROOT_ENV).map_or_else(|| PathBuf::from("configs"), PathBuf::from)
}

/// Resolves `<config_root>/<mode>/<task>.{yaml,yml,toml}`.
pub fn defaults_path(config_root: &Path, mode: &str, task: &str) -> TrainingResult<PathBuf> {
    let mut dir = config_root.join(mode);
    for component in task.split('/').filter(|c| !c.is_empty()) {
        dir.push(component);
    }

    for ext in ["yaml", "yml", "toml"] {
        let candidate = dir.with_extension(ext);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(TrainingError::config(
        format!("{mode}/{task}"),
        format!("no default configuration document at {}.{{yaml,yml,toml}}", dir.display()),
    ))
}

/// Loads the default document for `mode` + `task`, plus the backend document
/// it names (if any).
pub fn read_defaults(
    config_root: &Path,
    mode: &str,
    task: &str,
) -> TrainingResult<(ConfigTree, Option<BackendConfig>)> {
    let path = defaults_path(config_root, mode, task)?;
    let source = std::fs::read_to_string(&path)?;
    let origin = path.display().to_string();

    let tree = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => ConfigTree::from_toml_str(&source),
        _ => ConfigTree::from_yaml_str(&source, &origin),
    }
    .map_err(|e| match e {
        TrainingError::Yaml(err) => TrainingError::config(&origin, err.to_string()),
        TrainingError::Toml(err) => TrainingError::config(&origin, err.to_string()),
        other => other,
    })?;
    debug!(path = %origin, "loaded default configuration");

    let backend = read_backend_config(config_root, &tree)?;
    Ok((tree, backend))
}

fn read_backend_config(config_root: &Path, tree: &ConfigTree) -> TrainingResult<Option<BackendConfig>> {
    let key = ConfigPath::parse(BACKEND_CONFIG_KEY)?;
    match tree.get(&key) {
        None | Some(ConfigValue::Null) => Ok(None),
        Some(ConfigValue::Str(name)) if name.trim().is_empty() => Ok(None),
        Some(ConfigValue::Str(name)) => {
            let path = config_root.join(BACKEND_CONFIG_DIR).join(name);
            if !path.is_file() {
                return Err(TrainingError::config(
                    &key,
                    format!("backend document not found: {}", path.display()),
                ));
            }
            debug!(path = %path.display(), "loaded backend configuration");
            BackendConfig::from_path(&path).map(Some)
        }
        Some(other) => Err(TrainingError::config(
            &key,
            format!("expected a file name, found {}", other.kind()),
        )),
    }
}
