//! Layered configuration.
//!
//! A default document keyed by mode + task is read into a [`ConfigTree`],
//! command-line overrides (`--dotted.key value`) are converted against the
//! leaf kinds declared by the defaults and applied in order, and the result
//! is frozen into a shareable, read-only [`FrozenConfig`].

pub mod backend;
pub mod frozen;
pub mod loader;
pub mod merge;
pub mod value;

pub use backend::{BackendConfig, BackendStamp};
pub use frozen::FrozenConfig;
pub use loader::{default_config_root, defaults_path, read_defaults, BACKEND_CONFIG_KEY, CONFIG_ROOT_ENV};
pub use merge::{parse_overrides, ConfigMerger, ConfigSchema, Override, UnknownKeyPolicy};
pub use value::{ConfigPath, ConfigTable, ConfigTree, ConfigValue, ValueKind};
