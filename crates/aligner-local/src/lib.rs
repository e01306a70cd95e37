//! Single-process reference collaborators for `aligner-training`.
//!
//! - `LocalBackend`: CPU-only backend with a linear token-bag cost scorer
//! - `LocalModelProvider`: reads model directories (`config.json`,
//!   `tokenizer_config.json`, `preprocessor_config.json`)
//! - `JsonlPreferenceProvider`: preference pairs from JSONL files

pub mod backend;
pub mod jsonl;
pub mod provider;

pub use backend::{LocalBackend, LocalEngine};
pub use jsonl::{JsonlPreferenceProvider, PreferenceRecord, PromptTemplate};
pub use provider::{LocalModelProvider, MODEL_CACHE_ENV};
