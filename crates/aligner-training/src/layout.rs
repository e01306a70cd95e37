use crate::error::TrainingResult;
use std::path::{Path, PathBuf};
use tracing::debug;

const SLICE_PREFIX: &str = "slice_";
const FINAL_SLICE: &str = "slice_end";
const MANIFEST_FILE: &str = "training_manifest.json";

/// Filesystem layout under `logger_cfgs.output_dir`.
///
/// Periodic checkpoints go to `slice_<step>`, the final one to `slice_end`.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn slice_dir(&self, step: u64) -> PathBuf {
        self.root.join(format!("{SLICE_PREFIX}{step}"))
    }

    #[must_use]
    pub fn final_dir(&self) -> PathBuf {
        self.root.join(FINAL_SLICE)
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn ensure_root(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    /// Periodic checkpoint directories, oldest first.
    pub fn periodic_slices(&self) -> TrainingResult<Vec<(u64, PathBuf)>> {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut slices = Vec::new();
        for entry in dir {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let step = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(SLICE_PREFIX))
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(step) = step {
                slices.push((step, path));
            }
        }
        slices.sort_by_key(|(step, _)| *step);
        Ok(slices)
    }

    /// Deletes the oldest periodic checkpoints beyond `keep`. Returns the
    /// removed directories.
    pub fn prune(&self, keep: usize) -> TrainingResult<Vec<PathBuf>> {
        let slices = self.periodic_slices()?;
        let excess = slices.len().saturating_sub(keep);

        let mut removed = Vec::with_capacity(excess);
        for (step, path) in slices.into_iter().take(excess) {
            debug!(step, path = %path.display(), "pruning checkpoint");
            std::fs::remove_dir_all(&path)?;
            removed.push(path);
        }
        Ok(removed)
    }
}
