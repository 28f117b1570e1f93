use std::path::{Path, PathBuf};

use crate::config::{INDEX_FILE, METADATA_FILE, WEIGHTS_FILE};

/// Environment variable overriding the artifact directory.
pub const ARTIFACT_DIR_ENV: &str = "KURAL_LENS_ARTIFACT_DIR";

/// Environment variable overriding the model cache directory.
pub const MODEL_DIR_ENV: &str = "KURAL_LENS_MODEL_DIR";

/// Where kural-lens finds its artifacts and downloaded models.
pub trait KuralContext {
    /// Directory holding the index, metadata and projection weights.
    fn artifact_dir(&self) -> &Path;

    /// Directory holding downloaded extractor models.
    fn model_cache_dir(&self) -> &Path;

    fn artifact_paths(&self) -> ArtifactPaths {
        ArtifactPaths::in_dir(self.artifact_dir())
    }
}

/// Context resolved from explicit paths or the process environment.
#[derive(Debug, Clone)]
pub struct RealKuralContext {
    artifact_dir: PathBuf,
    model_cache_dir: PathBuf,
}

impl RealKuralContext {
    pub fn new(artifact_dir: PathBuf, model_cache_dir: PathBuf) -> Self {
        Self {
            artifact_dir,
            model_cache_dir,
        }
    }

    /// Resolve directories from `KURAL_LENS_ARTIFACT_DIR` / `KURAL_LENS_MODEL_DIR`,
    /// falling back to `~/.kural-lens/artifacts` and `~/.kural-lens/models`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::resolve(|key| std::env::var(key).ok(), dirs::home_dir())
    }

    fn resolve(
        env: impl Fn(&str) -> Option<String>,
        home: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let base = || {
            home.as_ref()
                .map(|h| h.join(".kural-lens"))
                .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
        };
        let pick = |key: &str, fallback: &str| -> anyhow::Result<PathBuf> {
            match env(key).filter(|v| !v.is_empty()) {
                Some(dir) => Ok(PathBuf::from(dir)),
                None => Ok(base()?.join(fallback)),
            }
        };
        Ok(Self {
            artifact_dir: pick(ARTIFACT_DIR_ENV, "artifacts")?,
            model_cache_dir: pick(MODEL_DIR_ENV, "models")?,
        })
    }
}

impl KuralContext for RealKuralContext {
    fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    fn model_cache_dir(&self) -> &Path {
        &self.model_cache_dir
    }
}

/// Locations of the three artifacts produced by the offline pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub index: PathBuf,
    pub metadata: PathBuf,
    pub weights: PathBuf,
}

impl ArtifactPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            index: dir.join(INDEX_FILE),
            metadata: dir.join(METADATA_FILE),
            weights: dir.join(WEIGHTS_FILE),
        }
    }

    /// Every required artifact with its file name, in validation order.
    pub fn required(&self) -> [(&'static str, &Path); 3] {
        [
            (INDEX_FILE, self.index.as_path()),
            (METADATA_FILE, self.metadata.as_path()),
            (WEIGHTS_FILE, self.weights.as_path()),
        ]
    }
}
