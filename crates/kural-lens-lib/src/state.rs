use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use tracing::{info, warn};

use crate::context::ArtifactPaths;
use crate::corpus::{Kural, load_metadata};
use crate::error::KuralError;
use crate::index::VectorIndex;
use crate::index::flat::FlatIpIndex;
use crate::model::Device;
use crate::model::extractor::{ExtractorProvider, ImageFeatureExtractor};
use crate::model::projection::ProjectionHead;

/// Everything a retrieval request reads. Immutable once published.
pub struct LoadedModels {
    pub extractor: Box<dyn ImageFeatureExtractor>,
    pub projection: ProjectionHead,
    pub index: FlatIpIndex,
    /// Corpus metadata; entry `i` describes index vector `i`.
    pub kurals: Vec<Kural>,
    pub device: Device,
}

/// Long-lived model state shared by every request.
///
/// Created empty, filled once by [`ModelState::load_models`], read-only
/// afterwards. Share it by reference; it is `Send + Sync`.
pub struct ModelState {
    artifacts: ArtifactPaths,
    provider: Box<dyn ExtractorProvider>,
    loaded: OnceLock<LoadedModels>,
    load_guard: Mutex<()>,
    load_count: AtomicUsize,
}

impl ModelState {
    pub fn new(artifacts: ArtifactPaths, provider: impl ExtractorProvider + 'static) -> Self {
        Self {
            artifacts,
            provider: Box::new(provider),
            loaded: OnceLock::new(),
            load_guard: Mutex::new(()),
            load_count: AtomicUsize::new(0),
        }
    }

    pub fn artifacts(&self) -> &ArtifactPaths {
        &self.artifacts
    }

    /// Whether [`Self::load_models`] has completed successfully.
    pub fn is_loaded(&self) -> bool {
        self.loaded.get().is_some()
    }

    /// Number of times the expensive load actually ran.
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    /// The loaded models, or [`KuralError::NotInitialized`].
    pub fn models(&self) -> Result<&LoadedModels, KuralError> {
        self.loaded.get().ok_or(KuralError::NotInitialized)
    }

    /// Load the extractor, projection head, index and metadata. Idempotent.
    ///
    /// Fails without publishing anything if an artifact is missing or the
    /// dimensions of the pieces disagree. Concurrent callers are serialized;
    /// only the first runs the load.
    pub fn load_models(&self, device: Device) -> anyhow::Result<()> {
        if self.is_loaded() {
            info!("Models already loaded, skipping.");
            return Ok(());
        }

        let _guard = self
            .load_guard
            .lock()
            .map_err(|_| anyhow::anyhow!("model load guard poisoned"))?;
        if self.is_loaded() {
            info!("Models already loaded, skipping.");
            return Ok(());
        }

        self.load_count.fetch_add(1, Ordering::SeqCst);
        let models = self.load_all(device)?;
        // The guard is held and nothing else sets the cell.
        let _ = self.loaded.set(models);
        Ok(())
    }

    fn load_all(&self, device: Device) -> anyhow::Result<LoadedModels> {
        let start = Instant::now();
        info!(device = %device, "Loading models...");

        for (label, path) in self.artifacts.required() {
            if !path.exists() {
                return Err(KuralError::MissingArtifact {
                    label,
                    path: path.to_path_buf(),
                }
                .into());
            }
        }

        info!("Loading feature extractor...");
        let extractor = self.provider.load(device)?;
        info!(dimension = extractor.dimension(), "Feature extractor loaded");

        info!("Loading projection head...");
        let projection = ProjectionHead::from_file(&self.artifacts.weights, &device.to_candle()?)?;
        let config = projection.config();
        info!(
            in_dim = config.in_dim,
            hidden_dim = config.hidden_dim,
            out_dim = config.out_dim,
            "Projection head loaded"
        );
        if extractor.dimension() != config.in_dim {
            return Err(KuralError::DimensionMismatch {
                what: "extractor feature".to_string(),
                expected: config.in_dim,
                actual: extractor.dimension(),
            }
            .into());
        }

        info!("Loading vector index...");
        let index = FlatIpIndex::load(&self.artifacts.index)?;
        info!(ntotal = index.ntotal(), "Vector index loaded");
        if index.dimension() != config.out_dim {
            return Err(KuralError::DimensionMismatch {
                what: "vector index".to_string(),
                expected: config.out_dim,
                actual: index.dimension(),
            }
            .into());
        }

        info!("Loading Kural metadata...");
        let kurals = load_metadata(&self.artifacts.metadata)?;
        info!(entries = kurals.len(), "Kural metadata loaded");
        if kurals.len() != index.ntotal() {
            warn!(
                entries = kurals.len(),
                ntotal = index.ntotal(),
                "Index and metadata sizes differ; out-of-range positions will be skipped"
            );
        }

        info!(
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "All models ready"
        );

        Ok(LoadedModels {
            extractor,
            projection,
            index,
            kurals,
            device,
        })
    }
}
