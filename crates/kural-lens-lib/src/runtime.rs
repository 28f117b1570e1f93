use crate::context::{KuralContext, RealKuralContext};
use crate::model::extractor::{ClipProvider, ExtractorProvider};
use crate::state::ModelState;

/// Everything a command needs: where things live and the shared model state.
pub struct Runtime {
    pub context: RealKuralContext,
    pub state: ModelState,
}

impl Runtime {
    /// Runtime with the CLIP extractor from the context's model cache.
    pub fn new(context: RealKuralContext) -> Self {
        let provider = ClipProvider::new(context.model_cache_dir().to_path_buf());
        Self::with_provider(context, provider)
    }

    /// Runtime with a custom extractor source.
    pub fn with_provider(
        context: RealKuralContext,
        provider: impl ExtractorProvider + 'static,
    ) -> Self {
        let state = ModelState::new(context.artifact_paths(), provider);
        Self { context, state }
    }
}
