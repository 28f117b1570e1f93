use image::DynamicImage;
use tracing::debug;

use crate::index::normalize_l2;
use crate::state::{LoadedModels, ModelState};

/// Encode an image into a unit-norm query vector in the shared space.
///
/// Runs the frozen extractor, projects the features in evaluation mode and
/// L2-normalizes once more at the boundary. Fails with
/// [`crate::error::KuralError::NotInitialized`] before `load_models`.
pub fn encode_image(state: &ModelState, image: &DynamicImage) -> anyhow::Result<Vec<f32>> {
    encode_with(state.models()?, image)
}

pub(crate) fn encode_with(models: &LoadedModels, image: &DynamicImage) -> anyhow::Result<Vec<f32>> {
    let features = models.extractor.extract(image)?;
    debug!(
        width = image.width(),
        height = image.height(),
        feature_dim = features.len(),
        "Image features extracted"
    );

    let mut query = models.projection.project(&features)?;
    normalize_l2(&mut query);
    Ok(query)
}
