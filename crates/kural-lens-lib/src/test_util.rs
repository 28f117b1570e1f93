use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{Device as CandleDevice, Tensor};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

use crate::config::{INDEX_FILE, WEIGHTS_FILE};
use crate::context::ArtifactPaths;
use crate::corpus::Pal;
use crate::index::flat::FlatIpIndex;
use crate::index::{dot, normalize_l2};
use crate::model::Device;
use crate::model::extractor::{ExtractorProvider, ImageFeatureExtractor};
use crate::model::projection::{ProjectionConfig, ProjectionHead, ProjectionWeights};
use crate::state::ModelState;

/// Small projection dimensions keeping fixtures fast.
pub const TEST_CONFIG: ProjectionConfig = ProjectionConfig {
    in_dim: 6,
    out_dim: 4,
    hidden_dim: 8,
};

/// Colour of the image fixtures query with.
pub const QUERY_RGB: [u8; 3] = [120, 80, 40];

/// Deterministic, non-trivial parameter values.
fn pattern(len: usize, seed: f32) -> Vec<f32> {
    (0..len)
        .map(|i| ((i as f32 + 1.0) * seed).sin() * 0.5)
        .collect()
}

fn tensor(values: Vec<f32>, shape: &[usize]) -> Tensor {
    Tensor::from_vec(values, shape, &CandleDevice::Cpu).unwrap()
}

/// A projection head with fixed pseudo-random weights.
pub fn synthetic_projection(config: ProjectionConfig) -> ProjectionHead {
    let ProjectionConfig {
        in_dim,
        out_dim,
        hidden_dim,
    } = config;
    let weights = ProjectionWeights {
        fc1_weight: tensor(pattern(hidden_dim * in_dim, 0.731), &[hidden_dim, in_dim]),
        fc1_bias: tensor(pattern(hidden_dim, 0.377), &[hidden_dim]),
        norm_weight: tensor(vec![1.0; hidden_dim], &[hidden_dim]),
        norm_bias: tensor(pattern(hidden_dim, 0.113), &[hidden_dim]),
        fc2_weight: tensor(pattern(out_dim * hidden_dim, 1.319), &[out_dim, hidden_dim]),
        fc2_bias: tensor(pattern(out_dim, 0.571), &[out_dim]),
    };
    ProjectionHead::new(config, weights)
}

/// A single-colour 8x8 image.
pub fn solid_image(rgb: [u8; 3]) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb(rgb)))
}

/// Extractor whose features depend only on the image's mean colour.
#[derive(Debug, Clone)]
pub struct FakeExtractor {
    dimension: usize,
}

impl FakeExtractor {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl ImageFeatureExtractor for FakeExtractor {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn extract(&self, image: &DynamicImage) -> anyhow::Result<Vec<f32>> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            anyhow::bail!("cannot extract features from an empty image");
        }
        let rgb = image.to_rgb8();
        let mut sums = [0f32; 3];
        for pixel in rgb.pixels() {
            for (sum, channel) in sums.iter_mut().zip(pixel.0) {
                *sum += f32::from(channel);
            }
        }
        let pixels = (width * height) as f32;
        let phase = sums[0] / pixels * 0.013 + sums[1] / pixels * 0.007 + sums[2] / pixels * 0.003;
        Ok((0..self.dimension)
            .map(|i| ((i as f32 + 1.0) * (phase + 1.0)).sin())
            .collect())
    }
}

/// [`ExtractorProvider`] handing out [`FakeExtractor`]s and counting loads.
#[derive(Debug, Clone)]
pub struct FakeProvider {
    dimension: usize,
    loads: Arc<AtomicUsize>,
}

impl FakeProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of how many extractors were loaded.
    pub fn loads(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.loads)
    }
}

impl ExtractorProvider for FakeProvider {
    fn load(&self, _device: Device) -> anyhow::Result<Box<dyn ImageFeatureExtractor>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeExtractor::new(self.dimension)))
    }
}

/// Write [`synthetic_projection`] weights to `dir` and return the head.
pub fn write_projection(dir: &Path, config: ProjectionConfig) -> ProjectionHead {
    let head = synthetic_projection(config);
    head.save(&dir.join(WEIGHTS_FILE)).unwrap();
    head
}

/// Write a flat inner-product index of row-major `vectors` to `dir`.
pub fn write_index(dir: &Path, dimension: usize, vectors: Vec<f32>) {
    FlatIpIndex::from_vectors(dimension, vectors)
        .unwrap()
        .save(&dir.join(INDEX_FILE))
        .unwrap();
}

/// Write corpus metadata with one entry per Pal, numbered from 1.
pub fn write_corpus(dir: &Path, pals: &[Pal]) {
    let names: Vec<&str> = pals.iter().map(|pal| pal.as_str()).collect();
    kural_lens_test_util::corpus::write_metadata(
        dir,
        &kural_lens_test_util::corpus::corpus_json(&names),
    );
}

/// The query vector the pipeline produces for `image` with `head` and a
/// [`FakeExtractor`].
pub fn query_for(head: &ProjectionHead, image: &DynamicImage) -> Vec<f32> {
    let features = FakeExtractor::new(head.config().in_dim)
        .extract(image)
        .unwrap();
    let mut query = head.project(&features).unwrap();
    normalize_l2(&mut query);
    query
}

/// Unit vectors whose inner product with the unit vector `query` is `scores[i]`.
///
/// Each vector is `s * query + sqrt(1 - s²) * u` for a fixed unit `u`
/// orthogonal to `query`.
pub fn vectors_with_scores(query: &[f32], scores: &[f32]) -> Vec<f32> {
    let axis = query
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map(|(i, _)| i)
        .unwrap();
    let mut u: Vec<f32> = (0..query.len())
        .map(|i| if i == axis { 1.0 } else { 0.0 })
        .collect();
    let along = dot(&u, query);
    for (x, q) in u.iter_mut().zip(query) {
        *x -= along * q;
    }
    normalize_l2(&mut u);

    scores
        .iter()
        .flat_map(|&s| {
            let rest = (1.0 - s * s).max(0.0).sqrt();
            query
                .iter()
                .zip(&u)
                .map(move |(q, o)| s * q + rest * o)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Artifacts in `dir` for a corpus whose similarity to the [`QUERY_RGB`] image
/// is `scores[i]` at position `i`, and a loaded state over them.
pub fn loaded_state(dir: &Path, pals: &[Pal], scores: &[f32]) -> ModelState {
    let head = write_projection(dir, TEST_CONFIG);
    let query = query_for(&head, &solid_image(QUERY_RGB));
    write_index(dir, TEST_CONFIG.out_dim, vectors_with_scores(&query, scores));
    write_corpus(dir, pals);

    let state = ModelState::new(
        ArtifactPaths::in_dir(dir),
        FakeProvider::new(TEST_CONFIG.in_dim),
    );
    state.load_models(Device::Cpu).unwrap();
    state
}
