use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use ort::session::Session;
use ort::value::Tensor;
use serde::Deserialize;
use tracing::{debug, warn};

use super::Device;
use crate::config::{CLIP_MODEL_SUBDIR, CLIP_ONNX_FILE, CLIP_PREPROCESSOR_FILE};

/// Preferred output of the vision tower: the projected, unnormalized features.
const IMAGE_EMBEDS_OUTPUT: &str = "image_embeds";

/// Frozen image encoder producing one raw (unnormalized) feature vector per image.
///
/// Implementations apply their own preprocessing (resize, crop, normalize) and
/// must not change any weights.
pub trait ImageFeatureExtractor: Send + Sync {
    /// Length of every feature vector returned by [`Self::extract`].
    fn dimension(&self) -> usize;

    fn extract(&self, image: &DynamicImage) -> anyhow::Result<Vec<f32>>;
}

/// Loads an [`ImageFeatureExtractor`] onto a device during model initialization.
pub trait ExtractorProvider: Send + Sync {
    fn load(&self, device: Device) -> anyhow::Result<Box<dyn ImageFeatureExtractor>>;
}

/// A resize or crop size as written in `preprocessor_config.json`.
///
/// Older exports use a bare integer, newer ones an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Edge(u32),
    ShortestEdge { shortest_edge: u32 },
    Exact { height: u32, width: u32 },
}

/// CLIP image preprocessing, read from a Hugging Face `preprocessor_config.json`.
///
/// Missing keys take the CLIP ViT-L/14 values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClipPreprocessor {
    pub do_resize: bool,
    pub size: SizeSpec,
    /// PIL resampling filter id (3 = bicubic).
    pub resample: u8,
    pub do_center_crop: bool,
    pub crop_size: SizeSpec,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: Vec<f32>,
    pub image_std: Vec<f32>,
}

impl Default for ClipPreprocessor {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: SizeSpec::ShortestEdge { shortest_edge: 224 },
            resample: 3,
            do_center_crop: true,
            crop_size: SizeSpec::Exact {
                height: 224,
                width: 224,
            },
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: vec![0.481_454_7, 0.457_827_5, 0.408_210_7],
            image_std: vec![0.268_629_5, 0.261_302_6, 0.275_777_1],
        }
    }
}

/// A preprocessed image in `(channel, height, width)` order.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelValues {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ClipPreprocessor {
    pub fn from_json(bytes: &[u8]) -> anyhow::Result<Self> {
        let preprocessor: Self =
            serde_json::from_slice(bytes).context("Failed to parse CLIP preprocessor config")?;
        if preprocessor.image_mean.len() != 3 || preprocessor.image_std.len() != 3 {
            anyhow::bail!("CLIP preprocessor config needs three image_mean and image_std values");
        }
        if preprocessor.image_std.iter().any(|s| *s == 0.0) {
            anyhow::bail!("CLIP preprocessor config has a zero image_std");
        }
        Ok(preprocessor)
    }

    fn filter(&self) -> FilterType {
        match self.resample {
            0 => FilterType::Nearest,
            1 => FilterType::Lanczos3,
            2 => FilterType::Triangle,
            _ => FilterType::CatmullRom,
        }
    }

    /// Resize, center-crop (zero-padding small images), rescale and normalize.
    pub fn preprocess(&self, image: &DynamicImage) -> anyhow::Result<PixelValues> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            anyhow::bail!("cannot preprocess an empty image");
        }

        let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
        let resized = if self.do_resize {
            let (w, h) = resize_target(self.size, width, height);
            rgb.resize_exact(w, h, self.filter())
        } else {
            rgb
        };
        let resized = resized.to_rgb8();
        let (rw, rh) = resized.dimensions();

        let (crop_w, crop_h) = if self.do_center_crop {
            match self.crop_size {
                SizeSpec::Edge(side) | SizeSpec::ShortestEdge { shortest_edge: side } => {
                    (side, side)
                }
                SizeSpec::Exact { height, width } => (width, height),
            }
        } else {
            (rw, rh)
        };
        let left = (i64::from(rw) - i64::from(crop_w)).div_euclid(2);
        let top = (i64::from(rh) - i64::from(crop_h)).div_euclid(2);

        let (out_w, out_h) = (crop_w as usize, crop_h as usize);
        let plane = out_w * out_h;
        let mut data = vec![0f32; 3 * plane];
        for y in 0..crop_h {
            let Ok(src_y) = u32::try_from(top + i64::from(y)) else {
                continue;
            };
            if src_y >= rh {
                continue;
            }
            for x in 0..crop_w {
                let Ok(src_x) = u32::try_from(left + i64::from(x)) else {
                    continue;
                };
                if src_x >= rw {
                    continue;
                }
                let offset = y as usize * out_w + x as usize;
                for (c, value) in resized.get_pixel(src_x, src_y).0.iter().enumerate() {
                    data[c * plane + offset] = f32::from(*value);
                }
            }
        }

        for (c, channel) in data.chunks_mut(plane).enumerate() {
            for value in channel {
                if self.do_rescale {
                    *value *= self.rescale_factor;
                }
                if self.do_normalize {
                    *value = (*value - self.image_mean[c]) / self.image_std[c];
                }
            }
        }

        Ok(PixelValues {
            height: out_h,
            width: out_w,
            data,
        })
    }
}

/// Target `(width, height)` of the resize step.
fn resize_target(size: SizeSpec, width: u32, height: u32) -> (u32, u32) {
    let scale_short = |short: u32, long: u32, edge: u32| {
        let scaled = u64::from(long) * u64::from(edge) / u64::from(short);
        u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
    };
    match size {
        SizeSpec::Edge(edge) | SizeSpec::ShortestEdge { shortest_edge: edge } => {
            if width <= height {
                (edge, scale_short(width, height, edge))
            } else {
                (scale_short(height, width, edge), edge)
            }
        }
        SizeSpec::Exact { height, width } => (width, height),
    }
}

/// CLIP ViT-L/14 vision tower run through ONNX Runtime.
///
/// Expected files in `model_cache_dir/clip-vit-large-patch14/`:
///   - `vision_model.onnx`
///   - `preprocessor_config.json`
///
/// Returns the `image_embeds` output as is, without L2 normalization; the
/// projection head was trained on these raw features.
pub struct ClipExtractor {
    session: Mutex<Session>,
    preprocessor: ClipPreprocessor,
    input_name: String,
    output_name: String,
    dimension: usize,
}

impl ClipExtractor {
    /// Load the vision model from disk and measure its output dimension.
    ///
    /// If the model files are not found, returns an error instructing the user
    /// to run `kural-lens model download`.
    pub fn new(model_cache_dir: &Path, device: Device) -> anyhow::Result<Self> {
        let base = model_cache_dir.join(CLIP_MODEL_SUBDIR);
        let onnx_path = base.join(CLIP_ONNX_FILE);
        if !onnx_path.exists() {
            anyhow::bail!(
                "CLIP model not found at {}. Run 'kural-lens model download' first.",
                base.display()
            );
        }
        let preprocessor_bytes = fs::read(base.join(CLIP_PREPROCESSOR_FILE))
            .with_context(|| format!("Missing {CLIP_PREPROCESSOR_FILE}"))?;
        let preprocessor = ClipPreprocessor::from_json(&preprocessor_bytes)?;

        if device != Device::Cpu {
            warn!(
                device = %device,
                "CLIP extractor runs on ONNX Runtime's CPU execution provider"
            );
        }

        let mut session = Session::builder()
            .map_err(|e| anyhow::anyhow!("Failed to create ONNX session builder: {e}"))?
            .commit_from_file(&onnx_path)
            .map_err(|e| anyhow::anyhow!("Failed to load CLIP vision model: {e}"))?;

        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .context("CLIP vision model has no inputs")?;
        let output_name = session
            .outputs()
            .iter()
            .map(|output| output.name())
            .find(|name| *name == IMAGE_EMBEDS_OUTPUT)
            .or_else(|| session.outputs().first().map(|output| output.name()))
            .map(str::to_string)
            .context("CLIP vision model has no outputs")?;

        let blank = preprocessor.preprocess(&DynamicImage::new_rgb8(224, 224))?;
        let dimension = run_vision(&mut session, &input_name, &output_name, blank)
            .context("CLIP vision model failed on a blank image")?
            .len();
        debug!(
            dimension = dimension,
            output = %output_name,
            "CLIP vision model loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            preprocessor,
            input_name,
            output_name,
            dimension,
        })
    }
}

impl ImageFeatureExtractor for ClipExtractor {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn extract(&self, image: &DynamicImage) -> anyhow::Result<Vec<f32>> {
        let pixels = self.preprocessor.preprocess(image)?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("CLIP extractor lock poisoned"))?;
        run_vision(&mut session, &self.input_name, &self.output_name, pixels)
            .context("Failed to encode image with CLIP")
    }
}

/// Run one preprocessed image through the vision tower and return its single
/// feature row.
fn run_vision(
    session: &mut Session,
    input_name: &str,
    output_name: &str,
    pixels: PixelValues,
) -> anyhow::Result<Vec<f32>> {
    let shape = [1, 3, pixels.height, pixels.width];
    let input = Tensor::from_array((shape, pixels.data))
        .map_err(|e| anyhow::anyhow!("Failed to build CLIP input tensor: {e}"))?;
    let outputs = session
        .run(ort::inputs![input_name => input])
        .map_err(|e| anyhow::anyhow!("CLIP vision inference failed: {e}"))?;
    let output = outputs
        .get(output_name)
        .with_context(|| format!("CLIP vision model produced no '{output_name}' output"))?;
    let (shape, data) = output
        .try_extract_tensor::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read CLIP output: {e}"))?;
    if shape.len() != 2 || shape[0] != 1 {
        anyhow::bail!("unexpected CLIP output shape {:?}", &shape[..]);
    }
    Ok(data.to_vec())
}

/// [`ExtractorProvider`] for [`ClipExtractor`] reading from a model cache directory.
#[derive(Debug, Clone)]
pub struct ClipProvider {
    model_cache_dir: PathBuf,
}

impl ClipProvider {
    pub fn new(model_cache_dir: PathBuf) -> Self {
        Self { model_cache_dir }
    }
}

impl ExtractorProvider for ClipProvider {
    fn load(&self, device: Device) -> anyhow::Result<Box<dyn ImageFeatureExtractor>> {
        Ok(Box::new(ClipExtractor::new(&self.model_cache_dir, device)?))
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};
    use kural_lens_test_util::model::model_dir;

    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(rgb)))
    }

    #[test]
    fn preprocessor_reads_both_size_styles() {
        let legacy = ClipPreprocessor::from_json(
            br#"{"size": 224, "crop_size": 224, "resample": 3, "do_resize": true}"#,
        )
        .unwrap();
        assert_eq!(legacy.size, SizeSpec::Edge(224));
        assert_eq!(legacy.crop_size, SizeSpec::Edge(224));

        let current = ClipPreprocessor::from_json(
            br#"{"size": {"shortest_edge": 224}, "crop_size": {"height": 224, "width": 224}}"#,
        )
        .unwrap();
        assert_eq!(current.size, SizeSpec::ShortestEdge { shortest_edge: 224 });
        assert_eq!(
            current.crop_size,
            SizeSpec::Exact {
                height: 224,
                width: 224
            }
        );
        assert_eq!(current.image_mean, ClipPreprocessor::default().image_mean);
    }

    #[test]
    fn preprocessor_rejects_bad_statistics() {
        assert!(ClipPreprocessor::from_json(br#"{"image_mean": [0.5]}"#).is_err());
        assert!(ClipPreprocessor::from_json(br#"{"image_std": [0.5, 0.0, 0.5]}"#).is_err());
        assert!(ClipPreprocessor::from_json(b"not json").is_err());
    }

    #[test]
    fn resize_keeps_aspect_ratio_on_shortest_edge() {
        let edge = SizeSpec::ShortestEdge { shortest_edge: 224 };
        assert_eq!(resize_target(edge, 320, 200), (358, 224));
        assert_eq!(resize_target(edge, 100, 400), (224, 896));
        assert_eq!(
            resize_target(SizeSpec::Exact { height: 10, width: 20 }, 320, 200),
            (20, 10)
        );
    }

    #[test]
    fn preprocess_crops_to_chw_and_normalizes() {
        let preprocessor = ClipPreprocessor::default();
        let pixels = preprocessor
            .preprocess(&solid(320, 200, [255, 128, 0]))
            .unwrap();

        assert_eq!((pixels.height, pixels.width), (224, 224));
        assert_eq!(pixels.data.len(), 3 * 224 * 224);

        let plane = 224 * 224;
        for (c, raw) in [255f32, 128.0, 0.0].into_iter().enumerate() {
            let expected =
                (raw / 255.0 - preprocessor.image_mean[c]) / preprocessor.image_std[c];
            let centre = pixels.data[c * plane + 112 * 224 + 112];
            assert!((centre - expected).abs() < 1e-4, "channel {c}: {centre}");
        }
    }

    #[test]
    fn preprocess_pads_images_smaller_than_the_crop() {
        let preprocessor = ClipPreprocessor {
            do_resize: false,
            do_rescale: false,
            do_normalize: false,
            crop_size: SizeSpec::Edge(4),
            ..ClipPreprocessor::default()
        };
        let pixels = preprocessor.preprocess(&solid(2, 2, [9, 9, 9])).unwrap();

        let red: Vec<f32> = pixels.data[..16].to_vec();
        assert_eq!(
            red,
            vec![
                0.0, 0.0, 0.0, 0.0, //
                0.0, 9.0, 9.0, 0.0, //
                0.0, 9.0, 9.0, 0.0, //
                0.0, 0.0, 0.0, 0.0,
            ]
        );
    }

    #[test]
    fn preprocess_rejects_empty_image() {
        let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 0));
        assert!(ClipPreprocessor::default().preprocess(&empty).is_err());
    }

    #[test]
    fn missing_model_points_to_download_command() {
        let tmp = tempfile::tempdir().unwrap();
        let err = ClipExtractor::new(tmp.path(), Device::Cpu).err().unwrap();
        assert!(err.to_string().contains("kural-lens model download"));
    }

    #[test]
    #[ignore = "requires the CLIP model in KURAL_LENS_MODEL_DIR"]
    fn clip_features_are_768_dimensional() {
        let extractor = ClipExtractor::new(&model_dir(), Device::Cpu).unwrap();
        assert_eq!(extractor.dimension(), 768);

        let features = extractor.extract(&solid(320, 200, [200, 120, 40])).unwrap();
        assert_eq!(features.len(), 768);
    }

    #[test]
    #[ignore = "requires the CLIP model in KURAL_LENS_MODEL_DIR"]
    fn clip_features_are_not_normalized() {
        let extractor = ClipExtractor::new(&model_dir(), Device::Cpu).unwrap();
        for rgb in [[200, 120, 40], [5, 90, 200]] {
            let features = extractor.extract(&solid(256, 256, rgb)).unwrap();
            let norm = features.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() > 1e-2, "features look unit-norm: {norm}");
        }
    }

    #[test]
    #[ignore = "requires the CLIP model in KURAL_LENS_MODEL_DIR"]
    fn clip_features_are_deterministic() {
        let extractor = ClipExtractor::new(&model_dir(), Device::Cpu).unwrap();
        let image = solid(64, 64, [5, 90, 200]);
        assert_eq!(
            extractor.extract(&image).unwrap(),
            extractor.extract(&image).unwrap()
        );
    }
}
