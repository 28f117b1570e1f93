//! Projection head mapping extractor features into the shared Kural space.
//!
//! Architecture: `Linear(in → hidden)` → `LayerNorm(hidden)` → `GELU` →
//! `Dropout(0.1)` → `Linear(hidden → out)` → L2 normalize.
//!
//! The L2 normalization means that after projection, cosine similarity equals
//! the inner product, which is what the flat index computes.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Context;
use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{Dropout, LayerNorm, Linear, VarBuilder};
use safetensors::SafeTensors;
use safetensors::tensor::{Dtype, TensorView};

use crate::config::{
    DROPOUT_PROB, HIDDEN_DIM, IMG_IN_DIM, IMG_PROJ_PREFIX, LAYER_NORM_EPS, NORMALIZE_EPS, OUT_DIM,
};
use crate::error::KuralError;

const LABEL: &str = "projection weights";

/// Metadata keys of the optional configuration record in the weights file.
const KEY_IN_DIM: &str = "img_in_dim";
const KEY_OUT_DIM: &str = "out_dim";
const KEY_HIDDEN_DIM: &str = "hidden_dim";

/// Layer dimensions of a [`ProjectionHead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionConfig {
    pub in_dim: usize,
    pub out_dim: usize,
    pub hidden_dim: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            in_dim: IMG_IN_DIM,
            out_dim: OUT_DIM,
            hidden_dim: HIDDEN_DIM,
        }
    }
}

impl ProjectionConfig {
    /// Read dimensions from a safetensors `__metadata__` record.
    ///
    /// Missing keys fall back to the defaults; present but unparsable values
    /// are rejected.
    pub fn from_metadata(metadata: Option<&HashMap<String, String>>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let read = |key: &str, default: usize| -> anyhow::Result<usize> {
            match metadata.and_then(|m| m.get(key)) {
                None => Ok(default),
                Some(raw) => match raw.trim().parse::<usize>() {
                    Ok(value) if value > 0 => Ok(value),
                    _ => Err(KuralError::InvalidArtifact {
                        label: LABEL,
                        reason: format!("config value {key}={raw:?} is not a positive integer"),
                    }
                    .into()),
                },
            }
        };
        Ok(Self {
            in_dim: read(KEY_IN_DIM, defaults.in_dim)?,
            out_dim: read(KEY_OUT_DIM, defaults.out_dim)?,
            hidden_dim: read(KEY_HIDDEN_DIM, defaults.hidden_dim)?,
        })
    }

    /// The configuration record written alongside the weights.
    pub fn to_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (KEY_IN_DIM.to_string(), self.in_dim.to_string()),
            (KEY_OUT_DIM.to_string(), self.out_dim.to_string()),
            (KEY_HIDDEN_DIM.to_string(), self.hidden_dim.to_string()),
        ])
    }

    /// Tensor names (relative to the head's prefix) and their expected shapes.
    ///
    /// Names follow the `nn.Sequential` layout the weights were trained with:
    /// index 0 is the first linear layer, 1 the layer norm, 4 the output layer.
    fn expected_tensors(&self) -> [(&'static str, Vec<usize>); 6] {
        [
            ("net.0.weight", vec![self.hidden_dim, self.in_dim]),
            ("net.0.bias", vec![self.hidden_dim]),
            ("net.1.weight", vec![self.hidden_dim]),
            ("net.1.bias", vec![self.hidden_dim]),
            ("net.4.weight", vec![self.out_dim, self.hidden_dim]),
            ("net.4.bias", vec![self.out_dim]),
        ]
    }
}

/// Raw parameters of a [`ProjectionHead`], in `nn.Sequential` order.
#[derive(Debug, Clone)]
pub struct ProjectionWeights {
    pub fc1_weight: Tensor,
    pub fc1_bias: Tensor,
    pub norm_weight: Tensor,
    pub norm_bias: Tensor,
    pub fc2_weight: Tensor,
    pub fc2_bias: Tensor,
}

impl ProjectionWeights {
    fn load(vb: &VarBuilder, config: &ProjectionConfig) -> candle_core::Result<Self> {
        let net = vb.pp("net");
        Ok(Self {
            fc1_weight: net.pp("0").get((config.hidden_dim, config.in_dim), "weight")?,
            fc1_bias: net.pp("0").get(config.hidden_dim, "bias")?,
            norm_weight: net.pp("1").get(config.hidden_dim, "weight")?,
            norm_bias: net.pp("1").get(config.hidden_dim, "bias")?,
            fc2_weight: net.pp("4").get((config.out_dim, config.hidden_dim), "weight")?,
            fc2_bias: net.pp("4").get(config.out_dim, "bias")?,
        })
    }

    fn named(&self) -> [(&'static str, &Tensor); 6] {
        [
            ("net.0.weight", &self.fc1_weight),
            ("net.0.bias", &self.fc1_bias),
            ("net.1.weight", &self.norm_weight),
            ("net.1.bias", &self.norm_bias),
            ("net.4.weight", &self.fc2_weight),
            ("net.4.bias", &self.fc2_bias),
        ]
    }
}

/// Two-layer MLP projecting feature vectors onto the unit sphere of the
/// shared embedding space.
pub struct ProjectionHead {
    config: ProjectionConfig,
    weights: ProjectionWeights,
    fc1: Linear,
    norm: LayerNorm,
    dropout: Dropout,
    fc2: Linear,
    device: Device,
}

impl ProjectionHead {
    /// Assemble a head from already-loaded parameters.
    pub fn new(config: ProjectionConfig, weights: ProjectionWeights) -> Self {
        let device = weights.fc1_weight.device().clone();
        let fc1 = Linear::new(weights.fc1_weight.clone(), Some(weights.fc1_bias.clone()));
        let norm = LayerNorm::new(
            weights.norm_weight.clone(),
            weights.norm_bias.clone(),
            LAYER_NORM_EPS,
        );
        let fc2 = Linear::new(weights.fc2_weight.clone(), Some(weights.fc2_bias.clone()));
        Self {
            config,
            weights,
            fc1,
            norm,
            dropout: Dropout::new(DROPOUT_PROB),
            fc2,
            device,
        }
    }

    /// Load parameters through a [`VarBuilder`] already scoped to the head's prefix.
    pub fn load(vb: &VarBuilder, config: ProjectionConfig) -> candle_core::Result<Self> {
        let weights = ProjectionWeights::load(vb, &config)?;
        Ok(Self::new(config, weights))
    }

    /// Load the image-side head from a safetensors weights file.
    ///
    /// Dimensions come from the file's configuration record (defaults when
    /// absent). Every tensor shape is checked against that configuration before
    /// any weight is materialized, so a mismatch fails here rather than on the
    /// first request.
    pub fn from_file(path: &Path, device: &Device) -> anyhow::Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read projection weights at {}", path.display()))?;

        let tensors = SafeTensors::deserialize(&bytes).map_err(|e| KuralError::InvalidArtifact {
            label: LABEL,
            reason: format!("{e:?}"),
        })?;
        let (_, metadata) =
            SafeTensors::read_metadata(&bytes).map_err(|e| KuralError::InvalidArtifact {
                label: LABEL,
                reason: format!("{e:?}"),
            })?;
        let config = ProjectionConfig::from_metadata(metadata.metadata().as_ref())?;

        for (name, expected) in config.expected_tensors() {
            let full_name = format!("{IMG_PROJ_PREFIX}.{name}");
            let view = tensors
                .tensor(&full_name)
                .map_err(|_| KuralError::InvalidArtifact {
                    label: LABEL,
                    reason: format!("missing tensor {full_name}"),
                })?;
            check_shape(&full_name, &expected, view.shape())?;
        }

        let vb = VarBuilder::from_buffered_safetensors(bytes, DType::F32, device)
            .context("Failed to map projection weights")?;
        let head = Self::load(&vb.pp(IMG_PROJ_PREFIX), config)
            .context("Failed to load projection weights")?;
        Ok(head)
    }

    /// Write the head in the format [`Self::from_file`] reads.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let mut buffers = Vec::with_capacity(6);
        for (name, tensor) in self.weights.named() {
            let values = tensor
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            buffers.push((format!("{IMG_PROJ_PREFIX}.{name}"), tensor.dims().to_vec(), bytes));
        }

        let views = buffers
            .iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.clone(), bytes).map(|view| (name.clone(), view))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to prepare projection weights: {e:?}"))?;

        safetensors::serialize_to_file(views, &Some(self.config.to_metadata()), path)
            .map_err(|e| anyhow::anyhow!("Failed to write {}: {e:?}", path.display()))?;
        Ok(())
    }

    pub fn config(&self) -> ProjectionConfig {
        self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Forward pass. With `train` set, dropout is active and the output is random.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let hidden = self.fc1.forward(xs)?;
        let hidden = self.norm.forward(&hidden)?;
        let hidden = hidden.gelu_erf()?;
        let hidden = self.dropout.forward(&hidden, train)?;
        let out = self.fc2.forward(&hidden)?;
        l2_normalize(&out)
    }

    /// Project a single feature row in evaluation mode.
    pub fn project(&self, features: &[f32]) -> anyhow::Result<Vec<f32>> {
        if features.len() != self.config.in_dim {
            return Err(KuralError::DimensionMismatch {
                what: "projection input".to_string(),
                expected: self.config.in_dim,
                actual: features.len(),
            }
            .into());
        }
        let xs = Tensor::from_slice(features, (1, self.config.in_dim), &self.device)?;
        let projected = self
            .forward(&xs)?
            .squeeze(0)?
            .to_device(&Device::Cpu)?
            .to_vec1::<f32>()?;
        Ok(projected)
    }
}

impl Module for ProjectionHead {
    /// Evaluation-mode forward pass: `(batch, in_dim)` → `(batch, out_dim)`,
    /// each row L2-normalized.
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.forward_t(xs, false)
    }
}

impl fmt::Debug for ProjectionHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ProjectionHead(in_dim={}, hidden_dim={}, out_dim={})",
            self.config.in_dim, self.config.hidden_dim, self.config.out_dim
        )
    }
}

/// Divide each row by its Euclidean norm (floored at a tiny epsilon).
pub fn l2_normalize(xs: &Tensor) -> candle_core::Result<Tensor> {
    let norm = xs
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sqrt()?
        .maximum(f64::from(NORMALIZE_EPS))?;
    xs.broadcast_div(&norm)
}

fn check_shape(name: &str, expected: &[usize], actual: &[usize]) -> Result<(), KuralError> {
    if expected == actual {
        return Ok(());
    }
    let mismatch = |expected, actual| KuralError::DimensionMismatch {
        what: format!("projection tensor {name}"),
        expected,
        actual,
    };
    if expected.len() != actual.len() {
        return Err(mismatch(expected.len(), actual.len()));
    }
    let (e, a) = expected
        .iter()
        .zip(actual)
        .find(|(e, a)| e != a)
        .map_or((0, 0), |(e, a)| (*e, *a));
    Err(mismatch(e, a))
}
