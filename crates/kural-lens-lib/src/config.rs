/// Output dimension of the CLIP ViT-L/14 vision tower.
pub const IMG_IN_DIM: usize = 768;

/// Dimension of the shared image/text embedding space.
pub const OUT_DIM: usize = 512;

/// Hidden width of the projection MLP.
pub const HIDDEN_DIM: usize = 1024;

/// Epsilon used by the projection head's layer norm (PyTorch default).
pub const LAYER_NORM_EPS: f64 = 1e-5;

/// Dropout probability applied between the two projection layers in training mode.
pub const DROPOUT_PROB: f32 = 0.1;

/// Lower bound on the norm used when L2-normalizing, so a zero vector stays zero.
pub const NORMALIZE_EPS: f32 = 1e-12;

/// Default number of Kurals returned per query.
pub const DEFAULT_TOP_K: usize = 5;

/// Largest `top_k` accepted by the command line.
pub const MAX_TOP_K: usize = 10;

/// Multiplier for over-fetching candidates when a Pal filter is active.
///
/// Filtering discards candidates from the other two Pals, so a plain top-k
/// search would under-fill. The search fetches `k * FILTER_OVER_FETCH_MULTIPLIER`
/// candidates and stops as soon as `k` of them match. This is a heuristic: a
/// heavily skewed query can still come back short.
pub const FILTER_OVER_FETCH_MULTIPLIER: usize = 4;

/// Extra candidates fetched without a filter, absorbing invalid index positions.
pub const UNFILTERED_FETCH_MARGIN: usize = 2;

/// Commentaries this short are not worth showing.
pub const MIN_COMMENTARY_CHARS: usize = 20;

/// File name of the pre-built inner-product vector index.
pub const INDEX_FILE: &str = "kural_index.faiss";

/// File name of the corpus metadata, position-aligned with the index.
pub const METADATA_FILE: &str = "kural_metadata.json";

/// File name of the projection head weights.
pub const WEIGHTS_FILE: &str = "projection.safetensors";

/// Tensor name prefix of the image-side projection head inside the weights file.
pub const IMG_PROJ_PREFIX: &str = "img_proj";

/// Subdirectory name under `model_cache_dir` for the CLIP vision model files.
pub const CLIP_MODEL_SUBDIR: &str = "clip-vit-large-patch14";

/// Vision tower ONNX file inside [`CLIP_MODEL_SUBDIR`].
pub const CLIP_ONNX_FILE: &str = "vision_model.onnx";

/// Image preprocessing contract inside [`CLIP_MODEL_SUBDIR`].
pub const CLIP_PREPROCESSOR_FILE: &str = "preprocessor_config.json";
