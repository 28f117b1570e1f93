use std::path::PathBuf;

/// Return the CLIP model cache directory for tests.
///
/// Checks `KURAL_LENS_MODEL_DIR` first, falling back to `~/.kural-lens/models/`.
pub fn model_dir() -> PathBuf {
    std::env::var("KURAL_LENS_MODEL_DIR").map_or_else(
        |_| {
            dirs::home_dir()
                .expect("home dir")
                .join(".kural-lens")
                .join("models")
        },
        PathBuf::from,
    )
}
