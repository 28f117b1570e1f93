use std::io::Write;

use tracing::debug;

use kural_lens_lib::config::{CLIP_MODEL_SUBDIR, CLIP_ONNX_FILE, CLIP_PREPROCESSOR_FILE};
use kural_lens_lib::context::KuralContext;
use kural_lens_lib::output::ConsoleIO;
use kural_lens_lib::runtime::Runtime;

/// Hugging Face repository with ONNX exports of CLIP ViT-L/14.
const HF_REPO: &str = "Xenova/clip-vit-large-patch14";

/// Files to download from the Hugging Face repository.
const MODEL_FILES: &[(&str, &str)] = &[
    ("onnx/vision_model.onnx", CLIP_ONNX_FILE),
    ("preprocessor_config.json", CLIP_PREPROCESSOR_FILE),
];

/// Run the `kural-lens model download` command.
pub fn run_model_download<OUT, ERR>(
    force: bool,
    runtime: &Runtime,
    io: &mut dyn ConsoleIO<OUT, ERR>,
) -> anyhow::Result<()>
where
    OUT: Write,
    ERR: Write,
{
    let model_dir = runtime.context.model_cache_dir().join(CLIP_MODEL_SUBDIR);
    debug!(
        command = "model download",
        repo = HF_REPO,
        model_dir = %model_dir.display(),
        force,
        "Preparing CLIP model files"
    );

    if force && model_dir.exists() {
        writeln!(io.stderr(), "Removing existing model files...")?;
        std::fs::remove_dir_all(&model_dir)?;
    }

    if !force
        && MODEL_FILES
            .iter()
            .all(|(_, local)| model_dir.join(local).exists())
    {
        writeln!(
            io.stdout(),
            "Model already downloaded at {}",
            model_dir.display()
        )?;
        return Ok(());
    }

    std::fs::create_dir_all(&model_dir)?;

    writeln!(io.stderr(), "Downloading CLIP ViT-L/14 vision model...")?;
    let api = hf_hub::api::sync::Api::new()?;
    let repo = api.model(HF_REPO.to_string());

    for (remote_path, local_name) in MODEL_FILES {
        let dest = model_dir.join(local_name);
        if dest.exists() {
            writeln!(io.stderr(), "  {local_name} (cached)")?;
            continue;
        }
        writeln!(io.stderr(), "  {local_name}...")?;
        let cached = repo.get(remote_path)?;
        debug!(remote = *remote_path, cached = %cached.display(), "Fetched model file");
        std::fs::copy(&cached, &dest)?;
    }

    writeln!(io.stdout(), "Model downloaded to {}", model_dir.display())?;
    Ok(())
}
