use std::io::Write;

use tracing::debug;

use kural_lens_lib::context::KuralContext;
use kural_lens_lib::index::VectorIndex;
use kural_lens_lib::model::Device;
use kural_lens_lib::output::ConsoleIO;
use kural_lens_lib::runtime::Runtime;

/// Run the `kural-lens status` command.
pub fn run_status<OUT, ERR>(
    device: Device,
    runtime: &Runtime,
    io: &mut dyn ConsoleIO<OUT, ERR>,
) -> anyhow::Result<()>
where
    OUT: Write,
    ERR: Write,
{
    debug!(command = "status", device = %device, "Loading models for status");
    runtime.state.load_models(device)?;
    let models = runtime.state.models()?;
    let config = models.projection.config();

    writeln!(
        io.stdout(),
        "Artifacts: {}",
        runtime.context.artifact_dir().display()
    )?;
    writeln!(io.stdout(), "Device: {}", models.device)?;
    writeln!(
        io.stdout(),
        "Index: {} vectors of dimension {}",
        models.index.ntotal(),
        models.index.dimension()
    )?;
    writeln!(io.stdout(), "Metadata: {} Kurals", models.kurals.len())?;
    writeln!(
        io.stdout(),
        "Projection: {} -> {} -> {}",
        config.in_dim,
        config.hidden_dim,
        config.out_dim
    )?;
    Ok(())
}
