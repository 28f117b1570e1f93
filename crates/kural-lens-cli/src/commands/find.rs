use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use kural_lens_lib::corpus::parse_pal_filter;
use kural_lens_lib::model::Device;
use kural_lens_lib::output::ConsoleIO;
use kural_lens_lib::pipeline::retrieve::retrieve;
use kural_lens_lib::runtime::Runtime;

use crate::render::{NO_MATCH, render_card, render_header};

/// Arguments of `kural-lens find`.
pub struct FindArgs<'a> {
    pub image: &'a Path,
    pub pal: &'a str,
    pub top_k: usize,
    pub json: bool,
    pub device: Device,
}

/// Run the `kural-lens find` command.
pub fn run_find<OUT, ERR>(
    args: &FindArgs<'_>,
    runtime: &Runtime,
    io: &mut dyn ConsoleIO<OUT, ERR>,
) -> anyhow::Result<()>
where
    OUT: Write,
    ERR: Write,
{
    let filter = parse_pal_filter(args.pal)?;
    debug!(
        command = "find",
        image = %args.image.display(),
        top_k = args.top_k,
        filter = ?filter,
        device = %args.device,
        "Finding Kurals"
    );
    runtime.state.load_models(args.device)?;

    let image = image::open(args.image)
        .with_context(|| format!("Failed to read image {}", args.image.display()))?;
    let matches = retrieve(&runtime.state, &image, args.top_k, filter)?;
    debug!(command = "find", matched = matches.len(), "Kurals retrieved");

    if args.json {
        serde_json::to_writer_pretty(&mut *io.stdout(), &matches)?;
        writeln!(io.stdout())?;
        return Ok(());
    }

    if matches.is_empty() {
        write!(io.stdout(), "{NO_MATCH}")?;
        return Ok(());
    }

    write!(io.stdout(), "{}", render_header(matches.len()))?;
    for (i, m) in matches.iter().enumerate() {
        writeln!(io.stdout())?;
        render_card(io.stdout(), m, i + 1)?;
    }
    Ok(())
}
