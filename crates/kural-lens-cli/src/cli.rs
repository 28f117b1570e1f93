use std::path::PathBuf;

use clap::{Parser, Subcommand};

use kural_lens_lib::config::{DEFAULT_TOP_K, MAX_TOP_K};
use kural_lens_lib::model::Device;

#[derive(Parser, Debug)]
#[command(
    name = "kural-lens",
    about = "Find the Tirukkural couplets that resonate with a photograph"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Find the Kurals closest in meaning to an image.
    Find {
        /// Path to the image (PNG, JPEG or WebP).
        image: PathBuf,
        /// Restrict results to one book: all, virtue, wealth or love.
        #[arg(long, default_value = "all")]
        pal: String,
        /// Number of Kurals to return.
        #[arg(short = 'k', long, default_value_t = DEFAULT_TOP_K, value_parser = parse_top_k)]
        top_k: usize,
        /// Print results as a JSON array instead of text cards.
        #[arg(long)]
        json: bool,
        /// Device for the projection head: cpu, cuda or cuda:N.
        #[arg(long, default_value = "cpu")]
        device: Device,
    },

    /// Load every artifact and report what was loaded.
    Status {
        /// Device for the projection head: cpu, cuda or cuda:N.
        #[arg(long, default_value = "cpu")]
        device: Device,
    },

    /// Manage the image feature extractor model.
    Model {
        #[command(subcommand)]
        model_command: ModelCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ModelCommand {
    /// Download the CLIP vision model files from Hugging Face.
    Download {
        /// Force re-download even if files already exist.
        #[arg(long)]
        force: bool,
    },
}

fn parse_top_k(value: &str) -> Result<usize, String> {
    let k: usize = value
        .parse()
        .map_err(|_| format!("`{value}` is not a whole number"))?;
    if (1..=MAX_TOP_K).contains(&k) {
        Ok(k)
    } else {
        Err(format!("must be between 1 and {MAX_TOP_K}"))
    }
}
