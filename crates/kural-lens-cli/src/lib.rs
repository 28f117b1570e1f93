pub mod cli;
pub mod commands;
pub mod logging;
pub mod render;

#[cfg(test)]
pub mod test_util;

use std::io::Write;

use clap::Parser;

use kural_lens_lib::output::ConsoleIO;
use kural_lens_lib::runtime::Runtime;

use cli::{Cli, Command, ModelCommand};

/// Main CLI entry point. Parses args and dispatches to the appropriate command.
pub fn try_run<OUT, ERR>(
    args: &[&str],
    runtime: &Runtime,
    io: &mut dyn ConsoleIO<OUT, ERR>,
) -> anyhow::Result<()>
where
    OUT: Write,
    ERR: Write,
{
    let cli = Cli::try_parse_from(args)?;

    match cli.command {
        Command::Find {
            image,
            pal,
            top_k,
            json,
            device,
        } => commands::find::run_find(
            &commands::find::FindArgs {
                image: &image,
                pal: &pal,
                top_k,
                json,
                device,
            },
            runtime,
            io,
        ),
        Command::Status { device } => commands::status::run_status(device, runtime, io),
        Command::Model { model_command } => match model_command {
            ModelCommand::Download { force } => {
                commands::model::run_model_download(force, runtime, io)
            }
        },
    }
}
