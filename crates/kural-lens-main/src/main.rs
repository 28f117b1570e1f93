use std::process::ExitCode;

use kural_lens_lib::context::RealKuralContext;
use kural_lens_lib::output::StdIO;
use kural_lens_lib::runtime::Runtime;

fn main() -> ExitCode {
    kural_lens_cli::logging::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // clap renders its own help, version and usage errors.
            if let Some(clap_err) = e.downcast_ref::<clap::Error>() {
                let _ = clap_err.print();
                return if clap_err.use_stderr() {
                    ExitCode::from(2)
                } else {
                    ExitCode::SUCCESS
                };
            }
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let context = RealKuralContext::from_env()?;
    let runtime = Runtime::new(context);

    let args: Vec<String> = std::env::args().collect();
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let mut io = StdIO::new();
    kural_lens_cli::try_run(&arg_refs, &runtime, &mut io)
}
