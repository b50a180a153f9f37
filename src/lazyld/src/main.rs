use anyhow::Context;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::ffi::OsString;
use std::path::PathBuf;

/// Demand-paging loader for statically linked ELF executables.
#[derive(clap::Parser)]
struct Arguments {
    /// Executable image to load.
    image: PathBuf,

    /// Arguments forwarded to the loaded program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,

    /// Log the materialization of every page.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let arguments = <Arguments as clap::Parser>::parse();

    let level = if arguments.verbose {
        simplelog::LevelFilter::Trace
    } else {
        simplelog::LevelFilter::Info
    };
    TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto)?;

    lazyld::init().context("loader initialization failed")?;

    let never = lazyld::execute(&arguments.image, &arguments.args)
        .with_context(|| format!("failed to start {}", arguments.image.display()))?;
    match never {}
}
