use clap::Parser;
use color_eyre::eyre::Result;
use tracing_subscriber::EnvFilter;

use everything::cli::{self, Args};

fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    init_tracing(args.debug);

    cli::run(args)
}

fn init_tracing(debug: u8) {
    let default = match debug {
        0 => "everything=info",
        1 => "everything=debug",
        _ => "everything=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
