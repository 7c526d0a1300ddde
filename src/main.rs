mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();
    if let Err(err) = cli::execute(args) {
        eprintln!("error: {err:#}");
        std::process::exit(cli::exit_code(&err));
    }
}
