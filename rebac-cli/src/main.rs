use clap::Parser;
use rebac_cli::{init_tracing, run, Cli, Outcome};
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            return ExitCode::from(2);
        }
    };
    init_tracing(&config.logging.level);

    match run(&cli, config).await {
        Ok(Outcome::Success) => ExitCode::SUCCESS,
        Ok(Outcome::Denied) => ExitCode::from(1),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}
