use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use fizzbuzz_api::cli::{Args, Command};
use fizzbuzz_api::config::Config;
use fizzbuzz_api::{healthcheck, web};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command() {
        Command::Healthcheck => {
            // Probes stay silent; only the exit status matters.
            let addr = std::env::var("ADDR").unwrap_or_else(|_| Config::default().addr);
            if healthcheck::run(&addr).await {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Command::Serve => {
            init_tracing();
            match run().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "fatal");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn run() -> Result<(), fizzbuzz_api::error::StartupError> {
    let config = Config::from_env()?;
    web::serve(config).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
