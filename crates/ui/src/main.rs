use std::process::ExitCode;

use clap::Parser;
use polychat::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // stdout carries the conversation, logs go to stderr
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level())
        .with_writer(std::io::stderr)
        .init();

    match polychat::app::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "polychat failed");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}
