//! dev-runner CLI - start, stop and watch a local development web server

mod cli;
mod commands;
mod logging;
mod settings;

use clap::Parser;
use cli::Cli;
use console::style;
use devrunner::SupervisorError;
use settings::{FileConfig, Settings};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    logging::init_tracing(cli.global.verbose, cli.global.log_format);

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received");
                token.cancel();
            }
        }
    });

    let settings = match resolve(&cli) {
        Ok(settings) => settings,
        Err(e) => return report(e, None).await,
    };
    match commands::dispatch(cli.subcommand(), &settings, token).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report(e, Some(&settings)).await,
    }
}

fn resolve(cli: &Cli) -> anyhow::Result<Settings> {
    let file = FileConfig::load(cli.global.config.as_deref())?;
    Settings::resolve(file, std::env::vars(), &cli.global)
}

async fn report(err: anyhow::Error, settings: Option<&Settings>) -> ExitCode {
    let Some(e) = err.downcast_ref::<SupervisorError>() else {
        eprintln!("{} {:#}", style("error:").red().bold(), err);
        return ExitCode::FAILURE;
    };

    if e.is_warning() {
        eprintln!("{} {}", style("warning:").yellow().bold(), e);
        return ExitCode::SUCCESS;
    }

    eprintln!("{} {}", style("error:").red().bold(), e);
    let tail = match (e.log_tail(), settings) {
        (Some(tail), _) => tail.to_vec(),
        (None, Some(settings)) if e.is_fatal() => commands::failure_tail(settings).await,
        (None, _) => Vec::new(),
    };
    if !tail.is_empty() {
        eprintln!("{}", style("Last log lines:").dim());
        for line in tail {
            eprintln!("  {}", line);
        }
    }

    if let SupervisorError::PortConflict { .. } = e {
        eprintln!(
            "{} run `dev-runner stop` or `dev-runner start --force` to free the port",
            style("hint:").cyan()
        );
    } else if e.is_recoverable() {
        eprintln!(
            "{} the server may still come up; check `dev-runner status` and `dev-runner logs`",
            style("hint:").cyan()
        );
    }
    ExitCode::FAILURE
}
