//! sqlcluster -- one node of a replicated SQL cluster.
//!
//! Crash-only design: every startup is a recovery. The local database is
//! rebuilt from the replicated log, and SIGTERM/SIGINT end the process
//! without cleanup unless graceful shutdown is configured.

use std::process::ExitCode;

use tracing::info;

use sqlcluster::cli::{self, Invocation};
use sqlcluster::errors::ConfigError;
use sqlcluster::{lifecycle, logging, SqlNode, Supervisor};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match cli::parse(std::env::args_os()) {
        Ok(Invocation::Run(config)) => config,
        Ok(Invocation::Help(text)) => {
            println!("{text}");
            return ExitCode::SUCCESS;
        }
        Err(ConfigError::Usage { message }) => {
            eprintln!("{message}\n");
            eprintln!("{}", cli::usage());
            return ExitCode::FAILURE;
        }
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(config.verbosity, config.tuning.logging.format);

    if config.tuning.observability.metrics {
        sqlcluster::metrics::init_metrics();
        sqlcluster::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    info!(
        listen = %config.listen,
        transport = ?config.transport_kind(),
        directory = %config.directory.display(),
        join = %config.join,
        "Starting sqlcluster node"
    );

    match Supervisor::new(config, SqlNode)
        .run(lifecycle::shutdown_signal())
        .await
    {
        Ok(()) => {
            info!("sqlcluster shut down");
            ExitCode::SUCCESS
        }
        Err(_) => ExitCode::FAILURE,
    }
}
