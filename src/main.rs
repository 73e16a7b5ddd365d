//! `coronetd`: the process entry point (spec §6). Parses the CLI
//! contract, installs signal handlers, loads the topology, and runs the
//! node until a graceful shutdown completes. Exit code 0 on clean
//! shutdown, 1 on init failure (spec §6) — `daemon` fork failure exits 1
//! from inside `Application::run` itself, per the original.

use clap::Parser;
use coronet::app::Application;
use coronet::cli::Args;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let termination = match coronet::signals::install() {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            std::process::exit(1);
        }
    };

    let app = match Application::init(&args, termination) {
        Ok(app) => app,
        Err(e) => {
            tracing::error!(error = %e, "init failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run(args.daemon) {
        tracing::error!(error = %e, "run failed");
        std::process::exit(1);
    }
}
