//! Kubernetes Gateway - per-user client certificate proxy for many clusters

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use kube_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::{Gateway, check_bindings},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Check) => run_check(&cli).await,
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            Some(config)
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Validate every binding without serving
async fn run_check(cli: &Cli) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };

    let checks = match check_bindings(&config).await {
        Ok(checks) => checks,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    if checks.is_empty() {
        println!("No bindings configured.");
        return ExitCode::SUCCESS;
    }

    let mut failed = 0;
    for check in &checks {
        match &check.result {
            Ok(()) => println!("✅ {}@{}", check.user, check.cluster),
            Err(e) => {
                failed += 1;
                println!("❌ {}@{} - {e}", check.user, check.cluster);
            }
        }
    }

    println!("\n{} binding(s), {failed} failed", checks.len());
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    let Some(config) = load_config(&cli) else {
        return ExitCode::FAILURE;
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        auth = config.auth.enabled,
        "Starting Kubernetes Gateway"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
