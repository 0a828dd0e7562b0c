//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multi-tenant Kubernetes API gateway with per-user client certificates
#[derive(Parser, Debug)]
#[command(name = "kube-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "KUBE_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "KUBE_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "KUBE_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "KUBE_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "KUBE_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Validate the configuration and build a transport for every binding
    Check,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_server_mode() {
        let cli = Cli::parse_from(["kube-gateway"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_check_with_global_config() {
        let cli = Cli::parse_from(["kube-gateway", "check", "--config", "gateway.yaml"]);
        assert!(matches!(cli.command, Some(Command::Check)));
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("gateway.yaml")));
    }

    #[test]
    fn parses_server_overrides() {
        let cli = Cli::parse_from(["kube-gateway", "--port", "8443", "--host", "0.0.0.0", "serve"]);
        assert_eq!(cli.port, Some(8443));
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert!(matches!(cli.command, Some(Command::Serve)));
    }
}
