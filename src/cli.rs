// CLI module - command-line argument parsing
//
// All flags are optional; when none are given the configuration is read from
// the environment. See Config::resolve for the precedence rules.

use crate::config::VERSION;
use clap::Parser;
use std::path::PathBuf;

const AFTER_HELP: &str = "\
If no arguments are provided, the configuration will be read from the
environment variables:
  - VPF730_LOCAL_DB
  - VPF730_QUEUE_DB
  - VPF730_PORT
  - VPF730_ENDPOINT
  - VPF730_API_KEY
For variable descriptions see the CLI arguments above.";

/// vpf-730 - log measurements from a Biral VPF-730 present weather sensor
#[derive(Debug, Parser)]
#[command(name = "vpf-730")]
#[command(version = VERSION)]
#[command(about = "Read a VPF-730 sensor and deliver measurements locally and to an HTTP endpoint")]
#[command(after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to the local database
    #[arg(long)]
    pub local_db: Option<PathBuf>,

    /// Path to the queue database
    #[arg(long)]
    pub queue_db: Option<PathBuf>,

    /// Serial port the VPF-730 sensor is connected to, e.g. /dev/ttyS0
    #[arg(long)]
    pub serial_port: Option<String>,

    /// API endpoint to send the data to, e.g. https://api.example.com/. The
    /// API key must be provided as an environment variable VPF730_API_KEY
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Path to an .ini config file (overrides all previous CLI options)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_all_flags() {
        let cli = Cli::parse_from([
            "vpf-730",
            "--local-db",
            "local.db",
            "--queue-db",
            "queue.db",
            "--serial-port",
            "/dev/ttyS0",
            "--endpoint",
            "https://example.com",
        ]);
        assert_eq!(cli.local_db, Some(PathBuf::from("local.db")));
        assert_eq!(cli.queue_db, Some(PathBuf::from("queue.db")));
        assert_eq!(cli.serial_port.as_deref(), Some("/dev/ttyS0"));
        assert_eq!(cli.endpoint.as_deref(), Some("https://example.com"));
        assert_eq!(cli.config, None);
    }

    #[test]
    fn test_cli_short_config_flag() {
        let cli = Cli::parse_from(["vpf-730", "-c", "config.ini"]);
        assert_eq!(cli.config, Some(PathBuf::from("config.ini")));
    }

    #[test]
    fn test_cli_no_flags() {
        let cli = Cli::parse_from(["vpf-730"]);
        assert!(cli.serial_port.is_none());
        assert!(cli.config.is_none());
    }
}
