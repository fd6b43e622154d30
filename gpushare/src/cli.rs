//! CLI argument parsing for gpushare

use std::path::PathBuf;

use clap::Parser;

/// gpushare - oversubscribing GPU device plugin with XID health monitoring
#[derive(Debug, Parser)]
#[command(name = "gpushare")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/gpushare/config.yaml")]
    pub config: PathBuf,

    /// Virtual devices advertised per physical GPU (integer >= 1, default 1)
    #[arg(long, env = "NUMBER_CONTAINERS_PER_GPU")]
    pub containers_per_gpu: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GPUSHARE_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "GPUSHARE_LOG_JSON")]
    pub log_json: bool,

    /// Print the advertised virtual devices as JSON and exit
    #[arg(long)]
    pub list: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["gpushare"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/etc/gpushare/config.yaml");
        assert_eq!(cli.log_level, "info");
        assert!(!cli.log_json);
        assert!(!cli.list);
    }

    #[test]
    fn test_cli_custom_config() {
        let cli = Cli::try_parse_from(["gpushare", "-c", "/custom/config.yaml"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/custom/config.yaml");
    }

    #[test]
    fn test_cli_containers_per_gpu_is_raw() {
        // Validation happens in OversubscriptionFactor, not in clap
        let cli = Cli::try_parse_from(["gpushare", "--containers-per-gpu", "abc"]).unwrap();
        assert_eq!(cli.containers_per_gpu.as_deref(), Some("abc"));
    }

    #[test]
    fn test_cli_list() {
        let cli = Cli::try_parse_from(["gpushare", "--list"]).unwrap();
        assert!(cli.list);
    }
}
