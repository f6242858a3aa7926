//! Command-line arguments

use clap::{Parser, ValueEnum};
use cpi_observability::LogFormat;
use std::path::PathBuf;

/// Console log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormatArg {
    Pretty,
    Json,
    Compact,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Compact => LogFormat::Compact,
        }
    }
}

/// BOSH CPI backed by a Docker engine.
///
/// Reads one request document on stdin and writes the response on stdout.
/// Logs go to stderr.
#[derive(Debug, Parser)]
#[command(name = "docker-cpi")]
#[command(version, about = "BOSH CPI that runs VMs as Docker containers")]
pub(crate) struct Cli {
    /// Path to the CPI configuration file
    #[arg(short, long, env = "DOCKER_CPI_CONFIG")]
    pub(crate) config: PathBuf,

    /// Raise log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Override the configured console log format
    #[arg(long, value_enum)]
    pub(crate) log_format: Option<LogFormatArg>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let cli = Cli::parse_from(["docker-cpi", "-c", "/var/vcap/jobs/cpi/config.json", "-vv"]);
        assert_eq!(cli.config, PathBuf::from("/var/vcap/jobs/cpi/config.json"));
        assert_eq!(cli.verbose, 2);
        assert!(cli.log_format.is_none());

        let cli = Cli::parse_from(["docker-cpi", "--config", "cpi.json", "--log-format", "json"]);
        assert_eq!(cli.log_format, Some(LogFormatArg::Json));
    }
}
