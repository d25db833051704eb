//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// PageFleet - browser worker pool with crash supervision
#[derive(Debug, Parser)]
#[command(
    name = "pf",
    about = "Run page visits across a supervised pool of browser workers",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Visit one or more URLs and store the results
    Visit {
        /// URLs to visit, in order
        #[arg(required = true, value_name = "URL")]
        urls: Vec<String>,

        /// Seconds to keep the browser on each page after loading
        #[arg(short, long)]
        sleep: Option<u64>,

        /// Number of browser workers (overrides config)
        #[arg(short = 'n', long)]
        num_browsers: Option<usize>,

        /// Data directory (overrides config)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Abandon outstanding visits on Ctrl-C instead of finishing them
        #[arg(long)]
        force: bool,
    },

    /// Check that every configured browser driver is installed
    Check,

    /// Print the effective configuration as YAML
    Config,

    /// Print stored result records
    Records {
        /// Data directory (overrides config)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_visit() {
        let cli = Cli::try_parse_from(["pf", "visit", "http://a/", "http://b/", "--sleep", "2", "-n", "3"]).unwrap();
        match cli.command {
            Some(Command::Visit {
                urls,
                sleep,
                num_browsers,
                data_dir,
                force,
            }) => {
                assert_eq!(urls, vec!["http://a/", "http://b/"]);
                assert_eq!(sleep, Some(2));
                assert_eq!(num_browsers, Some(3));
                assert!(data_dir.is_none());
                assert!(!force);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_visit_requires_url() {
        assert!(Cli::try_parse_from(["pf", "visit"]).is_err());
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["pf", "check", "--log-level", "debug", "-c", "pf.yml"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.config, Some(PathBuf::from("pf.yml")));
        assert!(matches!(cli.command, Some(Command::Check)));
    }
}
