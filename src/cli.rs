//! CLI argument parsing for perfalert

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "perfalert")]
#[command(version)]
#[command(about = "Detect regressions in push-ordered performance series", long_about = None)]
pub struct Cli {
    /// Analysis configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,

    /// Directory of exported samples (<dir>/<branch>/<platform>/<test>.json)
    #[arg(short = 'd', long = "data-dir", value_name = "DIR")]
    pub data_dir: PathBuf,

    /// Only analyze this branch (repeatable)
    #[arg(short = 'b', long = "branch", value_name = "BRANCH")]
    pub branches: Vec<String>,

    /// Only analyze this test (repeatable)
    #[arg(short = 't', long = "test", value_name = "TEST")]
    pub tests: Vec<String>,

    /// Oldest sample to consider, as a Unix timestamp (default: now - history_secs)
    #[arg(long = "start-time", value_name = "TS")]
    pub start_time: Option<i64>,

    /// Record warnings without emitting them
    #[arg(long)]
    pub catchup: bool,

    /// Series processed in parallel (default: available cores)
    #[arg(short = 'j', long = "jobs", value_name = "N")]
    pub jobs: Option<usize>,

    /// Write events here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_minimal_arguments() {
        let cli = Cli::parse_from(["perfalert", "--config", "a.toml", "--data-dir", "data"]);
        assert_eq!(cli.config, PathBuf::from("a.toml"));
        assert_eq!(cli.data_dir, PathBuf::from("data"));
        assert!(cli.branches.is_empty());
        assert!(!cli.catchup);
        assert!(cli.jobs.is_none());
    }

    #[test]
    fn test_cli_repeatable_filters() {
        let cli = Cli::parse_from([
            "perfalert", "-c", "a.toml", "-d", "data", "-b", "mozilla-central", "-b", "try", "-t", "Ts",
        ]);
        assert_eq!(cli.branches, vec!["mozilla-central", "try"]);
        assert_eq!(cli.tests, vec!["Ts"]);
    }

    #[test]
    fn test_cli_run_options() {
        let cli = Cli::parse_from([
            "perfalert", "-c", "a.toml", "-d", "data", "--start-time", "1300000000", "--catchup", "-j", "4", "-o",
            "events.jsonl",
        ]);
        assert_eq!(cli.start_time, Some(1_300_000_000));
        assert!(cli.catchup);
        assert_eq!(cli.jobs, Some(4));
        assert_eq!(cli.output, Some(PathBuf::from("events.jsonl")));
    }

    #[test]
    fn test_cli_verbose_conflicts_with_quiet() {
        let result = Cli::try_parse_from(["perfalert", "-c", "a.toml", "-d", "data", "-v", "-q"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_requires_config() {
        assert!(Cli::try_parse_from(["perfalert", "-d", "data"]).is_err());
    }
}
