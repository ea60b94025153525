use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "sitewatch")]
#[command(version)]
#[command(about = "Debug/observability server: telemetry aggregation, live dashboards, scheduled cross-browser checks")]
pub struct Args {
    /// Port for the HTTP/WebSocket API
    #[arg(long)]
    pub port: Option<u16>,

    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Base URL of the monitored application the synthetic checks target
    #[arg(long)]
    pub base_url: Option<String>,

    /// Browser engines to drive (comma-separated, e.g. chromium,firefox)
    #[arg(long, value_delimiter = ',')]
    pub browsers: Option<Vec<String>>,

    /// Interval between automatic test cycles, in milliseconds
    #[arg(long)]
    pub auto_run_interval_ms: Option<u64>,

    /// Path to the SQLite database file
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Disable the automatic test scheduler (telemetry ingestion only)
    #[arg(long)]
    pub no_scheduler: bool,

    /// Log filter (overridden by RUST_LOG when set)
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_unset() {
        let args = Args::parse_from(["sitewatch"]);
        assert!(args.port.is_none());
        assert!(args.config.is_none());
        assert!(!args.no_scheduler);
        assert_eq!(args.log_filter, "info");
    }

    #[test]
    fn test_browser_list_parses_commas() {
        let args = Args::parse_from(["sitewatch", "--browsers", "chromium,firefox"]);
        assert_eq!(
            args.browsers,
            Some(vec!["chromium".to_string(), "firefox".to_string()])
        );
    }

    #[test]
    fn test_no_scheduler_flag() {
        let args = Args::parse_from(["sitewatch", "--no-scheduler"]);
        assert!(args.no_scheduler);
    }
}
