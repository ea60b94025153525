//! Server configuration: defaults, optional TOML file overlay, CLI overrides.
//!
//! Precedence: defaults < config file < command-line flags. Knobs that are
//! runtime-mutable (thresholds, scheduler settings) live behind their owning
//! component; this struct is the boot-time snapshot.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Args;
use crate::error::{Result, SitewatchError};
use crate::runner::RunnerConfig;
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// CORS allow-list; `"*"` allows any origin.
    pub allowed_origins: Vec<String>,
    /// Server self-sampling cadence for the performance monitor.
    pub monitor_sample_interval: Duration,
    pub metrics_retention_days: u64,
    pub auto_run_interval_ms: u64,
    pub browsers: Vec<String>,
    /// The monitored application the synthetic checks run against.
    pub target_base_url: String,
    pub test_files: Vec<String>,
    pub critical_path_tests: Vec<String>,
    /// Engine name → WebDriver endpoint.
    pub driver_endpoints: HashMap<String, String>,
    /// The designated interactive element the feature check looks for.
    pub feature_selector: String,
    pub database_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let runner = RunnerConfig::default();
        let scheduler = SchedulerConfig::default();
        ServerConfig {
            port: 4900,
            allowed_origins: vec!["*".to_string()],
            monitor_sample_interval: Duration::from_secs(10),
            metrics_retention_days: 7,
            auto_run_interval_ms: scheduler.auto_run_interval.as_millis() as u64,
            browsers: scheduler.browsers,
            target_base_url: scheduler.base_url,
            test_files: scheduler.test_files,
            critical_path_tests: scheduler.critical_path_tests,
            driver_endpoints: runner.driver_endpoints,
            feature_selector: runner.feature_selector,
            database_path: PathBuf::from("sitewatch.db"),
        }
    }
}

/// TOML overlay; every field optional, absent fields keep their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    port: Option<u16>,
    allowed_origins: Option<Vec<String>>,
    monitor_sample_interval_secs: Option<u64>,
    metrics_retention_days: Option<u64>,
    auto_run_interval_ms: Option<u64>,
    browsers: Option<Vec<String>>,
    target_base_url: Option<String>,
    test_files: Option<Vec<String>>,
    critical_path_tests: Option<Vec<String>>,
    driver_endpoints: Option<HashMap<String, String>>,
    feature_selector: Option<String>,
    database_path: Option<PathBuf>,
}

impl ServerConfig {
    /// Resolve the effective config from defaults, an optional file, and the
    /// command line.
    pub fn resolve(args: &Args) -> Result<Self> {
        let mut config = ServerConfig::default();
        if let Some(path) = &args.config {
            config.apply_file(path)?;
        }
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SitewatchError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let file: ConfigFile = toml::from_str(&text).map_err(|e| {
            SitewatchError::Config(format!("invalid config {}: {e}", path.display()))
        })?;

        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(origins) = file.allowed_origins {
            self.allowed_origins = origins;
        }
        if let Some(secs) = file.monitor_sample_interval_secs {
            self.monitor_sample_interval = Duration::from_secs(secs);
        }
        if let Some(days) = file.metrics_retention_days {
            self.metrics_retention_days = days;
        }
        if let Some(ms) = file.auto_run_interval_ms {
            self.auto_run_interval_ms = ms;
        }
        if let Some(browsers) = file.browsers {
            self.browsers = browsers;
        }
        if let Some(url) = file.target_base_url {
            self.target_base_url = url;
        }
        if let Some(files) = file.test_files {
            self.test_files = files;
        }
        if let Some(critical) = file.critical_path_tests {
            self.critical_path_tests = critical;
        }
        if let Some(endpoints) = file.driver_endpoints {
            self.driver_endpoints.extend(endpoints);
        }
        if let Some(selector) = file.feature_selector {
            self.feature_selector = selector;
        }
        if let Some(path) = file.database_path {
            self.database_path = path;
        }
        Ok(())
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(url) = &args.base_url {
            self.target_base_url = url.clone();
        }
        if let Some(browsers) = &args.browsers {
            self.browsers = browsers.clone();
        }
        if let Some(ms) = args.auto_run_interval_ms {
            self.auto_run_interval_ms = ms;
        }
        if let Some(path) = &args.database {
            self.database_path = path.clone();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.browsers.is_empty() {
            return Err(SitewatchError::Config(
                "at least one browser engine must be configured".to_string(),
            ));
        }
        if self.auto_run_interval_ms == 0 {
            return Err(SitewatchError::Config(
                "auto_run_interval_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            auto_run_interval: Duration::from_millis(self.auto_run_interval_ms),
            browsers: self.browsers.clone(),
            base_url: self.target_base_url.clone(),
            test_files: self.test_files.clone(),
            critical_path_tests: self.critical_path_tests.clone(),
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            driver_endpoints: self.driver_endpoints.clone(),
            feature_selector: self.feature_selector.clone(),
            ..RunnerConfig::default()
        }
    }
}
