//! Command-line configuration.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use vk_core::PollerConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "vk-daemon")]
#[command(about = "Keeps task notes in a vault in sync with the task service")]
pub struct Args {
    /// Path to the vault directory
    #[arg(short, long, env = "VK_VAULT")]
    pub vault: PathBuf,

    /// Base URL of the task service
    #[arg(long, default_value = "http://127.0.0.1:3000", env = "VK_SERVICE_URL")]
    pub service_url: String,

    /// Project to poll, in addition to those referenced by notes (repeatable)
    #[arg(short, long = "project")]
    pub projects: Vec<String>,

    /// Poll interval while the service is healthy
    #[arg(long, default_value_t = 5_000)]
    pub interval_ms: u64,

    /// Upper bound for the backed-off poll interval
    #[arg(long, default_value_t = 60_000)]
    pub max_interval_ms: u64,

    /// Maximum number of remembered task states
    #[arg(long, default_value_t = 1_000)]
    pub max_tracked: usize,

    /// Timeout for each request to the task service
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,

    /// Create tasks for notes that have a project id but no task id
    #[arg(long)]
    pub push_unlinked: bool,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

impl Args {
    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig::default()
            .with_intervals(
                Duration::from_millis(self.interval_ms),
                Duration::from_millis(self.max_interval_ms),
            )
            .with_max_tracked(self.max_tracked)
            .with_request_timeout(self.request_timeout())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Log filter used when `RUST_LOG` is not set.
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "debug,vk_daemon=debug,vk_core=debug"
        } else {
            "info,vk_daemon=info,vk_core=info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_poller_defaults() {
        let args = Args::try_parse_from(["vk-daemon", "--vault", "/tmp/vault"]).unwrap();
        let config = args.poller_config();
        let defaults = PollerConfig::default();

        assert_eq!(config.base_interval, defaults.base_interval);
        assert_eq!(config.max_interval, defaults.max_interval);
        assert_eq!(config.max_tracked, defaults.max_tracked);
        assert_eq!(config.request_timeout, defaults.request_timeout);
        assert!(args.projects.is_empty());
        assert!(!args.push_unlinked);
    }

    #[test]
    fn test_repeatable_projects_and_overrides() {
        let args = Args::try_parse_from([
            "vk-daemon",
            "--vault",
            "/tmp/vault",
            "--service-url",
            "http://tasks.local:8080",
            "--project",
            "p1",
            "-p",
            "p2",
            "--interval-ms",
            "250",
            "--verbose",
        ])
        .unwrap();

        assert_eq!(args.service_url, "http://tasks.local:8080");
        assert_eq!(args.projects, ["p1", "p2"]);
        assert_eq!(args.poller_config().base_interval, Duration::from_millis(250));
        assert!(args.default_log_filter().starts_with("debug"));
    }

    #[test]
    fn test_vault_is_required() {
        // VK_VAULT would satisfy the requirement; only meaningful when unset
        if std::env::var_os("VK_VAULT").is_none() {
            assert!(Args::try_parse_from(["vk-daemon"]).is_err());
        }
    }
}
