//! Process configuration from environment variables

use crate::rules::{RuleCatalog, RuleSetConfig, RuleSetError};
use crate::state_machine::DEFAULT_REPLY_DELAY;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub port: u16,
    /// Simulated typing latency before each bot reply
    pub reply_delay: Duration,
    /// JSON rule catalog; the built-in network catalog when unset
    pub rules_path: Option<PathBuf>,
    /// Unobserved conversations are closed after this long; `None` disables
    pub idle_timeout: Option<Duration>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = lookup("NETOPS_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let reply_delay = lookup("NETOPS_REPLY_DELAY_MS")
            .and_then(|ms| ms.parse().ok())
            .map_or(DEFAULT_REPLY_DELAY, Duration::from_millis);

        let rules_path = lookup("NETOPS_RULES_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        // 0 turns expiry off
        let idle_timeout = match lookup("NETOPS_IDLE_TIMEOUT_SECS").and_then(|s| s.parse().ok()) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_IDLE_TIMEOUT),
        };

        Self {
            port,
            reply_delay,
            rules_path,
            idle_timeout,
        }
    }

    /// Load and validate the rule catalog
    pub fn load_catalog(&self) -> Result<RuleCatalog, RuleSetError> {
        let config = match &self.rules_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading rule catalog");
                RuleSetConfig::load(path)?
            }
            None => RuleSetConfig::network_support(),
        };
        config.into_catalog()
    }
}
