//! Rule catalog configuration
//!
//! The catalog is static configuration: loaded once at startup, either from
//! a JSON file or from the built-in network support topics.

use super::{Rule, RuleSet, RuleSetError};
use serde::{Deserialize, Serialize};
use std::path::Path;

const GREETING: &str =
    "Hello! I'm your network diagnostic assistant. How can I help you today?";

const FALLBACK: &str = "I'm sorry, I don't understand. Can you please provide more details about your networking issue?";

const SLOW_INTERNET: &str = "If your internet is slow, try these steps:
1. Restart your router and modem
2. Check for any ongoing service outages in your area
3. Run a speed test to confirm the issue
4. If problems persist, contact your ISP";

const WIFI_CONNECT: &str = "If you're having trouble connecting to WiFi:
1. Ensure WiFi is turned on on your device
2. Verify you're trying to connect to the correct network
3. Forget the network and reconnect
4. Restart your device and router";

const IP_CONFLICT: &str = "To resolve an IP address conflict:
1. Release and renew your IP address
2. Set a static IP address outside the DHCP range
3. Check for duplicate MAC addresses on the network
4. Ensure your router's DHCP server is configured correctly";

/// One rule as it appears in a catalog file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub keywords: Vec<String>,
    pub response: String,
    #[serde(default)]
    pub priority: i32,
}

/// Serialized form of a rule catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSetConfig {
    /// Bot message placed at the top of every new transcript
    #[serde(default)]
    pub greeting: Option<String>,
    pub fallback_response: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// A validated catalog ready to serve conversations
#[derive(Debug, Clone)]
pub struct RuleCatalog {
    pub rule_set: RuleSet,
    pub greeting: Option<String>,
}

impl RuleSetConfig {
    /// Built-in network troubleshooting topics
    pub fn network_support() -> Self {
        let rule = |keywords: [&str; 2], response: &str| RuleConfig {
            keywords: keywords.iter().map(ToString::to_string).collect(),
            response: response.to_string(),
            priority: 0,
        };

        Self {
            greeting: Some(GREETING.to_string()),
            fallback_response: FALLBACK.to_string(),
            rules: vec![
                rule(["internet", "slow"], SLOW_INTERNET),
                rule(["wifi", "connect"], WIFI_CONNECT),
                rule(["ip", "conflict"], IP_CONFLICT),
            ],
        }
    }

    /// Read a catalog from a JSON file
    pub fn load(path: &Path) -> Result<Self, RuleSetError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Validate into a usable catalog
    pub fn into_catalog(self) -> Result<RuleCatalog, RuleSetError> {
        let rules = self
            .rules
            .into_iter()
            .map(|r| Rule::new(r.keywords, r.response).with_priority(r.priority))
            .collect();
        let rule_set = RuleSet::new(rules, self.fallback_response)?;

        // A blank greeting means "no greeting" rather than an empty bot bubble
        let greeting = self.greeting.filter(|g| !g.trim().is_empty());

        Ok(RuleCatalog { rule_set, greeting })
    }
}
