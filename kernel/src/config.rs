// Broker Configuration
//
// Loaded from JSON by the front end; every field has a default so a
// partial document is enough.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Upper bound for every store operation, in milliseconds.
    pub store_timeout_ms: u64,

    /// Serialize polls by the same group on the same partition.
    pub serialize_polls: bool,
}

impl BrokerConfig {
    /// Built-in configuration used when none is provided.
    pub fn default_config() -> Self {
        Self {
            store_timeout_ms: 10_000,
            serialize_polls: true,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_falls_back_to_defaults() {
        let config: BrokerConfig = serde_json::from_str(r#"{ "store_timeout_ms": 250 }"#).unwrap();

        assert_eq!(config.store_timeout(), Duration::from_millis(250));
        assert!(config.serialize_polls);
    }
}
