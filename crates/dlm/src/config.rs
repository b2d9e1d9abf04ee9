// Copyright 2024 ShaleFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lock engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Floor for the completion wait timeout.
    pub enqueue_min: Duration,
    /// Completion wait timeout used when the adaptive estimator is off.
    pub default_timeout: Duration,
    /// Scale the completion timeout from observed grant latencies.
    pub adaptive_timeout: bool,
    /// Drop unused cached locks before replaying after a reconnect.
    pub cancel_unused_before_replay: bool,
    /// Largest lock request the transport will carry.
    pub max_req_size: usize,
    /// Unused-lock cache configuration.
    pub lru: LruConfig,
}

/// Unused-lock LRU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LruConfig {
    /// Hard cap on cached unused locks when the server does not drive
    /// the cache size itself.
    pub max_unused: usize,
    /// Oldest a cached unused lock may grow before aged eviction takes it.
    pub max_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enqueue_min: Duration::from_secs(100),
            default_timeout: Duration::from_secs(100),
            adaptive_timeout: true,
            cancel_unused_before_replay: true,
            max_req_size: 5 * 1024,
            lru: LruConfig::default(),
        }
    }
}

impl Default for LruConfig {
    fn default() -> Self {
        Self {
            max_unused: 100,
            max_age: Duration::from_secs(3600),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the unused-lock cache
    pub fn with_max_unused(mut self, max_unused: usize) -> Self {
        self.lru.max_unused = max_unused;
        self
    }

    /// Set the aged-eviction horizon
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.lru.max_age = max_age;
        self
    }

    /// Set the completion timeout floor
    pub fn with_enqueue_min(mut self, enqueue_min: Duration) -> Self {
        self.enqueue_min = enqueue_min;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.enqueue_min, Duration::from_secs(100));
        assert!(config.adaptive_timeout);
        assert!(config.cancel_unused_before_replay);
        assert_eq!(config.lru.max_unused, 100);
    }

    #[test]
    fn test_config_builders() {
        let config = EngineConfig::new()
            .with_max_unused(8)
            .with_max_age(Duration::from_secs(60))
            .with_enqueue_min(Duration::from_secs(5));
        assert_eq!(config.lru.max_unused, 8);
        assert_eq!(config.lru.max_age, Duration::from_secs(60));
        assert_eq!(config.enqueue_min, Duration::from_secs(5));
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_req_size, config.max_req_size);
        assert_eq!(back.lru.max_age, config.lru.max_age);
    }
}
