use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fetcher::FetchConfig;
use crate::rate_limit::RateLimitConfig;
use crate::reconciler::MergeStrategy;
use crate::retry::BackoffPolicy;
use crate::types::{ChainId, EmitterAddress, Timestamp};
use crate::verify::{GuardianSet, GuardianSets, PreviousGuardianSet};
use crate::Error;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    JsonRpc,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChainConfig {
    pub id: ChainId,
    pub name: String,
    pub adapter_type: AdapterKind,
    pub rpc_url: String,
    /// Emitters whose outbound messages are observed on this chain.
    #[serde(default)]
    pub emitters: Vec<EmitterAddress>,
    #[serde(default = "default_log_poll_interval_ms")]
    pub log_poll_interval_ms: u64,
}

impl ChainConfig {
    pub fn log_poll_interval(&self) -> Duration {
        Duration::from_millis(self.log_poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GuardianConfig {
    pub current: GuardianSet,
    #[serde(default)]
    pub previous: Option<GuardianSet>,
    /// How long `previous` keeps verifying after startup.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AttestationConfig {
    /// Base URLs of the signed attestation APIs.
    pub sources: Vec<String>,
    #[serde(default = "default_total_timeout_secs")]
    pub total_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_per_source_timeout_ms")]
    pub per_source_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelayerConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub attempt_timeout_secs: u64,
    pub confirm_poll_interval_ms: u64,
    pub message_ttl_secs: u64,
    pub tick_interval_ms: u64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.25,
            attempt_timeout_secs: 30,
            confirm_poll_interval_ms: 1_000,
            message_ttl_secs: 86_400,
            tick_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RateLimitSettings {
    pub window_secs: u64,
    pub max_per_window: u32,
    #[serde(default)]
    pub max_single_amount: Option<u128>,
    #[serde(default)]
    pub max_window_volume: Option<u128>,
    #[serde(default)]
    pub max_destinations_per_window: Option<usize>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_per_window: 10,
            max_single_amount: None,
            max_window_volume: None,
            max_destinations_per_window: None,
        }
    }
}

/// A balance kept in view across several chains.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    pub key: String,
    #[serde(default)]
    pub token: Option<String>,
    /// For `primary_chain` the first entry is authoritative.
    pub chains: Vec<ChainId>,
    pub strategy: MergeStrategy,
    pub interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    pub guardians: GuardianConfig,
    pub attestation: AttestationConfig,
    #[serde(default)]
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// File backing the queue; in-memory when absent.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub watches: Vec<WatchConfig>,
}

fn default_log_poll_interval_ms() -> u64 {
    2_000
}

fn default_grace_period_secs() -> u64 {
    86_400
}

fn default_total_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_per_source_timeout_ms() -> u64 {
    10_000
}

impl Config {
    pub fn load<P: AsRef<Path>>(config_path: P) -> Result<Self, Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = serde_json::from_str(&config_str)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        // 验证链配置
        if self.chains.is_empty() {
            return Err(Error::Config("At least one chain must be configured".to_string()));
        }
        let mut seen = BTreeSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.id) {
                return Err(Error::Config(format!("Duplicate chain: {}", chain.id)));
            }
            if chain.rpc_url.is_empty() {
                return Err(Error::Config(format!("Missing rpc_url for chain {}", chain.id)));
            }
            if chain.log_poll_interval_ms == 0 {
                return Err(Error::Config(format!(
                    "log_poll_interval_ms must be greater than 0 for chain {}",
                    chain.id
                )));
            }
        }

        self.validate_guardians()?;

        // 验证证明来源配置
        let attestation = &self.attestation;
        if attestation.sources.is_empty() {
            return Err(Error::Config("At least one attestation source is required".to_string()));
        }
        if attestation.total_timeout_secs == 0
            || attestation.poll_interval_ms == 0
            || attestation.per_source_timeout_ms == 0
        {
            return Err(Error::Config("Attestation timeouts must be greater than 0".to_string()));
        }

        // 验证中继器配置
        let relayer = &self.relayer;
        if relayer.max_attempts == 0 {
            return Err(Error::Config("Relayer max_attempts must be greater than 0".to_string()));
        }
        if relayer.base_delay_ms > relayer.max_delay_ms {
            return Err(Error::Config("Relayer base_delay_ms exceeds max_delay_ms".to_string()));
        }
        if !(0.0..=1.0).contains(&relayer.jitter) {
            return Err(Error::Config(format!("Relayer jitter {} is outside [0, 1]", relayer.jitter)));
        }
        if relayer.attempt_timeout_secs == 0
            || relayer.confirm_poll_interval_ms == 0
            || relayer.tick_interval_ms == 0
            || relayer.message_ttl_secs == 0
        {
            return Err(Error::Config("Relayer intervals must be greater than 0".to_string()));
        }

        if self.rate_limit.window_secs == 0 || self.rate_limit.max_per_window == 0 {
            return Err(Error::Config("Rate limit window and quota must be greater than 0".to_string()));
        }

        // 验证监视配置
        for watch in &self.watches {
            if watch.key.is_empty() {
                return Err(Error::Config("Watch key must not be empty".to_string()));
            }
            if watch.chains.is_empty() {
                return Err(Error::Config(format!("Watch {} has no chains", watch.key)));
            }
            if watch.interval_ms == 0 {
                return Err(Error::Config(format!("Watch {} interval must be greater than 0", watch.key)));
            }
            if let Some(missing) = watch.chains.iter().find(|c| !seen.contains(c)) {
                return Err(Error::Config(format!(
                    "Watch {} references unconfigured chain {}",
                    watch.key, missing
                )));
            }
        }

        Ok(())
    }

    fn validate_guardians(&self) -> Result<(), Error> {
        let sets = std::iter::once(&self.guardians.current).chain(self.guardians.previous.as_ref());
        for set in sets {
            if set.keys.is_empty() {
                return Err(Error::Config(format!("Guardian set {} has no keys", set.index)));
            }
            if let Some(quorum) = set.quorum_override {
                if quorum == 0 || quorum > set.keys.len() {
                    return Err(Error::Config(format!(
                        "Quorum {} out of range for guardian set {} of {} keys",
                        quorum,
                        set.index,
                        set.keys.len()
                    )));
                }
            }
        }
        // 上一集合必须紧挨着当前集合
        if let Some(previous) = &self.guardians.previous {
            if previous.index.checked_add(1) != Some(self.guardians.current.index) {
                return Err(Error::Config(format!(
                    "Previous guardian set {} does not precede current set {}",
                    previous.index, self.guardians.current.index
                )));
            }
        }
        Ok(())
    }

    pub fn get_chain_config(&self, chain: ChainId) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.id == chain)
    }

    /// Guardian sets as of `now`; the previous set stays valid for the
    /// configured grace period.
    pub fn guardian_sets(&self, now: Timestamp) -> GuardianSets {
        let mut sets = GuardianSets::new(self.guardians.current.clone());
        sets.previous = self.guardians.previous.clone().map(|set| PreviousGuardianSet {
            set,
            expires_at: now.saturating_add(self.guardians.grace_period_secs.saturating_mul(1_000)),
        });
        sets
    }

    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            total_timeout: Duration::from_secs(self.attestation.total_timeout_secs),
            poll_interval: Duration::from_millis(self.attestation.poll_interval_ms),
            per_source_timeout: Duration::from_millis(self.attestation.per_source_timeout_ms),
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.relayer.base_delay_ms),
            max_delay: Duration::from_millis(self.relayer.max_delay_ms),
            max_attempts: self.relayer.max_attempts,
            jitter: self.relayer.jitter,
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let settings = &self.rate_limit;
        RateLimitConfig {
            window: Duration::from_secs(settings.window_secs),
            max_per_window: settings.max_per_window,
            max_single_amount: settings.max_single_amount.unwrap_or(u128::MAX),
            max_window_volume: settings.max_window_volume.unwrap_or(u128::MAX),
            max_destinations_per_window: settings.max_destinations_per_window.unwrap_or(usize::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample() -> serde_json::Value {
        serde_json::json!({
            "chains": [
                {
                    "id": "ethereum",
                    "name": "Ethereum mainnet",
                    "adapter_type": "json_rpc",
                    "rpc_url": "http://localhost:8545",
                    "emitters": ["42".repeat(32)]
                },
                {
                    "id": "solana",
                    "name": "Solana mainnet",
                    "adapter_type": "json_rpc",
                    "rpc_url": "http://localhost:8899",
                    "log_poll_interval_ms": 500
                }
            ],
            "guardians": {
                "current": { "index": 4, "keys": ["11".repeat(20), "22".repeat(20), "33".repeat(20)] },
                "previous": { "index": 3, "keys": ["44".repeat(20)], "quorum_override": 1 },
                "grace_period_secs": 60
            },
            "attestation": { "sources": ["http://localhost:7071"] },
            "rate_limit": { "window_secs": 30, "max_per_window": 4, "max_single_amount": 1000 },
            "watches": [
                { "key": "treasury", "chains": ["solana", "ethereum"], "strategy": "primary_chain", "interval_ms": 1000 }
            ]
        })
    }

    fn parse(value: serde_json::Value) -> Config {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_load_and_derive() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(sample().to_string().as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.chains[0].adapter_type, AdapterKind::JsonRpc);
        assert_eq!(config.chains[0].log_poll_interval(), Duration::from_secs(2));
        assert_eq!(config.chains[1].log_poll_interval(), Duration::from_millis(500));
        assert_eq!(config.relayer.max_attempts, 5);
        assert!(config.get_chain_config(ChainId::Solana).is_some());
        assert!(config.get_chain_config(ChainId::Sui).is_none());

        let sets = config.guardian_sets(1_000);
        assert_eq!(sets.current.quorum(), 3);
        assert_eq!(sets.previous.as_ref().map(|p| p.expires_at), Some(61_000));

        let fetch = config.fetch_config();
        assert_eq!(fetch.total_timeout, Duration::from_secs(300));
        assert_eq!(fetch.poll_interval, Duration::from_secs(5));

        let limits = config.rate_limit_config();
        assert_eq!(limits.window, Duration::from_secs(30));
        assert_eq!(limits.max_single_amount, 1000);
        assert_eq!(limits.max_window_volume, u128::MAX);

        assert_eq!(config.watches[0].strategy, MergeStrategy::PrimaryChain);
        assert_eq!(config.backoff_policy().max_attempts, 5);
    }

    #[test]
    fn test_unknown_chain_fails_to_parse() {
        let mut value = sample();
        value["chains"][0]["id"] = "atlantis".into();
        assert!(serde_json::from_value::<Config>(value).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut value = sample();
        value["chains"][1]["id"] = "ethereum".into();
        assert!(matches!(parse(value).validate(), Err(Error::Config(_))));

        let mut value = sample();
        value["guardians"]["current"]["quorum_override"] = 4.into();
        assert!(parse(value).validate().is_err());

        let mut value = sample();
        value["guardians"]["previous"]["index"] = 1.into();
        assert!(parse(value).validate().is_err());

        let mut value = sample();
        value["attestation"]["sources"] = serde_json::json!([]);
        assert!(parse(value).validate().is_err());

        let mut value = sample();
        value["relayer"] = serde_json::json!({
            "max_attempts": 0, "base_delay_ms": 1, "max_delay_ms": 2, "jitter": 0.1,
            "attempt_timeout_secs": 1, "confirm_poll_interval_ms": 1,
            "message_ttl_secs": 1, "tick_interval_ms": 1
        });
        assert!(parse(value).validate().is_err());

        let mut value = sample();
        value["watches"][0]["chains"] = serde_json::json!(["sui"]);
        assert!(parse(value).validate().is_err());

        assert!(parse(sample()).validate().is_ok());
    }

    #[test]
    fn test_load_reports_missing_file() {
        assert!(matches!(
            Config::load("/nonexistent/relay.json"),
            Err(Error::Config(_))
        ));
    }
}
