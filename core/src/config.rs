//! Protocol registry - which protocols to index and how to parse them
//!
//! Loaded from a TOML file with a `[[protocols]]` array. The registry is an
//! immutable value: enabling, disabling or narrowing protocols returns a new
//! registry, and the active indexer set is derived from it.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_FLOW_THRESHOLD;
use crate::error::ConfigError;
use crate::raw::is_valid_address;

/// Parsing strategy for a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParserKind {
    /// Infer deposits/withdrawals from native balance deltas
    BalanceFlow,
    /// Classify direction against a known relay/pool address set
    AddressPattern,
    /// Confidential token transfers with encrypted amounts
    ConfidentialTransfer,
}

/// Parser-specific parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Minimum inbound flow (smallest unit) to count as a deposit
    #[serde(default = "default_threshold")]
    pub deposit_threshold: u64,

    /// Minimum outbound flow (smallest unit) to count as a withdrawal
    #[serde(default = "default_threshold")]
    pub withdrawal_threshold: u64,

    /// Relay/pool addresses (address-pattern parser only)
    #[serde(default)]
    pub relay_addresses: Vec<String>,

    /// Token mint to follow when flows are in tokens rather than native units
    #[serde(default)]
    pub mint: Option<String>,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            deposit_threshold: DEFAULT_FLOW_THRESHOLD,
            withdrawal_threshold: DEFAULT_FLOW_THRESHOLD,
            relay_addresses: Vec::new(),
            mint: None,
        }
    }
}

fn default_threshold() -> u64 {
    DEFAULT_FLOW_THRESHOLD
}

fn default_enabled() -> bool {
    true
}

/// Configuration for a single protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Unique id, used in topics and store keys
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: Option<String>,

    /// Program (or pool) address whose signatures are indexed
    pub program_id: String,

    pub parser: ParserKind,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub parser_config: ParserConfig,
}

impl ProtocolConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                protocol: "<unnamed>".to_string(),
                field: "id",
            });
        }
        if self.program_id.trim().is_empty() {
            return Err(ConfigError::MissingField {
                protocol: self.id.clone(),
                field: "program_id",
            });
        }
        if !is_valid_address(&self.program_id) {
            return Err(ConfigError::InvalidValue {
                protocol: self.id.clone(),
                field: "program_id",
                reason: format!("{} is not a base58 address", self.program_id),
            });
        }
        let pc = &self.parser_config;
        if pc.deposit_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                protocol: self.id.clone(),
                field: "deposit_threshold",
                reason: "must be greater than zero".to_string(),
            });
        }
        if pc.withdrawal_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                protocol: self.id.clone(),
                field: "withdrawal_threshold",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.parser == ParserKind::AddressPattern && pc.relay_addresses.is_empty() {
            return Err(ConfigError::MissingField {
                protocol: self.id.clone(),
                field: "relay_addresses",
            });
        }
        if let Some(bad) = pc.relay_addresses.iter().find(|a| !is_valid_address(a)) {
            return Err(ConfigError::InvalidValue {
                protocol: self.id.clone(),
                field: "relay_addresses",
                reason: format!("{} is not a base58 address", bad),
            });
        }
        Ok(())
    }
}

/// All known protocols
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRegistry {
    #[serde(default)]
    pub protocols: Vec<ProtocolConfig>,
}

impl ProtocolRegistry {
    pub fn new(protocols: Vec<ProtocolConfig>) -> Result<Self, ConfigError> {
        let registry = Self { protocols };
        registry.validate()?;
        Ok(registry)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let registry: ProtocolRegistry = toml::from_str(contents)?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for protocol in &self.protocols {
            protocol.validate()?;
            if !seen.insert(protocol.id.as_str()) {
                return Err(ConfigError::DuplicateProtocol(protocol.id.clone()));
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ProtocolConfig> {
        self.protocols.iter().find(|p| p.id == id)
    }

    /// Enabled protocols, in registry order.
    pub fn active(&self) -> Vec<&ProtocolConfig> {
        self.protocols.iter().filter(|p| p.enabled).collect()
    }

    /// Copy of the registry with one protocol toggled.
    pub fn with_enabled(&self, id: &str, enabled: bool) -> Result<Self, ConfigError> {
        if self.get(id).is_none() {
            return Err(ConfigError::UnknownProtocol(id.to_string()));
        }
        let protocols = self
            .protocols
            .iter()
            .cloned()
            .map(|mut p| {
                if p.id == id {
                    p.enabled = enabled;
                }
                p
            })
            .collect();
        Ok(Self { protocols })
    }

    /// Copy of the registry where exactly `ids` are enabled.
    pub fn with_only(&self, ids: &[String]) -> Result<Self, ConfigError> {
        if let Some(unknown) = ids.iter().find(|id| self.get(id).is_none()) {
            return Err(ConfigError::UnknownProtocol(unknown.clone()));
        }
        let protocols = self
            .protocols
            .iter()
            .cloned()
            .map(|mut p| {
                p.enabled = ids.contains(&p.id);
                p
            })
            .collect();
        Ok(Self { protocols })
    }
}
