//! `timebank.toml` loading and validation.
//!
//! ```toml
//! [server]
//! port = 8080
//! state_file = "timebank-state.json"
//!
//! [policy]
//! no_show_karma_penalty = 5
//!
//! [[accounts]]
//! user_id = "alice"
//! balance = "3"
//!
//! [[services]]
//! id = "svc-1"
//! owner_id = "bob"
//! kind = "offer"
//! hours = "2"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::Deserialize;
use timebank_engine::{AccountRecord, Policy, Role, ServiceListing};

pub(crate) const DEFAULT_PORT: u16 = 8080;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub accounts: Vec<AccountSeed>,
    #[serde(default)]
    pub services: Vec<ServiceListing>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct ServerConfig {
    pub port: u16,
    /// JSON file the ledger is persisted to. Unset keeps state in memory.
    pub state_file: Option<PathBuf>,
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            state_file: None,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

/// An account created at startup if it does not exist yet.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AccountSeed {
    pub user_id: String,
    #[serde(default = "member")]
    pub role: Role,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub karma: i64,
}

fn member() -> Role {
    Role::Member
}

impl AccountSeed {
    pub fn to_record(&self) -> AccountRecord {
        let mut record = AccountRecord::new(&self.user_id, self.role, self.balance);
        record.karma = self.karma;
        record
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("[policy] {e}")))?;
        if self.server.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "[server] sweep_interval_secs must be positive".to_string(),
            ));
        }

        let mut users = HashSet::new();
        for account in &self.accounts {
            if account.user_id.trim().is_empty() {
                return Err(ConfigError::Invalid("account with empty user_id".to_string()));
            }
            if !users.insert(account.user_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate account {}",
                    account.user_id
                )));
            }
            if account.balance < Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "account {} has a negative balance",
                    account.user_id
                )));
            }
        }

        let mut services = HashSet::new();
        for service in &self.services {
            if !services.insert(service.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate service {}", service.id)));
            }
            if service.hours <= Decimal::ZERO {
                return Err(ConfigError::Invalid(format!(
                    "service {} must be worth a positive number of hours",
                    service.id
                )));
            }
            if !users.contains(service.owner_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "service {} is owned by unknown account {}",
                    service.id, service.owner_id
                )));
            }
        }
        Ok(())
    }

    /// One-paragraph description printed by `timebank check`.
    pub fn summary(&self) -> String {
        let admins = self
            .accounts
            .iter()
            .filter(|a| a.role == Role::Admin)
            .count();
        let expiry = match self.policy.pending_expiry_secs {
            Some(secs) => format!("pending handshakes expire after {secs}s"),
            None => "pending handshakes never expire".to_string(),
        };
        format!(
            "{} accounts ({} admin), {} services, port {}, {}",
            self.accounts.len(),
            admins,
            self.services.len(),
            self.server.port,
            expiry
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timebank_engine::ServiceKind;

    const SAMPLE: &str = r#"
[server]
port = 9090

[policy]
no_show_karma_penalty = 10
pending_expiry_secs = 3600

[[accounts]]
user_id = "alice"
balance = "3"

[[accounts]]
user_id = "root"
role = "admin"

[[services]]
id = "svc-1"
owner_id = "alice"
kind = "need"
hours = "1.5"
title = "Garden help"
"#;

    #[test]
    fn parses_all_sections() {
        let config = Config::parse(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS);
        assert_eq!(config.policy.no_show_karma_penalty, 10);
        assert_eq!(config.policy.feedback_karma_bonus, 1);
        assert_eq!(config.accounts[0].role, Role::Member);
        assert_eq!(config.accounts[0].balance, Decimal::from(3));
        assert_eq!(config.accounts[1].role, Role::Admin);
        assert_eq!(config.services[0].kind, ServiceKind::Need);
        assert_eq!(config.services[0].hours, Decimal::new(15, 1));
    }

    #[test]
    fn empty_file_is_a_valid_config() {
        let config = Config::parse("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert!(config.accounts.is_empty());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("[server]\nprot = 1\n").is_err());
    }

    #[test]
    fn service_owner_must_be_a_configured_account() {
        let raw = r#"
[[services]]
id = "svc-1"
owner_id = "ghost"
kind = "offer"
hours = "1"
"#;
        let err = Config::parse(raw).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("unknown account ghost"));
    }

    #[test]
    fn duplicate_accounts_are_rejected() {
        let raw = "[[accounts]]\nuser_id = \"a\"\n[[accounts]]\nuser_id = \"a\"\n";
        let err = Config::parse(raw).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("duplicate account a"));
    }

    #[test]
    fn bad_policy_is_reported_with_its_section() {
        let raw = "[policy]\nmax_conflict_retries = 0\n";
        let err = Config::parse(raw).unwrap().validate().unwrap_err();
        assert!(err.to_string().starts_with("[policy]"));
    }

    #[test]
    fn seed_carries_karma() {
        let config = Config::parse("[[accounts]]\nuser_id = \"a\"\nkarma = 4\n").unwrap();
        let record = config.accounts[0].to_record();
        assert_eq!(record.karma, 4);
        assert!(record.is_active);
    }

    #[test]
    fn summary_mentions_counts() {
        let config = Config::parse(SAMPLE).unwrap();
        let summary = config.summary();
        assert!(summary.starts_with("2 accounts (1 admin), 1 services"));
        assert!(summary.contains("3600s"));
    }
}
