//! Service settings.
//!
//! Loaded once at startup from built-in defaults, an optional TOML file and
//! `LEDGERLY__SECTION__KEY` environment overrides, then passed into
//! constructors explicitly.

use std::path::Path;

use ::config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;

use ledgerly_observability::LogFormat;
use ledgerly_wallet::{CommissionPolicy, EntryKind, SignupBonus};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Load(#[from] ConfigError),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Database {
    /// Absent means the in-memory store.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 5,
        }
    }
}

/// Conflict retries. Without `max_append_attempts` a unit of work retries
/// until it commits or `retry_timeout_ms` elapses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Ledger {
    pub max_append_attempts: Option<u32>,
    pub retry_timeout_ms: u64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            max_append_attempts: None,
            retry_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignupBonusType {
    Percent,
    Flat,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Commission {
    pub signup_bonus_type: SignupBonusType,
    pub signup_bonus_value: i64,
    pub per_transaction_amount: i64,
    pub trigger_kinds: Vec<String>,
}

impl Default for Commission {
    fn default() -> Self {
        Self {
            signup_bonus_type: SignupBonusType::Percent,
            signup_bonus_value: 10,
            per_transaction_amount: 200,
            trigger_kinds: vec!["credit".to_string(), "debit".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Referral {
    pub max_code_attempts: u32,
}

impl Default for Referral {
    fn default() -> Self {
        Self { max_code_attempts: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub format: LogFormat,
    pub filter: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: Database,
    pub ledger: Ledger,
    pub commission: Commission,
    pub referral: Referral,
    pub logging: Logging,
}

impl Settings {
    /// Defaults, then `path` (if given and present), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let config = builder.add_source(environment()).build()?;
        Self::finish(config)
    }

    /// Parse settings from TOML text, ignoring the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Self::finish(config)
    }

    fn finish(config: Config) -> Result<Self, SettingsError> {
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.ledger.max_append_attempts == Some(0) {
            return Err(SettingsError::Invalid {
                key: "ledger.max_append_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.ledger.retry_timeout_ms == 0 {
            return Err(SettingsError::Invalid {
                key: "ledger.retry_timeout_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.referral.max_code_attempts == 0 {
            return Err(SettingsError::Invalid {
                key: "referral.max_code_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.database.max_connections == 0 {
            return Err(SettingsError::Invalid {
                key: "database.max_connections",
                reason: "must be at least 1".to_string(),
            });
        }
        self.commission_policy().map(|_| ())
    }

    /// Commission policy described by the `[commission]` section.
    pub fn commission_policy(&self) -> Result<CommissionPolicy, SettingsError> {
        let c = &self.commission;
        let signup_bonus = match c.signup_bonus_type {
            SignupBonusType::Percent => {
                let pct = u32::try_from(c.signup_bonus_value).map_err(|_| SettingsError::Invalid {
                    key: "commission.signup_bonus_value",
                    reason: format!("{} is not a valid percentage", c.signup_bonus_value),
                })?;
                SignupBonus::Percent(pct)
            }
            SignupBonusType::Flat => SignupBonus::Flat(c.signup_bonus_value),
        };

        let trigger_kinds = c
            .trigger_kinds
            .iter()
            .map(|raw| raw.parse::<EntryKind>())
            .collect::<Result<_, _>>()
            .map_err(|e| SettingsError::Invalid {
                key: "commission.trigger_kinds",
                reason: e.to_string(),
            })?;

        let policy = CommissionPolicy {
            signup_bonus,
            per_transaction: c.per_transaction_amount,
            trigger_kinds,
        };
        policy.validate().map_err(|e| SettingsError::Invalid {
            key: "commission",
            reason: e.to_string(),
        })?;
        Ok(policy)
    }
}

fn environment() -> Environment {
    Environment::with_prefix("LEDGERLY")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("commission.trigger_kinds")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_reference_policy() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.ledger.max_append_attempts, None);
        assert_eq!(settings.ledger.retry_timeout_ms, 30_000);
        assert_eq!(settings.referral.max_code_attempts, 10);
        assert!(settings.database.url.is_none());
        assert_eq!(settings.commission_policy().unwrap(), CommissionPolicy::default());
    }

    #[test]
    fn sections_override_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [database]
            url = "postgres://localhost/ledgerly"

            [commission]
            signup_bonus_type = "flat"
            signup_bonus_value = 5000
            per_transaction_amount = 0
            trigger_kinds = ["deposit"]

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        let policy = settings.commission_policy().unwrap();
        assert_eq!(policy.signup_bonus, SignupBonus::Flat(5000));
        assert_eq!(policy.per_transaction, 0);
        assert_eq!(policy.trigger_kinds.into_iter().collect::<Vec<_>>(), vec![EntryKind::Credit]);
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert_eq!(settings.database.url.as_deref(), Some("postgres://localhost/ledgerly"));
    }

    #[test]
    fn unknown_trigger_kind_is_rejected() {
        let err = Settings::from_toml_str("[commission]\ntrigger_kinds = [\"bogus\"]").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "commission.trigger_kinds", .. }));
    }

    #[test]
    fn zero_retry_budget_is_rejected() {
        let err = Settings::from_toml_str("[ledger]\nmax_append_attempts = 0").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "ledger.max_append_attempts", .. }));

        let err = Settings::from_toml_str("[ledger]\nretry_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { key: "ledger.retry_timeout_ms", .. }));

        let capped = Settings::from_toml_str("[ledger]\nmax_append_attempts = 3").unwrap();
        assert_eq!(capped.ledger.max_append_attempts, Some(3));
    }
}
