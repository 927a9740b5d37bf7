//! Settings file: deployment-wide options and one entry per broker account.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::api::TraderPair;
use crate::broker::{Credentials, FillingMode};
use crate::error::ConfigError;
use crate::trading::{
    validate_separator, OrderPolicy, SymbolMapper, TagFamily, ValidatorConfig,
};

const REDACTED: &str = "********";

/// Deployment-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Base URL of the signal API
    #[serde(alias = "base_controller_url", default = "default_api_url")]
    pub signal_api_url: String,

    /// Digit string between trader id and signal id in correlation tags
    #[serde(alias = "separator_number_string", default = "default_separator")]
    pub separator: String,

    /// Sleep between reconciliation cycles (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Deal history lookback (days)
    #[serde(default = "default_history_days")]
    pub history_days: i64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_broker_timeout")]
    pub broker_timeout_secs: u64,

    /// Use the multi-trader endpoint, one request per source
    #[serde(default)]
    pub batch_fetch: bool,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

fn default_api_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_separator() -> String {
    "752".to_string()
}

fn default_poll_interval() -> u64 {
    30
}

fn default_history_days() -> i64 {
    10
}

fn default_fetch_timeout() -> u64 {
    15
}

fn default_broker_timeout() -> u64 {
    10
}

/// One target trading account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(alias = "login_id")]
    pub login: u64,

    /// Falls back to `SIGCOPIER_PASSWORD_{login}` when empty
    #[serde(default)]
    pub password: String,

    pub server: String,

    #[serde(alias = "setup_path", default)]
    pub terminal_path: Option<String>,

    #[serde(default = "default_bot_name")]
    pub bot_name: String,

    #[serde(default)]
    pub symbol_postfix: String,

    #[serde(alias = "copied_volume_coefficient", default = "default_coefficient")]
    pub volume_coefficient: Decimal,

    #[serde(alias = "type_filling", default)]
    pub filling_mode: FillingMode,

    #[serde(
        alias = "max_allowed_order_age_to_copy_in_minutes",
        default = "default_max_age"
    )]
    pub max_signal_age_minutes: i64,

    #[serde(
        alias = "max_allowed_price_difference_in_pips",
        default = "default_max_drift"
    )]
    pub max_price_drift_pips: Decimal,

    /// Trader id -> signal source
    #[serde(default)]
    pub master_traders: BTreeMap<String, String>,

    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Symbol whose latest tick provides the server clock
    #[serde(default = "default_clock_symbol")]
    pub clock_symbol: String,

    #[serde(default)]
    pub server_utc_offset_minutes: i64,
}

fn default_bot_name() -> String {
    "sigcopier".to_string()
}

fn default_coefficient() -> Decimal {
    dec!(1)
}

fn default_max_age() -> i64 {
    30
}

fn default_max_drift() -> Decimal {
    dec!(10)
}

fn default_clock_symbol() -> String {
    "EURUSD".to_string()
}

/// Which gateway implementation an account trades through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayConfig {
    Bridge {
        url: String,
    },
    Paper {
        #[serde(default = "default_paper_balance")]
        balance: Decimal,
        /// Broker symbol -> static quote
        #[serde(default)]
        quotes: BTreeMap<String, PaperQuote>,
    },
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig::Bridge {
            url: "http://127.0.0.1:8228".to_string(),
        }
    }
}

fn default_paper_balance() -> Decimal {
    dec!(10000)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaperQuote {
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Settings {
    /// Read, resolve and validate a settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let mut settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;

        settings.resolve_passwords();
        settings.validate()?;
        Ok(settings)
    }

    fn resolve_passwords(&mut self) {
        for account in &mut self.accounts {
            if account.password.is_empty() {
                if let Ok(password) = std::env::var(format!("SIGCOPIER_PASSWORD_{}", account.login)) {
                    account.password = password;
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_separator(&self.separator).map_err(ConfigError::InvalidSeparator)?;

        if self.accounts.is_empty() {
            return Err(ConfigError::NoAccounts);
        }

        let mut logins = HashSet::new();
        for account in &self.accounts {
            if !logins.insert(account.login) {
                return Err(ConfigError::InvalidValue {
                    login: account.login,
                    field: "login",
                    message: "is configured twice".to_string(),
                });
            }
            account.validate(&self.separator)?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_timeout_secs)
    }

    pub fn account(&self, login: u64) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.login == login)
    }

    /// Copy safe to print: passwords are masked.
    pub fn redacted(&self) -> Settings {
        let mut copy = self.clone();
        for account in &mut copy.accounts {
            if !account.password.is_empty() {
                account.password = REDACTED.to_string();
            }
        }
        copy
    }
}

impl AccountConfig {
    fn validate(&self, separator: &str) -> Result<(), ConfigError> {
        if self.master_traders.is_empty() {
            return Err(ConfigError::NoTraders { login: self.login });
        }
        self.trader_pairs(separator)?;

        if self.volume_coefficient <= Decimal::ZERO {
            return Err(self.invalid("volume_coefficient", "must be positive"));
        }
        if self.max_signal_age_minutes < 0 {
            return Err(self.invalid("max_signal_age_minutes", "must not be negative"));
        }
        if self.max_price_drift_pips < Decimal::ZERO {
            return Err(self.invalid("max_price_drift_pips", "must not be negative"));
        }
        if let GatewayConfig::Bridge { url } = &self.gateway {
            if url.trim().is_empty() {
                return Err(self.invalid("gateway.url", "is empty"));
            }
        }
        Ok(())
    }

    fn invalid(&self, field: &'static str, message: &str) -> ConfigError {
        ConfigError::InvalidValue {
            login: self.login,
            field,
            message: message.to_string(),
        }
    }

    /// Tag families for every configured trader, in trader id order.
    pub fn trader_pairs(&self, separator: &str) -> Result<Vec<TraderPair>, ConfigError> {
        self.master_traders
            .iter()
            .map(|(trader_id, source)| {
                let family = TagFamily::new(trader_id.trim(), separator).map_err(|err| {
                    ConfigError::InvalidTrader {
                        login: self.login,
                        trader_id: trader_id.clone(),
                        source: err,
                    }
                })?;
                Ok(TraderPair {
                    source: source.clone(),
                    family,
                })
            })
            .collect()
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            login: self.login,
            password: self.password.clone(),
            server: self.server.clone(),
            terminal_path: self.terminal_path.clone(),
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            max_signal_age_minutes: self.max_signal_age_minutes,
            max_price_drift_pips: self.max_price_drift_pips,
        }
    }

    pub fn order_policy(&self) -> OrderPolicy {
        OrderPolicy {
            bot_name: self.bot_name.clone(),
            volume_coefficient: self.volume_coefficient,
            filling_mode: self.filling_mode,
        }
    }

    pub fn symbol_mapper(&self) -> SymbolMapper {
        SymbolMapper::new(self.symbol_postfix.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TagError;

    fn parse(raw: &str) -> Settings {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_defaults_and_legacy_names() {
        let settings = parse(
            r#"{
                "base_controller_url": "http://signals.local/",
                "accounts": [{
                    "login_id": 5001,
                    "password": "pw",
                    "server": "Demo-Server",
                    "setup_path": "C:/terminal64.exe",
                    "copied_volume_coefficient": 0.5,
                    "type_filling": "ORDER_FILLING_IOC",
                    "max_allowed_order_age_to_copy_in_minutes": 15,
                    "max_allowed_price_difference_in_pips": 3.5,
                    "master_traders": {"404656": "fxsignals"}
                }]
            }"#,
        );

        assert_eq!(settings.signal_api_url, "http://signals.local/");
        assert_eq!(settings.separator, "752");
        assert_eq!(settings.poll_interval_secs, 30);
        assert_eq!(settings.history_days, 10);
        assert!(!settings.batch_fetch);

        let account = &settings.accounts[0];
        assert_eq!(account.login, 5001);
        assert_eq!(account.terminal_path.as_deref(), Some("C:/terminal64.exe"));
        assert_eq!(account.volume_coefficient, dec!(0.5));
        assert_eq!(account.filling_mode, FillingMode::Ioc);
        assert_eq!(account.max_signal_age_minutes, 15);
        assert_eq!(account.max_price_drift_pips, dec!(3.5));
        assert_eq!(account.gateway, GatewayConfig::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_paper_gateway_config() {
        let settings = parse(
            r#"{
                "accounts": [{
                    "login": 1, "server": "paper",
                    "master_traders": {"12": "fx"},
                    "gateway": {"kind": "paper", "quotes": {"EURUSD": {"bid": 1.1, "ask": 1.1002}}}
                }]
            }"#,
        );
        match &settings.accounts[0].gateway {
            GatewayConfig::Paper { balance, quotes } => {
                assert_eq!(*balance, dec!(10000));
                assert_eq!(quotes["EURUSD"].ask, dec!(1.1002));
            }
            other => panic!("expected paper gateway, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_errors() {
        let mut settings = parse(
            r#"{"accounts": [{"login": 1, "server": "s", "master_traders": {"404656": "fx"}}]}"#,
        );
        settings.separator = "999".to_string();
        assert!(settings.validate().is_ok());

        settings.accounts[0]
            .master_traders
            .insert("49".to_string(), "fx".to_string());
        match settings.validate() {
            Err(ConfigError::InvalidTrader {
                trader_id, source, ..
            }) => {
                assert_eq!(trader_id, "49");
                assert!(matches!(source, TagError::AmbiguousSeparator { .. }));
            }
            other => panic!("expected invalid trader, got {other:?}"),
        }

        settings.accounts[0].master_traders.remove("49");
        settings.accounts[0].volume_coefficient = Decimal::ZERO;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue {
                field: "volume_coefficient",
                ..
            })
        ));

        settings.accounts.clear();
        assert!(matches!(settings.validate(), Err(ConfigError::NoAccounts)));
    }

    #[test]
    fn test_account_without_traders() {
        let settings = parse(r#"{"accounts": [{"login": 3, "server": "s"}]}"#);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::NoTraders { login: 3 })
        ));
    }

    #[test]
    fn test_redacted_view_hides_passwords() {
        let settings = parse(
            r#"{"accounts": [{"login": 1, "password": "hunter2", "server": "s", "master_traders": {"7": "fx"}}]}"#,
        );
        let printed = serde_json::to_string(&settings.redacted()).unwrap();
        assert!(!printed.contains("hunter2"));
        assert_eq!(settings.accounts[0].password, "hunter2");
    }

    #[test]
    fn test_trader_pairs() {
        let settings = parse(
            r#"{"accounts": [{"login": 1, "server": "s", "master_traders": {"7": "fx", "12": "copy"}}]}"#,
        );
        let pairs = settings.accounts[0].trader_pairs("752").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].trader_id(), "12");
        assert_eq!(pairs[0].source, "copy");
        assert_eq!(pairs[1].family.prefix(), "7752");
    }
}
