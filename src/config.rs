use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SparkError;
use serde::{Deserialize, Serialize};
use sparkinsight_payment::types::{
    is_hex_address, PaymentTerms, DEFAULT_RPC_URL, DEV_WALLET, PAYMENT_AMOUNT, PAYMENT_TOKEN,
    TOKEN_DECIMALS,
};
use sparkinsight_storage::db::DB_PATH;

pub const CONFIG_ENV_VAR: &str = "SPARKINSIGHT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "./sparkinsight.config.yaml";
const MAX_TOKEN_DECIMALS: u32 = 30;

fn default_db_path() -> String {
    DB_PATH.into()
}
fn default_rpc_url() -> String {
    DEFAULT_RPC_URL.into()
}
fn default_recipient_wallet() -> String {
    DEV_WALLET.into()
}
fn default_token_contract() -> String {
    PAYMENT_TOKEN.into()
}
fn default_min_payment_amount() -> f64 {
    PAYMENT_AMOUNT
}
fn default_token_decimals() -> u32 {
    TOKEN_DECIMALS
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default = "default_recipient_wallet")]
    pub recipient_wallet: String,
    #[serde(default = "default_token_contract")]
    pub token_contract: String,
    #[serde(default = "default_min_payment_amount")]
    pub min_payment_amount: f64,
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u32,
    #[serde(default)]
    pub enforce_token_contract: bool,
    /// Seconds before an RPC call is abandoned. Unset waits forever.
    #[serde(default)]
    pub rpc_timeout_secs: Option<u64>,
    /// Write hourly log files here instead of logging to stderr.
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            rpc_url: default_rpc_url(),
            recipient_wallet: default_recipient_wallet(),
            token_contract: default_token_contract(),
            min_payment_amount: default_min_payment_amount(),
            token_decimals: default_token_decimals(),
            enforce_token_contract: false,
            rpc_timeout_secs: None,
            log_dir: None,
        }
    }
}

impl Config {
    pub fn resolve_config_path() -> Result<Option<PathBuf>, SparkError> {
        if let Ok(custom) = std::env::var(CONFIG_ENV_VAR) {
            if Path::new(&custom).exists() {
                return Ok(Some(PathBuf::from(custom)));
            }
            return Err(SparkError::Config(format!(
                "{CONFIG_ENV_VAR} points to non-existent file: {custom}"
            )));
        }

        for candidate in [DEFAULT_CONFIG_FILE, "./sparkinsight.config.yml"] {
            if Path::new(candidate).exists() {
                return Ok(Some(PathBuf::from(candidate)));
            }
        }
        Ok(None)
    }

    /// Load config from the resolved YAML file, or defaults when there is none.
    pub fn load() -> Result<Self, SparkError> {
        match Self::resolve_config_path()? {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, SparkError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SparkError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&content)
            .map_err(|e| SparkError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, SparkError> {
        let mut config: Config = if content.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| SparkError::Config(format!("Failed to parse config: {e}")))?
        };
        config.post_deserialize()?;
        Ok(config)
    }

    /// Apply post-deserialization normalization and validation.
    pub(crate) fn post_deserialize(&mut self) -> Result<(), SparkError> {
        self.db_path = self.db_path.trim().to_string();
        if self.db_path.is_empty() {
            self.db_path = default_db_path();
        }
        self.rpc_url = self.rpc_url.trim().to_string();
        if self.rpc_url.is_empty() {
            self.rpc_url = default_rpc_url();
        }
        if !(self.rpc_url.starts_with("http://") || self.rpc_url.starts_with("https://")) {
            return Err(SparkError::Config(format!(
                "rpc_url must be an http(s) URL: {}",
                self.rpc_url
            )));
        }

        self.recipient_wallet = self.recipient_wallet.trim().to_string();
        if !is_hex_address(&self.recipient_wallet) {
            return Err(SparkError::Config(format!(
                "recipient_wallet is not a 0x-prefixed 20-byte address: {}",
                self.recipient_wallet
            )));
        }
        self.token_contract = self.token_contract.trim().to_string();
        if !is_hex_address(&self.token_contract) {
            return Err(SparkError::Config(format!(
                "token_contract is not a 0x-prefixed 20-byte address: {}",
                self.token_contract
            )));
        }

        if !(self.min_payment_amount.is_finite() && self.min_payment_amount >= 0.0) {
            return Err(SparkError::Config(
                "min_payment_amount must be >= 0".into(),
            ));
        }
        if self.token_decimals > MAX_TOKEN_DECIMALS {
            return Err(SparkError::Config(format!(
                "token_decimals must be <= {MAX_TOKEN_DECIMALS}"
            )));
        }
        if self.rpc_timeout_secs == Some(0) {
            self.rpc_timeout_secs = None;
        }
        if let Some(dir) = &self.log_dir {
            if dir.trim().is_empty() {
                self.log_dir = None;
            }
        }
        Ok(())
    }

    pub fn payment_terms(&self) -> PaymentTerms {
        PaymentTerms {
            recipient_wallet: self.recipient_wallet.clone(),
            token_contract: self.token_contract.clone(),
            token_decimals: self.token_decimals,
            min_amount: self.min_payment_amount,
            enforce_token_contract: self.enforce_token_contract,
        }
    }

    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout_secs.map(Duration::from_secs)
    }

    /// Save config as YAML to the given path.
    pub fn save_yaml(&self, path: &Path) -> Result<(), SparkError> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| SparkError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env_lock;

    #[test]
    fn test_defaults_match_constants() {
        let config = Config::default();
        assert_eq!(config.db_path, "./spark.db");
        assert_eq!(config.rpc_url, "https://base.publicnode.com");
        assert_eq!(config.recipient_wallet, DEV_WALLET);
        assert_eq!(config.token_contract, PAYMENT_TOKEN);
        assert_eq!(config.min_payment_amount, 1.0);
        assert_eq!(config.token_decimals, 6);
        assert!(!config.enforce_token_contract);
        assert!(config.rpc_timeout().is_none());
        assert_eq!(config.payment_terms(), PaymentTerms::default());
    }

    #[test]
    fn test_post_deserialize_normalizes() {
        let mut config = Config {
            db_path: "  ".into(),
            rpc_url: " https://example.org/rpc ".into(),
            rpc_timeout_secs: Some(0),
            log_dir: Some(" ".into()),
            ..Config::default()
        };
        config.post_deserialize().unwrap();
        assert_eq!(config.db_path, DB_PATH);
        assert_eq!(config.rpc_url, "https://example.org/rpc");
        assert!(config.rpc_timeout_secs.is_none());
        assert!(config.log_dir.is_none());
    }

    #[test]
    fn test_post_deserialize_rejects_bad_values() {
        let cases = [
            Config {
                recipient_wallet: "0x1234".into(),
                ..Config::default()
            },
            Config {
                token_contract: "not-an-address".into(),
                ..Config::default()
            },
            Config {
                min_payment_amount: -1.0,
                ..Config::default()
            },
            Config {
                min_payment_amount: f64::NAN,
                ..Config::default()
            },
            Config {
                token_decimals: 31,
                ..Config::default()
            },
            Config {
                rpc_url: "ftp://node".into(),
                ..Config::default()
            },
        ];
        for mut config in cases {
            assert!(matches!(
                config.post_deserialize(),
                Err(SparkError::Config(_))
            ));
        }
    }

    #[test]
    fn test_env_var_pointing_nowhere_is_an_error() {
        let _guard = env_lock();
        std::env::set_var(CONFIG_ENV_VAR, "/definitely/not/here.yaml");
        let result = Config::resolve_config_path();
        std::env::remove_var(CONFIG_ENV_VAR);
        assert!(matches!(result, Err(SparkError::Config(_))));
    }

    #[test]
    fn test_load_via_env_var() {
        let _guard = env_lock();
        let path = std::env::temp_dir().join(format!(
            "sparkinsight_config_{}.yaml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, "db_path: /tmp/agent/spark.db\nmin_payment_amount: 5\n").unwrap();
        std::env::set_var(CONFIG_ENV_VAR, &path);
        let loaded = Config::load();
        std::env::remove_var(CONFIG_ENV_VAR);
        let _ = std::fs::remove_file(&path);

        let config = loaded.unwrap();
        assert_eq!(config.db_path, "/tmp/agent/spark.db");
        assert_eq!(config.min_payment_amount, 5.0);
        assert_eq!(config.recipient_wallet, DEV_WALLET);
    }

    #[test]
    fn test_save_and_reload_yaml() {
        let path = std::env::temp_dir().join(format!(
            "sparkinsight_config_save_{}.yaml",
            uuid::Uuid::new_v4()
        ));
        let config = Config {
            enforce_token_contract: true,
            rpc_timeout_secs: Some(20),
            ..Config::default()
        };
        config.save_yaml(&path).unwrap();
        let reloaded = Config::load_from(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(reloaded, config);
        assert_eq!(reloaded.rpc_timeout(), Some(Duration::from_secs(20)));
    }
}
