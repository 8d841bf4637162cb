//! Configuration loading.
//!
//! One JSON file read at startup; the sections mirror the deployment's
//! concerns: the two serial ports, the RFID enable string, the traffic-light
//! probe, the event-log sinks, the alert gateway, and the ordered list of
//! member organizations. Workers receive plain values, not the config
//! handle.

use std::path::PathBuf;
use std::{env, fs};

use anyhow::{Context, Result};
use data_encoding::HEXLOWER_PERMISSIVE;
use serde::{Deserialize, Serialize};

/// Name of the application, used for config/log paths.
pub const APP_NAME: &str = "kaffi";

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// MDB bus port (the vending machine side).
    pub mdb: SerialConfig,
    /// RFID reader port and enable string.
    pub legi: LegiConfig,
    /// Traffic-light probe endpoint.
    pub ampel: AmpelConfig,
    /// Event-log sinks.
    pub log: LogConfig,
    /// Receive-timeout alert gateway.
    pub alert: AlertConfig,
    /// Member organizations in priority order; the first that authorizes a
    /// card wins.
    pub orgs: Vec<OrgConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mdb: SerialConfig {
                port: "/dev/ttyS0".to_string(),
                baud: 115_200,
                read_timeout_ms: 5000,
            },
            legi: LegiConfig {
                port: "/dev/ttyS1".to_string(),
                baud: 38_400,
                read_timeout_ms: 1000,
                enable: "0d80".to_string(),
            },
            ampel: AmpelConfig::default(),
            log: LogConfig::default(),
            alert: AlertConfig::default(),
            orgs: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SerialConfig {
    pub port: String,
    pub baud: u32,
    pub read_timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LegiConfig {
    pub port: String,
    pub baud: u32,
    pub read_timeout_ms: u64,
    /// Hex-encoded byte string written to the reader to arm the next read.
    pub enable: String,
}

impl LegiConfig {
    pub fn enable_bytes(&self) -> Result<Vec<u8>> {
        HEXLOWER_PERMISSIVE
            .decode(self.enable.as_bytes())
            .context("legi enable string is not valid hex")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct AmpelConfig {
    pub host: String,
    pub suffix: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct LogConfig {
    /// Local fallback event log, written by the daemon itself.
    pub faillog: PathBuf,
    /// Connection values for the accounting-database collaborator; passed
    /// through, not used by the daemon.
    pub db_uri: Option<String>,
    pub db_tbl: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            faillog: PathBuf::from("/var/log/kaffi-fail.log"),
            db_uri: None,
            db_tbl: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct AlertConfig {
    /// Mail-gateway endpoint for receive-timeout alerts. Alerts only hit the
    /// log when unset.
    pub gateway_url: Option<String>,
}

/// One member organization. The tag picks the adapter, the fields are that
/// org's endpoints and credentials.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OrgConfig {
    Vis {
        base_url: String,
        key: String,
    },
    Amiv {
        base_url: String,
        api_key: String,
        secret_key: String,
    },
    Vmp {
        status_url: String,
        report_url: String,
    },
}

impl Config {
    /// The configuration directory: `KAFFI_CONFIG_DIR` if set, otherwise the
    /// platform config dir.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = env::var("KAFFI_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("could not determine config directory")?
                .join(APP_NAME)
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("kaffi.json"))
    }

    /// Load the config file, with port overrides from the environment
    /// (`KAFFI_MDB_PORT`, `KAFFI_LEGI_PORT`).
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("invalid config file {}", path.display()))?,
            Err(_) => {
                log::warn!("no config file at {}, using defaults", path.display());
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = env::var("KAFFI_MDB_PORT") {
            self.mdb.port = port;
        }
        if let Ok(port) = env::var("KAFFI_LEGI_PORT") {
            self.legi.port = port;
        }
    }
}

/// The process log file: `KAFFI_LOG_FILE` if set, otherwise inside the
/// config directory. The watchdog alert mails the tail of this file.
pub fn log_file_path() -> PathBuf {
    if let Ok(path) = env::var("KAFFI_LOG_FILE") {
        return PathBuf::from(path);
    }
    Config::config_dir()
        .map(|dir| dir.join("kaffi.log"))
        .unwrap_or_else(|_| PathBuf::from("/tmp/kaffi.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sectioned_config() {
        let raw = r#"{
            "mdb": { "port": "/dev/ttyUSB0", "baud": 115200, "read_timeout_ms": 5000 },
            "legi": { "port": "/dev/ttyUSB1", "baud": 38400, "read_timeout_ms": 1000, "enable": "0d8001" },
            "ampel": { "host": "ampel.example.org", "suffix": "/status" },
            "log": { "faillog": "/tmp/fail.log" },
            "orgs": [
                { "kind": "vis", "base_url": "https://vis.example.org", "key": "s3cret" },
                { "kind": "vmp", "status_url": "https://vmp.example.org/check", "report_url": "https://vmp.example.org/bill" }
            ]
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.mdb.port, "/dev/ttyUSB0");
        assert_eq!(config.legi.enable_bytes().unwrap(), vec![0x0D, 0x80, 0x01]);
        assert_eq!(config.orgs.len(), 2);
        assert_eq!(
            config.orgs[0],
            OrgConfig::Vis {
                base_url: "https://vis.example.org".to_string(),
                key: "s3cret".to_string()
            }
        );
    }

    #[test]
    fn org_order_is_preserved() {
        let raw = r#"{ "orgs": [
            { "kind": "vmp", "status_url": "a", "report_url": "b" },
            { "kind": "vis", "base_url": "c", "key": "d" }
        ]}"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert!(matches!(config.orgs[0], OrgConfig::Vmp { .. }));
        assert!(matches!(config.orgs[1], OrgConfig::Vis { .. }));
    }

    #[test]
    fn invalid_enable_hex_is_an_error() {
        let legi = LegiConfig {
            port: String::new(),
            baud: 38_400,
            read_timeout_ms: 1000,
            enable: "zz".to_string(),
        };
        assert!(legi.enable_bytes().is_err());
    }
}
