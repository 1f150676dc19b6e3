//! Broker configuration: a YAML document of upstream and intake settings.
//! Loading follows the reference CLI's `Config::load`/`save` shape (read,
//! parse, apply defaults) but swaps `serde_json` for `serde_yaml` and
//! drops the keyring/env-override machinery that CLI needed for its auth
//! token, which has no analogue here.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BrokerError;
use crate::queue::DropPolicy;
use crate::upstream::{self, HostPort, TlsOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the Unix intake socket.
    pub socket: PathBuf,
    /// Octal permission bits for the intake socket, e.g. `0o660`.
    #[serde(default)]
    pub perms: Option<u32>,
    /// `host[:port]` for the upstream Graylog endpoint.
    pub graylog: String,
    /// TLS options; presence enables TLS on the upstream connection.
    #[serde(default)]
    pub ssl: Option<TlsOptions>,
    /// Path to the spool file.
    #[serde(default = "default_buffer_path")]
    pub buffer: PathBuf,
    /// Path to the status file.
    #[serde(default = "default_status_path")]
    pub status: PathBuf,
    /// Path to the pidfile.
    #[serde(default = "default_pidfile_path")]
    pub pidfile: PathBuf,
    /// Optional cap on the in-memory queue; unset (the default) is
    /// unbounded, matching the reference broker's behavior.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Policy applied once `queue_capacity` is reached.
    #[serde(default)]
    pub queue_drop_policy: DropPolicy,
}

fn default_buffer_path() -> PathBuf {
    PathBuf::from("/var/run/gelf-broker.buffer")
}

fn default_status_path() -> PathBuf {
    PathBuf::from("/var/run/gelf-broker.status")
}

fn default_pidfile_path() -> PathBuf {
    PathBuf::from("/var/run/gelf-broker.pid")
}

impl Config {
    /// Read and parse a YAML configuration file, validating the required
    /// keys (`socket`, `graylog`). A missing or unparseable file, or a
    /// malformed `graylog` host, is a [`BrokerError::Configuration`] —
    /// fatal at startup, non-fatal (old config retained) at reload.
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Configuration(format!("read config {}: {e}", path.display()))
        })?;
        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            BrokerError::Configuration(format!("parse config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), BrokerError> {
        if self.socket.as_os_str().is_empty() {
            return Err(BrokerError::Configuration(
                "missing required key: socket".into(),
            ));
        }
        if self.graylog.trim().is_empty() {
            return Err(BrokerError::Configuration(
                "missing required key: graylog".into(),
            ));
        }
        self.graylog_hostport()?;
        Ok(())
    }

    /// The upstream host/port, parsed per the usual IPv4/IPv6/FQDN
    /// classification rules. Re-parsed rather than cached so a reload
    /// always reflects the document on disk.
    pub fn graylog_hostport(&self) -> Result<HostPort, BrokerError> {
        upstream::parse_host_port(&self.graylog)
    }
}
