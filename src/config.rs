//! Relay configuration file
//!
//! Every field is optional. Missing fields take the built-in defaults, and
//! numeric settings that are zero or negative fall back to them as well.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tunerbridge_proto::{
    DEFAULT_BUFFER_SIZE, DEFAULT_RECONNECT_INTERVAL_SECS, DEFAULT_REPLY_TIMEOUT_MS,
    DISCOVERY_PORT, TUNNEL_PORT,
};
use tunerbridge_relay::{
    default_capture_ip, AppRelayConfig, ClientRelayConfig, DirectRelayConfig, ReconnectConfig,
};

/// File name used by `--template`
pub const TEMPLATE_FILE: &str = "tunerbridge.json";

/// Relay configuration as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub hdhomerun_port: i64,
    pub tcp_port: i64,
    pub udp_read_timeout_ms: i64,
    pub udp_read_buffer_size: i64,
    pub reconnect_interval_seconds: i64,
    /// Ceiling on concurrent app-side queries (absent or 0 = unbounded)
    pub max_in_flight_queries: Option<usize>,
    pub debug: bool,
    pub app: AppSection,
    pub tuner: TunerSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub bind_address: String,
    pub direct_hdhomerun_ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerSection {
    pub app_proxy_host: String,
    pub direct_mode: bool,
    pub direct_hdhomerun_ip: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hdhomerun_port: DISCOVERY_PORT as i64,
            tcp_port: TUNNEL_PORT as i64,
            udp_read_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS as i64,
            udp_read_buffer_size: DEFAULT_BUFFER_SIZE as i64,
            reconnect_interval_seconds: DEFAULT_RECONNECT_INTERVAL_SECS as i64,
            max_in_flight_queries: None,
            debug: false,
            app: AppSection::default(),
            tuner: TunerSection::default(),
        }
    }
}

/// Where the active configuration came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    Defaults,
    Missing(PathBuf),
    File(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Defaults => write!(f, "No config file given, using defaults"),
            ConfigSource::Missing(path) => {
                write!(f, "Config file {:?} not found, using defaults", path)
            }
            ConfigSource::File(path) => write!(f, "Config loaded from {:?}", path),
        }
    }
}

/// How the app-side command should run
#[derive(Debug, Clone, PartialEq)]
pub enum AppMode {
    Tunnel { bind: IpAddr },
    Direct { bind: IpAddr, device: String },
}

/// How the tuner-side command should run
#[derive(Debug, Clone, PartialEq)]
pub enum TunerMode {
    Tunnel { host: String },
    Direct { device: String },
}

fn positive<T: TryFrom<i64>>(value: i64, default: T) -> T {
    if value > 0 {
        T::try_from(value).unwrap_or(default)
    } else {
        default
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl RelayConfig {
    /// Load from `path`, or use defaults when no path is given or the file is absent
    pub fn load(path: Option<&Path>) -> Result<(Self, ConfigSource)> {
        let Some(path) = path else {
            return Ok((Self::default(), ConfigSource::Defaults));
        };

        if !path.exists() {
            return Ok((Self::default(), ConfigSource::Missing(path.to_path_buf())));
        }

        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: RelayConfig = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok((config, ConfigSource::File(path.to_path_buf())))
    }

    /// Filled-in example configuration
    pub fn template() -> Self {
        Self {
            app: AppSection {
                bind_address: "0.0.0.0".to_string(),
                direct_hdhomerun_ip: "192.168.1.50".to_string(),
            },
            tuner: TunerSection {
                app_proxy_host: "10.10.10.9".to_string(),
                direct_mode: false,
                direct_hdhomerun_ip: "10.10.10.50".to_string(),
            },
            ..Self::default()
        }
    }

    /// Write the template configuration to `path`
    pub fn write_template(path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&Self::template())
            .context("Failed to serialize template config")?;

        fs::write(path, json)
            .with_context(|| format!("Failed to write template config: {:?}", path))?;

        Ok(())
    }

    pub fn discovery_port(&self) -> u16 {
        positive(self.hdhomerun_port, DISCOVERY_PORT)
    }

    pub fn tunnel_port(&self) -> u16 {
        positive(self.tcp_port, TUNNEL_PORT)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(positive(self.udp_read_timeout_ms, DEFAULT_REPLY_TIMEOUT_MS))
    }

    pub fn buffer_size(&self) -> usize {
        positive(self.udp_read_buffer_size, DEFAULT_BUFFER_SIZE)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(positive(
            self.reconnect_interval_seconds,
            DEFAULT_RECONNECT_INTERVAL_SECS,
        ))
    }

    pub fn query_ceiling(&self) -> Option<usize> {
        self.max_in_flight_queries.filter(|&max| max > 0)
    }

    /// Pick the app-side mode; command-line values win over the file
    pub fn app_mode(&self, bind: Option<String>, device: Option<String>) -> Result<AppMode> {
        let bind = non_empty(bind)
            .or_else(|| non_empty(Some(self.app.bind_address.clone())))
            .unwrap_or_else(|| Ipv4Addr::UNSPECIFIED.to_string());
        let bind: IpAddr = bind
            .trim()
            .parse()
            .with_context(|| format!("Invalid bind address: {}", bind))?;

        let device =
            non_empty(device).or_else(|| non_empty(Some(self.app.direct_hdhomerun_ip.clone())));

        match device {
            Some(device) => Ok(AppMode::Direct { bind, device }),
            None => Ok(AppMode::Tunnel { bind }),
        }
    }

    /// Pick the tuner-side mode; command-line values win over the file
    pub fn tuner_mode(&self, host: Option<String>, direct: bool) -> Result<TunerMode> {
        let direct = direct || self.tuner.direct_mode;

        let fallback = if direct {
            &self.tuner.direct_hdhomerun_ip
        } else {
            &self.tuner.app_proxy_host
        };

        let Some(host) = non_empty(host).or_else(|| non_empty(Some(fallback.clone()))) else {
            if direct {
                bail!("Tuner direct mode requires the HDHomeRun IP address");
            }
            bail!("Tuner mode requires the app relay host");
        };

        if direct {
            Ok(TunerMode::Direct { device: host })
        } else {
            Ok(TunerMode::Tunnel { host })
        }
    }

    pub fn app_relay_config(&self, bind: IpAddr) -> AppRelayConfig {
        AppRelayConfig {
            bind_addr: SocketAddr::new(bind, self.tunnel_port()),
            query_target: SocketAddr::from((Ipv4Addr::BROADCAST, self.discovery_port())),
            reply_timeout: self.reply_timeout(),
            buffer_size: self.buffer_size(),
            max_in_flight_queries: self.query_ceiling(),
        }
    }

    pub fn client_relay_config(&self, host: String) -> ClientRelayConfig {
        ClientRelayConfig {
            capture_addr: SocketAddr::from((default_capture_ip(), self.discovery_port())),
            remote_host: host,
            tunnel_port: self.tunnel_port(),
            reconnect: ReconnectConfig {
                interval: self.reconnect_interval(),
            },
            buffer_size: self.buffer_size(),
            ..ClientRelayConfig::new(String::new())
        }
    }

    pub fn direct_relay_config(
        &self,
        listen_ip: IpAddr,
        device_addr: SocketAddr,
    ) -> DirectRelayConfig {
        DirectRelayConfig {
            listen_addr: SocketAddr::new(listen_ip, self.discovery_port()),
            device_addr,
            reply_timeout: self.reply_timeout(),
            buffer_size: self.buffer_size(),
        }
    }
}
