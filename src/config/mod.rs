//! Configuration management
//!
//! The configuration is a JSON document. Unknown keys are ignored so a
//! config written for a richer build keeps loading here.

use crate::protocol::hash_password;
use serde::Deserialize;
use sha2::{Digest, Sha224};
use std::collections::HashMap;
use std::path::Path;

/// Run modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Client,
    Server,
    Forward,
    Nat,
    ClientTun,
    ServerTun,
}

impl RunType {
    /// Modes that accept plaintext local connections and dial the
    /// remote server over TLS
    pub fn is_client_side(self) -> bool {
        !matches!(self, RunType::Server | RunType::ServerTun)
    }
}

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub run_type: RunType,
    #[serde(default)]
    pub local_addr: String,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub remote_port: u16,
    #[serde(default)]
    pub target_addr: String,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default)]
    pub password: Vec<String>,
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout: u64,
    /// Socket buffer size for UDP relays; non-positive means the
    /// compile-time default
    #[serde(default = "default_udp_socket_buf")]
    pub udp_socket_buf: i64,
    /// Numeric severity 0-5: trace, debug, info, warn, error, off
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub experimental: ExperimentalConfig,
    #[serde(default)]
    pub tun: TunConfig,

    /// Recognized authenticators: hex(SHA224(password)) -> password
    #[serde(skip)]
    pub password_hashes: HashMap<String, String>,
    /// Digest of the raw config document, kept to detect reloads
    #[serde(skip)]
    pub digest: String,
    /// Load-balance sub-configs, resolved from
    /// `experimental.pipeline_loadbalance_configs`
    #[serde(skip)]
    pub loadbalance_configs: Vec<Config>,
}

/// TLS profile
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub verify: bool,
    pub verify_hostname: bool,
    pub cert: String,
    pub key: String,
    pub key_password: String,
    pub cipher: String,
    pub cipher_tls13: String,
    pub prefer_server_cipher: bool,
    pub sni: String,
    pub alpn: Vec<String>,
    pub reuse_session: bool,
    pub session_ticket: bool,
    pub session_timeout: u64,
    /// Path of the decoy response served to unauthenticated peers
    pub plain_http_response: String,
    pub curves: String,
    pub dhparam: String,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            verify: true,
            verify_hostname: true,
            cert: String::new(),
            key: String::new(),
            key_password: String::new(),
            cipher: String::new(),
            cipher_tls13: String::new(),
            prefer_server_cipher: true,
            sni: String::new(),
            alpn: vec!["http/1.1".to_string()],
            reuse_session: true,
            session_ticket: false,
            session_timeout: 600,
            plain_http_response: String::new(),
            curves: String::new(),
            dhparam: String::new(),
        }
    }
}

/// TCP socket tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub prefer_ipv4: bool,
    pub no_delay: bool,
    pub keep_alive: bool,
    pub reuse_port: bool,
    pub fast_open: bool,
    pub fast_open_qlen: u32,
    pub connect_time_out: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            prefer_ipv4: false,
            no_delay: true,
            keep_alive: true,
            reuse_port: false,
            fast_open: false,
            fast_open_qlen: 20,
            connect_time_out: 10,
        }
    }
}

/// Experimental features
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExperimentalConfig {
    pub pipeline_num: u32,
    pub pipeline_ack_window: u32,
    pub pipeline_loadbalance_configs: Vec<String>,
    pub pipeline_proxy_icmp: bool,
}

impl Default for ExperimentalConfig {
    fn default() -> Self {
        Self {
            pipeline_num: 0,
            pipeline_ack_window: 200,
            pipeline_loadbalance_configs: Vec::new(),
            pipeline_proxy_icmp: false,
        }
    }
}

/// TUN device parameters, consumed by the external layer-3 stack
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunConfig {
    pub tun_name: String,
    pub net_ip: String,
    pub net_mask: String,
    pub mtu: u16,
    pub tun_fd: i32,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            tun_name: String::new(),
            net_ip: String::new(),
            net_mask: String::new(),
            mtu: 1500,
            tun_fd: -1,
        }
    }
}

fn default_udp_timeout() -> u64 {
    60
}

fn default_udp_socket_buf() -> i64 {
    -1
}

fn default_log_level() -> u8 {
    1
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            crate::Error::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::populate(&content)
    }

    /// Parse configuration from a JSON string
    pub fn populate(json: &str) -> crate::Result<Self> {
        let mut config: Config = serde_json::from_str(json)
            .map_err(|e| crate::Error::Config(format!("cannot parse config: {}", e)))?;

        config.password_hashes = config
            .password
            .iter()
            .map(|p| (hash_password(p), p.clone()))
            .collect();

        let mut hasher = Sha224::new();
        hasher.update(json.as_bytes());
        config.digest = hex::encode(hasher.finalize());

        config.load_balance_subconfigs()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the SIP003 plugin environment protocol.
    ///
    /// Returns `Ok(None)` when `SS_PLUGIN_OPTIONS` is unset. CLIENT,
    /// NAT and TUN modes cannot run as a plugin.
    pub fn sip003() -> crate::Result<Option<Self>> {
        let json = match std::env::var("SS_PLUGIN_OPTIONS") {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        let mut config = Self::populate(&json)?;

        let env = |key: &str| -> crate::Result<String> {
            std::env::var(key)
                .map_err(|_| crate::Error::Config(format!("SIP003 requires {}", key)))
        };
        let env_port = |key: &str| -> crate::Result<u16> {
            env(key)?
                .parse()
                .map_err(|_| crate::Error::Config(format!("{} is not a port", key)))
        };

        match config.run_type {
            RunType::Server => {
                config.local_addr = env("SS_REMOTE_HOST")?;
                config.local_port = env_port("SS_REMOTE_PORT")?;
            }
            RunType::Forward => {
                config.remote_addr = env("SS_REMOTE_HOST")?;
                config.remote_port = env_port("SS_REMOTE_PORT")?;
                config.local_addr = env("SS_LOCAL_HOST")?;
                config.local_port = env_port("SS_LOCAL_PORT")?;
            }
            _ => {
                return Err(crate::Error::Config(
                    "SIP003 with wrong run_type".to_string(),
                ))
            }
        }
        Ok(Some(config))
    }

    /// The authenticator every outbound stream leads with
    pub fn first_password_hash(&self) -> Option<&str> {
        // HashMap order is arbitrary but stable within one process run;
        // any configured password authenticates equally
        self.password_hashes.keys().next().map(|s| s.as_str())
    }

    /// `local_addr:local_port`
    pub fn local_endpoint(&self) -> String {
        format!("{}:{}", self.local_addr, self.local_port)
    }

    /// `remote_addr:remote_port`
    pub fn remote_endpoint(&self) -> String {
        format!("{}:{}", self.remote_addr, self.remote_port)
    }

    /// UDP read buffer size, falling back to the compile-time default
    pub fn udp_read_buf_len(&self) -> usize {
        if self.udp_socket_buf > 0 {
            self.udp_socket_buf as usize
        } else {
            crate::MAX_BUF_LENGTH
        }
    }

    /// Map the numeric `log_level` to a tracing directive
    pub fn log_directive(&self) -> &'static str {
        match self.log_level {
            0 => "trace",
            1 => "debug",
            2 => "info",
            3 => "warn",
            4 => "error",
            _ => "off",
        }
    }

    fn load_balance_subconfigs(&mut self) -> crate::Result<()> {
        let paths = self.experimental.pipeline_loadbalance_configs.clone();
        if paths.is_empty() {
            return Ok(());
        }
        if self.experimental.pipeline_num == 0 {
            return Err(crate::Error::Config(
                "pipeline load balance needs pipeline_num > 0".to_string(),
            ));
        }
        for path in &paths {
            match Self::load(path) {
                Ok(sub) => self.loadbalance_configs.push(sub),
                Err(e) => {
                    tracing::warn!("skipping load balance config {}: {}", path, e);
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> crate::Result<()> {
        if self.password.is_empty() && matches!(self.run_type, RunType::Server | RunType::ServerTun)
        {
            return Err(crate::Error::Config(
                "server requires at least one password".to_string(),
            ));
        }
        if self.run_type.is_client_side() && self.password.is_empty() {
            return Err(crate::Error::Config(
                "client requires a password".to_string(),
            ));
        }
        if self.run_type == RunType::Forward && self.target_addr.is_empty() {
            return Err(crate::Error::Config(
                "forward mode requires target_addr/target_port".to_string(),
            ));
        }
        Ok(())
    }
}
