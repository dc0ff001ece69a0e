//! Server configuration and the port-personality map.
//!
//! Besides the usual knobs, the listening ports themselves are part of
//! the feature set: two contiguous 10-port ranges select greeting
//! delays and drop-after-delay behaviour by their offset into
//! [`DELAY_OPTIONS`], and two further ports select implicit TLS and
//! STARTTLS. Validation rejects layouts where those ranges and ports
//! collide.

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Discrete delays (seconds) selected by the offset into a behaviour
/// port range.
pub const DELAY_OPTIONS: [u64; 10] = [0, 1, 2, 8, 10, 30, 60, 120, 300, 600];

/// Number of ports in each behaviour range.
pub const DELAY_COUNT: u16 = DELAY_OPTIONS.len() as u16;

/// Longest SMTP command line we accept, in bytes.
pub const MAX_COMMAND_LINE: usize = 4096;

/// Global default for the largest acceptable message (10 MiB). A
/// per-session SIZE negotiated from the EHLO hostname overrides it.
pub const MAX_MESSAGE_SIZE: u64 = 10 * 1024 * 1024;

/// Banner slogan, completing `220 <identity> ESMTP <greeting>`.
pub const SERVER_GREETING: &str = "FaultMTA - the reliably unreliable mail server";

pub const DEFAULT_PORT: u16 = 2525;
pub const DEFAULT_GREETING_DELAY_PORT_START: u16 = 25200;
pub const DEFAULT_DROP_DELAY_PORT_START: u16 = 25600;
pub const DEFAULT_TLS_PORT: u16 = 25465;
pub const DEFAULT_STARTTLS_PORT: u16 = 25587;
pub const DEFAULT_TLS_HOSTNAME: &str = "faultmta.test";

/// What a listening port asks of the sessions accepted on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    Normal,
    ImplicitTls,
    StartTls,
}

/// The behaviour view derived from a port number at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBehaviour {
    pub greeting_delay: Duration,
    /// Close this long after the banner. Offset 0 of the drop range is
    /// represented by `drop_immediate` instead.
    pub drop_delay: Option<Duration>,
    /// Close without writing a single byte.
    pub drop_immediate: bool,
    pub role: PortRole,
}

impl PortBehaviour {
    pub fn normal() -> Self {
        Self {
            greeting_delay: Duration::ZERO,
            drop_delay: None,
            drop_immediate: false,
            role: PortRole::Normal,
        }
    }
}

fn default_listen_address() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_greeting_start() -> u16 {
    DEFAULT_GREETING_DELAY_PORT_START
}
fn default_drop_start() -> u16 {
    DEFAULT_DROP_DELAY_PORT_START
}
fn default_tls_port() -> u16 {
    DEFAULT_TLS_PORT
}
fn default_starttls_port() -> u16 {
    DEFAULT_STARTTLS_PORT
}
fn default_tls_hostname() -> String {
    DEFAULT_TLS_HOSTNAME.to_string()
}
fn default_maildir() -> PathBuf {
    PathBuf::from("./mailbox")
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_max_message_size() -> u64 {
    MAX_MESSAGE_SIZE
}

/// The full daemon configuration. Unknown fields are rejected, which
/// also rejects the retired wide-range port layout by name.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_greeting_start")]
    pub greeting_delay_port_start: u16,

    #[serde(default = "default_drop_start")]
    pub drop_delay_port_start: u16,

    #[serde(default = "default_tls_port")]
    pub tls_port: u16,

    #[serde(default = "default_starttls_port")]
    pub starttls_port: u16,

    #[serde(default = "default_maildir")]
    pub maildir: PathBuf,

    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,

    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,

    #[serde(default = "default_tls_hostname")]
    pub tls_hostname: String,

    /// Route deliveries to per-hostname maildirs instead of the single
    /// `maildir` path.
    #[serde(default)]
    pub hostname_routing: bool,

    #[serde(default)]
    pub hostname_maildirs: HashMap<String, PathBuf>,

    /// Fallback directory for hostnames missing from the map.
    #[serde(default)]
    pub default_maildir: Option<PathBuf>,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserializes via defaults")
    }
}

impl ServerConfig {
    /// Load from an optional TOML file, then apply `FAULTMTAD_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config: Self = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                toml::from_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        Ok(config)
    }

    fn apply_env_overrides(
        &mut self,
        vars: impl Iterator<Item = (String, String)>,
    ) -> anyhow::Result<()> {
        for (key, value) in vars {
            match key.as_str() {
                "FAULTMTAD_LISTEN_ADDRESS" => self.listen_address = value,
                "FAULTMTAD_MAILDIR" => self.maildir = PathBuf::from(value),
                "FAULTMTAD_TLS_CERT_FILE" => self.tls_cert_file = Some(PathBuf::from(value)),
                "FAULTMTAD_TLS_KEY_FILE" => self.tls_key_file = Some(PathBuf::from(value)),
                "FAULTMTAD_TLS_HOSTNAME" => self.tls_hostname = value,
                "FAULTMTAD_PORT" => self.port = parse_port(&key, &value)?,
                "FAULTMTAD_GREETING_DELAY_PORT_START" => {
                    self.greeting_delay_port_start = parse_port(&key, &value)?
                }
                "FAULTMTAD_DROP_DELAY_PORT_START" => {
                    self.drop_delay_port_start = parse_port(&key, &value)?
                }
                "FAULTMTAD_TLS_PORT" => self.tls_port = parse_port(&key, &value)?,
                "FAULTMTAD_STARTTLS_PORT" => self.starttls_port = parse_port(&key, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Resolve the behaviour a session on `port` should exhibit.
    pub fn behaviour_for_port(&self, port: u16) -> PortBehaviour {
        let mut behaviour = PortBehaviour::normal();

        if let Some(offset) = range_offset(port, self.greeting_delay_port_start) {
            behaviour.greeting_delay = Duration::from_secs(DELAY_OPTIONS[offset as usize]);
        }

        if let Some(offset) = range_offset(port, self.drop_delay_port_start) {
            if offset == 0 {
                behaviour.drop_immediate = true;
            } else {
                behaviour.drop_delay =
                    Some(Duration::from_secs(DELAY_OPTIONS[offset as usize]));
            }
        }

        if port == self.tls_port {
            behaviour.role = PortRole::ImplicitTls;
        } else if port == self.starttls_port {
            behaviour.role = PortRole::StartTls;
        }

        behaviour
    }

    pub fn describe_port(&self, port: u16) -> String {
        let behaviour = self.behaviour_for_port(port);
        if behaviour.drop_immediate {
            return "immediate drop".to_string();
        }
        if let Some(delay) = behaviour.drop_delay {
            return format!("drop after {}s", delay.as_secs());
        }
        if !behaviour.greeting_delay.is_zero() {
            return format!("greeting delay {}s", behaviour.greeting_delay.as_secs());
        }
        match behaviour.role {
            PortRole::ImplicitTls => "implicit TLS".to_string(),
            PortRole::StartTls => "STARTTLS".to_string(),
            PortRole::Normal => "normal behaviour".to_string(),
        }
    }

    /// Reject layouts where the behaviour ranges overlap each other or
    /// swallow one of the individual ports.
    pub fn validate(&self) -> anyhow::Result<()> {
        let greeting = NamedRange::new("greeting delay", self.greeting_delay_port_start);
        let drop = NamedRange::new("drop delay", self.drop_delay_port_start);

        if greeting.overlaps(&drop) {
            anyhow::bail!(
                "port ranges overlap: {} ({}-{}) and {} ({}-{})",
                greeting.name,
                greeting.start,
                greeting.end,
                drop.name,
                drop.start,
                drop.end,
            );
        }

        let ports = [
            ("normal", self.port),
            ("TLS", self.tls_port),
            ("STARTTLS", self.starttls_port),
        ];
        for (name, port) in ports {
            for range in [&greeting, &drop] {
                if range.contains(port) {
                    anyhow::bail!(
                        "{name} port {port} conflicts with {} range ({}-{})",
                        range.name,
                        range.start,
                        range.end,
                    );
                }
            }
        }
        for i in 0..ports.len() {
            for j in i + 1..ports.len() {
                if ports[i].1 == ports[j].1 {
                    anyhow::bail!(
                        "{} port {} conflicts with {} port {}",
                        ports[i].0,
                        ports[i].1,
                        ports[j].0,
                        ports[j].1,
                    );
                }
            }
        }

        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn parse_port(key: &str, value: &str) -> anyhow::Result<u16> {
    value
        .parse()
        .with_context(|| format!("invalid port number for {key}: {value:?}"))
}

fn range_offset(port: u16, start: u16) -> Option<u16> {
    if port >= start && port < start.saturating_add(DELAY_COUNT) {
        Some(port - start)
    } else {
        None
    }
}

struct NamedRange {
    name: &'static str,
    start: u16,
    end: u16,
}

impl NamedRange {
    fn new(name: &'static str, start: u16) -> Self {
        Self {
            name,
            start,
            end: start.saturating_add(DELAY_COUNT - 1),
        }
    }

    fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}
