use std::fs;
use std::net::UdpSocket;
use std::time::Duration;

use anyhow::Result;
use media::SessionConfig;
use serde::Deserialize;
use tracing::warn;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "default_sip_port")]
    pub sip_port: u16,
    #[serde(default = "default_rtp_port")]
    pub rtp_port: u16,
    #[serde(default = "default_rtp_port_range")]
    pub rtp_port_range: u16,
    #[serde(default = "default_jitter_buffer_size")]
    pub jitter_buffer_size: usize,
    /// Target jitter buffer delay in milliseconds.
    #[serde(default = "default_jitter_buffer_delay")]
    pub jitter_buffer_delay: u64,
    /// Hard ceiling in milliseconds; configuration only.
    #[serde(default = "default_max_jitter_buffer_delay")]
    pub max_jitter_buffer_delay: u64,
    /// Auto-answer delay in milliseconds.
    #[serde(default = "default_ring_duration")]
    pub ring_duration: u64,
    /// Registration lifetime in seconds.
    #[serde(default = "default_registration_expires")]
    pub registration_expires: u32,
    /// Advertised address; discovered from the host when absent.
    #[serde(default)]
    pub local_ip: Option<String>,
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_sip_port() -> u16 {
    5060
}

fn default_rtp_port() -> u16 {
    10000
}

fn default_rtp_port_range() -> u16 {
    100
}

fn default_jitter_buffer_size() -> usize {
    50
}

fn default_jitter_buffer_delay() -> u64 {
    100
}

fn default_max_jitter_buffer_delay() -> u64 {
    500
}

fn default_ring_duration() -> u64 {
    2000
}

fn default_registration_expires() -> u32 {
    3600
}

fn default_user() -> String {
    "lark".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sip_port: default_sip_port(),
            rtp_port: default_rtp_port(),
            rtp_port_range: default_rtp_port_range(),
            jitter_buffer_size: default_jitter_buffer_size(),
            jitter_buffer_delay: default_jitter_buffer_delay(),
            max_jitter_buffer_delay: default_max_jitter_buffer_delay(),
            ring_duration: default_ring_duration(),
            registration_expires: default_registration_expires(),
            local_ip: None,
            user: default_user(),
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &str) -> Result<Config> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("config {path} not readable ({e}), using defaults");
                return Ok(Config::default());
            }
        };
        Ok(toml::from_str(&contents)?)
    }

    pub fn local_ip(&self) -> String {
        self.local_ip
            .clone()
            .or_else(discover_local_ip)
            .unwrap_or_else(|| "127.0.0.1".to_string())
    }

    pub fn ring_duration(&self) -> Duration {
        Duration::from_millis(self.ring_duration)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            buffer_size: self.jitter_buffer_size,
            buffer_delay: Duration::from_millis(self.jitter_buffer_delay),
            max_buffer_delay: Duration::from_millis(self.max_jitter_buffer_delay),
        }
    }
}

/// The address the host would route packets out of, learned by aiming an
/// unconnected UDP socket at a public address. Nothing is sent; connect
/// just resolves the outbound interface.
fn discover_local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:5060").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sip_port, 5060);
        assert_eq!(config.rtp_port, 10000);
        assert_eq!(config.rtp_port_range, 100);
        assert_eq!(config.jitter_buffer_size, 50);
        assert_eq!(config.jitter_buffer_delay, 100);
        assert_eq!(config.max_jitter_buffer_delay, 500);
        assert_eq!(config.ring_duration, 2000);
        assert_eq!(config.registration_expires, 3600);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config =
            toml::from_str("sip_port = 5080\nring_duration = 100\n").unwrap();
        assert_eq!(config.sip_port, 5080);
        assert_eq!(config.ring_duration, 100);
        assert_eq!(config.rtp_port, 10000);
    }

    #[test]
    fn test_missing_file_is_defaults() {
        let config = Config::load("/nonexistent/lark.conf").unwrap();
        assert_eq!(config.sip_port, 5060);
    }

    #[test]
    fn test_configured_local_ip_wins() {
        let config = Config {
            local_ip: Some("192.0.2.10".to_string()),
            ..Default::default()
        };
        assert_eq!(config.local_ip(), "192.0.2.10");
    }

    #[test]
    fn test_local_ip_always_resolves() {
        // Either the route probe or the loopback fallback must yield a
        // parseable address.
        let config = Config::default();
        assert!(config.local_ip().parse::<std::net::IpAddr>().is_ok());
    }
}
