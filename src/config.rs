//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub access: AccessConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub emulation: EmulationConfig,
    /// Explicit port bindings; ports without one use their conventional service
    #[serde(default)]
    pub handlers: Vec<HandlerBindingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub ports: Vec<u16>,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Upper bound on bytes read per readiness event
    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
}

fn default_backlog() -> u32 {
    128
}

fn default_read_buffer_bytes() -> usize {
    4096
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessConfig {
    /// CIDR ranges allowed to connect. No default: "0.0.0.0/0" must be spelled out.
    pub allowed_networks: Vec<String>,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_threshold")]
    pub rate_limit_threshold: usize,
    /// How often idle rate windows are dropped
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,
    /// Live connections allowed per source IP (0 = unlimited)
    #[serde(default)]
    pub max_connections_per_ip: usize,
}

fn default_rate_limit_window_secs() -> u64 {
    60
}

fn default_rate_limit_threshold() -> usize {
    100
}

fn default_eviction_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_payload_dir")]
    pub payload_dir: String,
    #[serde(default = "default_session_dir")]
    pub session_dir: String,
}

fn default_payload_dir() -> String {
    "captures/payloads".to_string()
}

fn default_session_dir() -> String {
    "captures/sessions".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            payload_dir: default_payload_dir(),
            session_dir: default_session_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_operational_log")]
    pub operational_log: String,
    #[serde(default = "default_security_log")]
    pub security_log: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_operational_log() -> String {
    "logs/honeypot.log".to_string()
}

fn default_security_log() -> String {
    "logs/security_warning.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            operational_log: default_operational_log(),
            security_log: default_security_log(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmulationConfig {
    pub ftp_banner: String,
    pub ssh_banner: String,
    pub telnet_banner: String,
    pub smtp_banner: String,
    pub pop3_banner: String,
    pub http_server: String,
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            ftp_banner: "220 Welcome to the FTP honeypot".to_string(),
            ssh_banner: "SSH-2.0-OpenSSH_7.9p1 Debian-10+deb9u1".to_string(),
            telnet_banner: "Ubuntu 20.04 LTS".to_string(),
            smtp_banner: "220 mail.example.com ESMTP".to_string(),
            pop3_banner: "+OK POP3 server ready".to_string(),
            http_server: "Apache/2.4.41 (Ubuntu)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HandlerBindingConfig {
    pub port: u16,
    pub handler: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path))
            .add_source(
                config::Environment::with_prefix("HONEYPOT")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.ports")
                    .with_list_parse_key("access.allowed_networks")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate server config
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }
        if self.server.ports.is_empty() {
            anyhow::bail!("At least one listening port must be configured");
        }
        let mut seen = HashSet::new();
        for port in &self.server.ports {
            if *port == 0 {
                anyhow::bail!("Invalid port: 0 is not allowed");
            }
            if !seen.insert(*port) {
                anyhow::bail!("Port {} is listed more than once", port);
            }
        }
        if self.server.read_buffer_bytes == 0 {
            anyhow::bail!("read_buffer_bytes must be greater than zero");
        }

        // Validate access config
        if self.access.allowed_networks.is_empty() {
            anyhow::bail!(
                "allowed_networks is empty; every connection would be refused (use \"0.0.0.0/0\" to allow all)"
            );
        }
        if self.access.rate_limit_window_secs == 0 {
            anyhow::bail!("rate_limit_window_secs must be greater than zero");
        }
        if self.access.rate_limit_threshold == 0 {
            anyhow::bail!("rate_limit_threshold must be greater than zero");
        }
        if self.access.eviction_interval_secs == 0 {
            anyhow::bail!("eviction_interval_secs must be greater than zero");
        }

        // Validate handler bindings
        let mut bound = HashSet::new();
        for binding in &self.handlers {
            if !crate::handlers::is_known(&binding.handler) {
                anyhow::bail!(
                    "Unknown handler '{}' for port {}. Must be one of: {:?}",
                    binding.handler,
                    binding.port,
                    crate::handlers::KNOWN_HANDLERS
                );
            }
            if !bound.insert(binding.port) {
                anyhow::bail!("Port {} has more than one handler binding", binding.port);
            }
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging level '{}'. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                ports: vec![21, 80],
                backlog: default_backlog(),
                read_buffer_bytes: default_read_buffer_bytes(),
            },
            access: AccessConfig {
                allowed_networks: vec!["10.0.0.0/8".to_string()],
                rate_limit_window_secs: 60,
                rate_limit_threshold: 100,
                eviction_interval_secs: 300,
                max_connections_per_ip: 0,
            },
            capture: CaptureConfig::default(),
            logging: LoggingConfig::default(),
            emulation: EmulationConfig::default(),
            handlers: vec![],
        }
    }

    #[test]
    fn test_sample_is_valid() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_duplicate_ports_rejected() {
        let mut config = sample();
        config.server.ports = vec![21, 21];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_allow_list_rejected() {
        let mut config = sample();
        config.access.allowed_networks.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_handler_rejected() {
        let mut config = sample();
        config.handlers.push(HandlerBindingConfig {
            port: 21,
            handler: "gopher".to_string(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = sample();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let raw = r#"
            [server]
            host = "127.0.0.1"
            ports = [21, 110]

            [access]
            allowed_networks = ["0.0.0.0/0"]

            [[handlers]]
            port = 2121
            handler = "ftp"
        "#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.server.ports, vec![21, 110]);
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.access.rate_limit_window_secs, 60);
        assert_eq!(config.access.rate_limit_threshold, 100);
        assert_eq!(config.handlers[0].port, 2121);
        assert_eq!(config.capture.payload_dir, "captures/payloads");
        assert!(config.validate().is_ok());
    }
}
