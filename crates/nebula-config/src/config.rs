//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Ports, buffers and handshake identity.
    pub network: NetworkConfig,
    /// Optional TLS on the stream leg.
    pub tls: TlsConfig,
    /// Logging settings.
    pub debug: DebugConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Label used in log lines and peer names.
    pub label: String,
    /// Host a client connects to, or address a server binds to.
    pub host: String,
    /// Stream (TCP) port. -1 disables the stream leg.
    pub stream_port: i32,
    /// Datagram (UDP) port. -1 disables the datagram leg.
    pub datagram_port: i32,
    /// Game name clients must present to join.
    pub game_name: String,
    /// Protocol version clients must present to join.
    pub version: u32,
    /// Pause between loop iterations in milliseconds (0 = yield).
    pub loop_delay_ms: u64,
    /// Per-channel stream buffer capacity in bytes.
    pub stream_buffer: usize,
    /// Largest datagram in bytes.
    pub datagram_buffer: usize,
    /// Servers drop datagram senders that never join after this many
    /// milliseconds of silence.
    pub connector_idle_ms: u64,
    /// How long `discover` waits for answers, in milliseconds.
    pub discovery_timeout_ms: u64,
}

/// TLS configuration. Paths point at PEM files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    /// Server certificate chain.
    pub cert_path: Option<PathBuf>,
    /// Server private key.
    pub key_path: Option<PathBuf>,
    /// CA bundle a client trusts.
    pub ca_path: Option<PathBuf>,
    /// Name a client expects in the server certificate.
    pub server_name: String,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "nebula_link=trace").
    pub log_level: String,
    /// Directory for the JSON log file in debug builds.
    pub log_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            label: "Nebula".to_string(),
            host: "127.0.0.1".to_string(),
            stream_port: 7777,
            datagram_port: 7778,
            game_name: "nebula".to_string(),
            version: 1,
            loop_delay_ms: 1,
            stream_buffer: 16 * 1024,
            datagram_buffer: 65_507,
            connector_idle_ms: 10_000,
            discovery_timeout_ms: 1000,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl TlsConfig {
    /// Certificate chain and key a server needs.
    pub fn server_paths(&self) -> Result<(&Path, &Path), ConfigError> {
        let cert = self
            .cert_path
            .as_deref()
            .ok_or(ConfigError::MissingTlsPath("tls.cert_path"))?;
        let key = self
            .key_path
            .as_deref()
            .ok_or(ConfigError::MissingTlsPath("tls.key_path"))?;
        Ok((cert, key))
    }

    /// CA bundle a client trusts.
    pub fn client_ca(&self) -> Result<&Path, ConfigError> {
        self.ca_path
            .as_deref()
            .ok_or(ConfigError::MissingTlsPath("tls.ca_path"))
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Platform config directory for this tool, e.g. `~/.config/nebula-link`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("nebula-link"))
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Returns `Some(new_config)` if the file on disk differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let contents =
            std::fs::read_to_string(config_dir.join(CONFIG_FILE)).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_serializes() {
        let ron_str =
            ron::ser::to_string_pretty(&Config::default(), ron::ser::PrettyConfig::new().depth_limit(3))
                .unwrap();
        assert!(ron_str.contains("stream_port: 7777"));
        assert!(ron_str.contains("datagram_port: 7778"));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let config: Config = ron::from_str("(network: (stream_port: -1))").unwrap();
        assert_eq!(config.network.stream_port, -1);
        assert_eq!(config.network.datagram_port, 7778);
        assert_eq!(config.network.connector_idle_ms, 10_000);
        assert_eq!(config.tls, TlsConfig::default());
        assert_eq!(config.debug, DebugConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_tls_paths_parse() {
        let config: Config =
            ron::from_str(r#"(tls: (enabled: true, cert_path: Some("cert.pem"), server_name: "localhost"))"#)
                .unwrap();
        assert!(config.tls.enabled);
        assert_eq!(config.tls.cert_path, Some(PathBuf::from("cert.pem")));
        assert_eq!(config.tls.key_path, None);
    }

    #[test]
    fn test_missing_tls_paths_are_reported() {
        let tls = TlsConfig {
            enabled: true,
            cert_path: Some(PathBuf::from("cert.pem")),
            ..TlsConfig::default()
        };
        assert!(matches!(
            tls.server_paths(),
            Err(ConfigError::MissingTlsPath("tls.key_path"))
        ));
        assert!(matches!(tls.client_ca(), Err(ConfigError::MissingTlsPath("tls.ca_path"))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.host = "10.0.0.1".to_string();
        config.network.datagram_port = -1;
        config.debug.log_level = "debug".to_string();

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.network.version = 2;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.network.version, 2);
    }

    #[test]
    fn test_invalid_ron_produces_error() {
        let result: Result<Config, _> = ron::from_str("{{not valid}}");
        assert!(result.is_err());
    }
}
