//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via SMARTRPC_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use smartrpc_client::connection::{DEFAULT_READ_BUFFER_SIZE, DEFAULT_REMOTE_BZR, DEFAULT_SSH_PROGRAM};
use smartrpc_client::{ConnectionConfig, TlsClientConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SMARTRPC_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionSection,
    pub ssh: SshSection,
    pub tls: TlsSection,
}

impl Config {
    /// Loads `path` (or the file named by `SMARTRPC_CONFIG`), then applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => {
                let config = Self::from_file(&path)?;
                tracing::debug!("Loaded config from {}", path.display());
                config
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Applies overrides looked up through `var`.
    fn apply_env_overrides<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.connection.apply_env_overrides(&var)?;
        self.ssh.apply_env_overrides(&var);
        Ok(())
    }

    /// Builds the settings handed to the client library.
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut tls = TlsClientConfig::new();
        tls.ca_cert_path = self.tls.ca_cert.clone();
        tls.client_cert_path = self.tls.client_cert.clone();
        tls.client_key_path = self.tls.client_key.clone();
        tls.insecure = self.tls.insecure;
        tls.server_name = self.tls.server_name.clone();

        ConnectionConfig::new()
            .with_connect_timeout(secs(self.connection.connect_timeout_secs))
            .with_read_timeout(secs(self.connection.read_timeout_secs))
            .with_write_timeout(secs(self.connection.write_timeout_secs))
            .with_read_buffer_size(self.connection.read_buffer_size)
            .with_tls(tls)
            .with_ssh_program(self.ssh.program.clone())
            .with_remote_bzr(self.ssh.remote_bzr.clone())
    }
}

/// A zero timeout means none.
fn secs(value: Option<u64>) -> Option<Duration> {
    value.filter(|s| *s > 0).map(Duration::from_secs)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub write_timeout_secs: Option<u64>,
    pub read_buffer_size: usize,
    /// Never re-send a request after a connection reset.
    pub no_retry: bool,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: Some(30),
            read_timeout_secs: None,
            write_timeout_secs: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            no_retry: false,
        }
    }
}

impl ConnectionSection {
    fn apply_env_overrides<F>(&mut self, var: &F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = var("SMARTRPC_CONNECT_TIMEOUT") {
            self.connect_timeout_secs = Some(parse_env("SMARTRPC_CONNECT_TIMEOUT", &value)?);
        }
        if let Some(value) = var("SMARTRPC_READ_TIMEOUT") {
            self.read_timeout_secs = Some(parse_env("SMARTRPC_READ_TIMEOUT", &value)?);
        }
        if let Some(value) = var("SMARTRPC_WRITE_TIMEOUT") {
            self.write_timeout_secs = Some(parse_env("SMARTRPC_WRITE_TIMEOUT", &value)?);
        }
        if let Some(value) = var("SMARTRPC_NO_RETRY") {
            self.no_retry = matches!(value.trim(), "1" | "true" | "yes");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSection {
    /// SSH client executable.
    pub program: String,
    /// `bzr` executable on the remote host.
    pub remote_bzr: String,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            program: DEFAULT_SSH_PROGRAM.to_string(),
            remote_bzr: DEFAULT_REMOTE_BZR.to_string(),
        }
    }
}

impl SshSection {
    fn apply_env_overrides<F>(&mut self, var: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(program) = var("SMARTRPC_SSH").filter(|v| !v.is_empty()) {
            self.program = program;
        }
        if let Some(path) = var("BZR_REMOTE_PATH").filter(|v| !v.is_empty()) {
            self.remote_bzr = path;
        }
    }
}

/// TLS settings for `https://` and `bzr+https://`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSection {
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub insecure: bool,
    pub server_name: Option<String>,
}

fn parse_env(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key,
        value: value.to_string(),
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_library() {
        let config = Config::default().connection_config();
        assert_eq!(config, ConnectionConfig::new());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "connection:\n  read_timeout_secs: 5\n  read_buffer_size: 512\nssh:\n  program: plink\ntls:\n  insecure: true"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.connection.read_timeout_secs, Some(5));
        assert_eq!(config.connection.connect_timeout_secs, Some(30));
        assert_eq!(config.ssh.program, "plink");
        assert_eq!(config.ssh.remote_bzr, "bzr");

        let conn = config.connection_config();
        assert_eq!(conn.read_timeout, Some(Duration::from_secs(5)));
        // Clamped to the library minimum.
        assert_eq!(conn.read_buffer_size, 1024);
        assert!(conn.tls.insecure);
    }

    #[test]
    fn test_missing_and_malformed_files() {
        let err = Config::from_file("/nonexistent/smartrpc.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(..)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connection: [not, a, map]").unwrap();
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(..)));
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(env(&[
                ("SMARTRPC_CONNECT_TIMEOUT", "0"),
                ("SMARTRPC_WRITE_TIMEOUT", "7"),
                ("SMARTRPC_SSH", "/usr/bin/ssh"),
                ("BZR_REMOTE_PATH", "/opt/bzr/bin/bzr"),
                ("SMARTRPC_NO_RETRY", "yes"),
            ]))
            .unwrap();

        assert!(config.connection.no_retry);
        let conn = config.connection_config();
        assert_eq!(conn.connect_timeout, None);
        assert_eq!(conn.write_timeout, Some(Duration::from_secs(7)));
        assert_eq!(conn.ssh_program, "/usr/bin/ssh");
        assert_eq!(conn.remote_bzr, "/opt/bzr/bin/bzr");
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(env(&[("SMARTRPC_READ_TIMEOUT", "soon")]))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid value \"soon\" for SMARTRPC_READ_TIMEOUT");
    }
}
