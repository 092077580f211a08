use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[source] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub ad_blocking: AdBlockSettings,
    /// File extensions (with leading dot) that bypass the upstream proxy.
    pub direct_extensions: Vec<String>,
    /// Host substrings identifying CDN-like domains that bypass the upstream proxy.
    pub direct_domains: Vec<String>,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub http_port: u16,
    pub https_mitm: bool,
    pub ca_cert: Option<PathBuf>,
    pub ca_key: Option<PathBuf>,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    /// Seconds an idle pooled connection may live before being closed.
    pub idle_conn_timeout: u64,
    pub tls_handshake_timeout: u64,
    pub expect_continue_timeout: u64,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_port: 8888,
            https_mitm: false,
            ca_cert: None,
            ca_key: None,
            max_idle_conns: 10_000,
            max_idle_conns_per_host: 100,
            idle_conn_timeout: 90,
            tls_handshake_timeout: 10,
            expect_continue_timeout: 1,
            read_buffer_size: 64 * 1024,
            write_buffer_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdBlockSettings {
    pub enabled: bool,
    pub domains_file: PathBuf,
}

impl Default for AdBlockSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            domains_file: "ad_domains.yaml".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Schema of the standalone ad-domains file.
#[derive(Debug, Default, Deserialize)]
pub struct AdDomainsFile {
    #[serde(default)]
    pub ad_domains: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let data = std::fs::read(path).map_err(ConfigError::Read)?;
        let mut config: Config = serde_yaml::from_slice(&data).map_err(ConfigError::Parse)?;

        // An explicitly empty list means "use the stock list", same as an
        // absent one.
        if config.direct_extensions.is_empty() {
            config.direct_extensions = default_direct_extensions();
        }
        if config.direct_domains.is_empty() {
            config.direct_domains = default_direct_domains();
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.server.http_port))
    }
}

pub fn load_ad_domains(path: &Path) -> Result<Vec<String>, ConfigError> {
    let data = std::fs::read(path).map_err(ConfigError::Read)?;
    let parsed: AdDomainsFile = serde_yaml::from_slice(&data).map_err(ConfigError::Parse)?;
    Ok(parsed.ad_domains)
}

pub fn default_direct_extensions() -> Vec<String> {
    [
        ".js", ".css", ".jpg", ".jpeg", ".png", ".gif", ".ico", ".svg", ".webp", ".woff",
        ".woff2", ".ttf", ".eot", ".mp4", ".webm", ".mp3", ".wav", ".pdf", ".zip", ".gz", ".tar",
        ".rar", ".7z",
    ]
    .iter()
    .map(|ext| ext.to_string())
    .collect()
}

pub fn default_direct_domains() -> Vec<String> {
    [
        "cdn.", "cdnjs.", "cloudflare.", "googleapis.", "gstatic.", "unpkg.com", "jsdelivr.net",
        "bootstrapcdn.com", "jquery.com", "staticfile.org", "akamai.", "fastly.", "cloudfront.",
    ]
    .iter()
    .map(|domain| domain.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(contents.as_bytes()).expect("write temp file");
        file
    }

    #[test]
    fn empty_config_uses_defaults() {
        let file = write_config("{}");
        let config = Config::load(file.path()).expect("load config");

        assert_eq!(config.server.http_port, 8888);
        assert!(!config.server.https_mitm);
        assert_eq!(config.server.max_idle_conns, 10_000);
        assert_eq!(config.server.max_idle_conns_per_host, 100);
        assert_eq!(config.server.idle_conn_timeout, 90);
        assert_eq!(config.server.read_buffer_size, 65_536);
        assert_eq!(config.logging.level, "info");
        assert_eq!(
            config.ad_blocking.domains_file,
            PathBuf::from("ad_domains.yaml")
        );
        assert!(config.direct_extensions.contains(&".js".to_string()));
        assert!(config.direct_domains.contains(&"cdn.".to_string()));
    }

    #[test]
    fn explicit_values_override_defaults() {
        let file = write_config(
            "server:\n  http_port: 9000\n  https_mitm: true\n  max_idle_conns_per_host: 7\n\
             ad_blocking:\n  enabled: true\n  domains_file: /tmp/ads.yaml\n\
             direct_extensions: [\".wasm\"]\n\
             logging:\n  level: debug\n  format: json\n",
        );
        let config = Config::load(file.path()).expect("load config");

        assert_eq!(config.server.http_port, 9000);
        assert!(config.server.https_mitm);
        assert_eq!(config.server.max_idle_conns_per_host, 7);
        assert!(config.ad_blocking.enabled);
        assert_eq!(config.direct_extensions, vec![".wasm".to_string()]);
        // unset field keeps its default
        assert_eq!(config.server.idle_conn_timeout, 90);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.listen_addr().port(), 9000);
    }

    #[test]
    fn ad_domains_file_parses() {
        let file = write_config("ad_domains:\n  - doubleclick.net\n  - ads.example.com\n");
        let domains = load_ad_domains(file.path()).expect("load ad domains");
        assert_eq!(domains, vec!["doubleclick.net", "ads.example.com"]);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = Config::load(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read(_)));
    }
}
