//! Configuration: TOML file, then command-line overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

/// Default `+code` of a fakezod
pub const FAKEZOD_CODE: &str = "lidlut-tabwed-pillex-ridrup";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ship: ShipConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Where the ship is and how to reach the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipConfig {
    pub url: String,
    pub port: u16,
    pub name: String,
    pub app: String,
    pub path: String,
    pub code: String,
}

/// Bridge timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Wait before connecting to the ship
    pub delay_ms: u64,
    /// 0 waits forever
    pub request_timeout_secs: u64,
    pub save_resend_delay_ms: u64,
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: PathBuf,
}

impl Default for ShipConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost".to_string(),
            port: 8080,
            name: "zod".to_string(),
            app: "language-server".to_string(),
            path: "/primary".to_string(),
            code: FAKEZOD_CODE.to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            delay_ms: 0,
            request_timeout_secs: 30,
            save_resend_delay_ms: 1000,
            reconnect_delay_ms: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "debug".to_string(),
            file: PathBuf::from("/tmp/hoon-language-server.log"),
        }
    }
}

impl ShipConfig {
    /// The ship's HTTP base URL with `port` applied
    pub fn base_url(&self) -> Result<Url> {
        let mut url =
            Url::parse(&self.url).with_context(|| format!("invalid ship URL: {}", self.url))?;
        url.set_port(Some(self.port))
            .map_err(|_| anyhow!("cannot set a port on ship URL: {}", self.url))?;
        Ok(url)
    }
}

impl ServerConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn save_resend_delay(&self) -> Duration {
        Duration::from_millis(self.save_resend_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Values given on the command line; `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub delay_ms: Option<u64>,
    pub url: Option<String>,
    pub ship: Option<String>,
    pub code: Option<String>,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// `<config dir>/hoon-language-server/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hoon-language-server").join("config.toml"))
    }

    /// Load from `path`, or from the default path if it exists, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) if p.exists() => p,
                _ => return Ok(Self::default()),
            },
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(port) = overrides.port {
            self.ship.port = port;
        }
        if let Some(delay) = overrides.delay_ms {
            self.server.delay_ms = delay;
        }
        if let Some(url) = overrides.url {
            self.ship.url = url;
        }
        if let Some(ship) = overrides.ship {
            self.ship.name = ship.trim_start_matches('~').to_string();
        }
        if let Some(code) = overrides.code {
            self.ship.code = code;
        }
        if let Some(file) = overrides.log_file {
            self.logging.file = file;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.ship.port, 8080);
        assert_eq!(config.ship.name, "zod");
        assert_eq!(config.ship.app, "language-server");
        assert_eq!(config.ship.path, "/primary");
        assert_eq!(config.server.delay_ms, 0);
        assert_eq!(
            config.logging.file,
            PathBuf::from("/tmp/hoon-language-server.log")
        );
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [ship]
            port = 8081

            [server]
            request_timeout_secs = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.ship.port, 8081);
        assert_eq!(config.ship.url, "http://localhost");
        assert_eq!(config.server.request_timeout(), None);
        assert_eq!(config.server.save_resend_delay(), Duration::from_secs(1));
    }

    #[test]
    fn invalid_toml_is_an_error() {
        assert!(Config::from_toml("[ship]\nport = \"eighty\"").is_err());
    }

    #[test]
    fn load_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[ship]\nname = \"nec\"\n[logging]\nlevel = \"info\"").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.ship.name, "nec");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(Some(dir.path().join("nope.toml").as_path()));
        assert!(result.is_err());
    }

    #[test]
    fn overrides_win() {
        let mut config = Config::default();
        config.apply(Overrides {
            port: Some(12321),
            delay_ms: Some(500),
            ship: Some("~nec".to_string()),
            ..Default::default()
        });
        assert_eq!(config.ship.port, 12321);
        assert_eq!(config.server.startup_delay(), Duration::from_millis(500));
        assert_eq!(config.ship.name, "nec");
        assert_eq!(config.ship.code, FAKEZOD_CODE);
    }

    #[test]
    fn base_url_applies_port() {
        let ship = ShipConfig {
            port: 8443,
            ..Default::default()
        };
        assert_eq!(ship.base_url().unwrap().as_str(), "http://localhost:8443/");
    }

    #[test]
    fn base_url_rejects_garbage() {
        let ship = ShipConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(ship.base_url().is_err());
    }
}
