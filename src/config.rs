/// Configuration serialization and deserialization.
use std::{
    env,
    fs::{self},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const VERBOSE_QUIET: i64 = 0;
pub const VERBOSE_WSMAN: i64 = 1;
pub const VERBOSE_FULL: i64 = 2;

// config like:
// [defaults]
// login = "root"
// password = "calvin"
// port = 443
// device = "idrac"
// usleep = 30
// utimeout = 900
// verbose = 2
// format = "normal"
//
// [transport]
// program = "wsman"
// flags = ["-V", "-v", "-c", "dummy.cert", "-j", "utf-8", "-y", "basic"]
//
// [catalog]
// path = "catalog"
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub defaults: Defaults,
    pub transport: TransportConfig,
    pub catalog: CatalogConfig,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config '{}'", path.as_ref().display()))?;
        let config = toml::from_str(&contents)?;

        Ok(config)
    }

    /// Load `path`, falling back to `<config dir>/recite/recite.toml` and then
    /// to built-in defaults when neither file exists.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }

        if let Some(user_path) = user_config_path() {
            if user_path.exists() {
                log::info!("Using config {}", user_path.display());
                return Self::load(user_path);
            }
        }

        log::debug!(
            "Config '{}' not found, using built-in defaults",
            path.as_ref().display()
        );
        Ok(Self::default())
    }

    /// Environment variables override file values, as operators used to
    /// export LOGIN/PASS/... before starting a session.
    pub fn apply_env(&mut self) {
        if let Ok(login) = env::var("LOGIN") {
            self.defaults.login = login;
        }
        if let Ok(password) = env::var("PASS") {
            self.defaults.password = password;
        }
        if let Ok(timer) = env::var("TIMER") {
            self.defaults.timer = timer == "True";
        }
        if let Some(usleep) = env::var("USLEEP").ok().and_then(|v| v.parse().ok()) {
            self.defaults.usleep = usleep;
        }
        if let Some(utimeout) = env::var("UTIMEOUT").ok().and_then(|v| v.parse().ok()) {
            self.defaults.utimeout = utimeout;
        }
        if let Some(verbose) = env::var("VERBOSE").ok().and_then(|v| v.parse().ok()) {
            self.defaults.verbose = verbose;
        }
    }
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("recite").join("recite.toml"))
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Defaults {
    pub login: String,
    pub password: String,
    pub port: u16,
    pub device: String,
    // seconds between Until polls
    pub usleep: u64,
    // total seconds an Until may wait
    pub utimeout: u64,
    pub verbose: i64,
    pub format: String,
    pub timer: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            login: "root".to_string(),
            password: "calvin".to_string(),
            port: 443,
            device: "idrac".to_string(),
            usleep: 30,
            utimeout: 900,
            verbose: VERBOSE_FULL,
            format: "normal".to_string(),
            timer: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransportConfig {
    pub program: String,
    pub flags: Vec<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            program: "wsman".to_string(),
            flags: ["-V", "-v", "-c", "dummy.cert", "-j", "utf-8", "-y", "basic"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CatalogConfig {
    pub path: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: "catalog".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [defaults]
            login = "admin"
            port = 8443

            [catalog]
            path = "/etc/recite/catalog"
            "#,
        )
        .unwrap();

        assert_eq!(config.defaults.login, "admin");
        assert_eq!(config.defaults.port, 8443);
        assert_eq!(config.defaults.password, "calvin");
        assert_eq!(config.defaults.usleep, 30);
        assert_eq!(config.transport.program, "wsman");
        assert_eq!(config.catalog.path, "/etc/recite/catalog");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_or_default("/nonexistent/recite.toml").unwrap();
        assert_eq!(config.defaults.device, "idrac");
        assert_eq!(config.defaults.utimeout, 900);
    }
}
