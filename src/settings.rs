use std::path::{Path, PathBuf};

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use http::Uri;
use serde::Deserialize;

use crate::backend::{BackendConfig, DEFAULT_MAX_BYTES};
use crate::cache::origin_of;
use crate::cli::{Cli, LogFormat};

fn default_max_bytes() -> u64 {
    DEFAULT_MAX_BYTES
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// `scheme://authority` every cached URL must belong to.
    pub origin: String,
    /// Store directory. Without one the cache lives in memory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("FETCHCACHE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn backend_config(&self) -> BackendConfig {
        match &self.cache_dir {
            Some(path) => BackendConfig::Disk {
                path: path.clone(),
                max_bytes: self.max_bytes,
            },
            None => BackendConfig::Memory {
                max_bytes: self.max_bytes,
            },
        }
    }

    /// Checks that `url` is an absolute URL of the configured origin.
    pub fn check_url(&self, url: &Uri) -> Result<()> {
        match origin_of(url) {
            Some(origin) if origin == self.origin => Ok(()),
            Some(origin) => bail!("{url} belongs to {origin}, not {}", self.origin),
            None => bail!("{url} is not an absolute URL"),
        }
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/fetchcache/fetchcache.toml"),
        PathBuf::from("fetchcache.toml"),
    ]
}

impl Settings {
    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        if let Some(cache_dir) = self.cache_dir.clone() {
            self.cache_dir = Some(absolutize(&cache_dir, base_dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        let uri: Uri = match self.origin.parse() {
            Ok(uri) => uri,
            Err(err) => bail!("origin {:?} is not a valid URI: {err}", self.origin),
        };
        ensure!(
            origin_of(&uri).as_deref() == Some(self.origin.as_str()),
            "origin must be of the form scheme://authority (got {:?})",
            self.origin
        );
        ensure!(
            self.max_bytes > 0,
            "max_bytes must be greater than 0 (got {})",
            self.max_bytes
        );
        Ok(())
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
