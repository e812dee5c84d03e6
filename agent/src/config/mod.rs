//! Scrape configuration: YAML model, defaulting and validation.
//!
//! A [`Config`] returned by [`Config::load`] is fully resolved: every job has a
//! concrete interval and timeout, and `timeout <= interval` holds for all of
//! them. Invalid files never produce a `Config`.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use common::error::{Error, Result};

pub mod duration;

pub const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_METRICS_PATH: &str = "/metrics";
pub const DEFAULT_SCHEME: &str = "http";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub global: GlobalConfig,
    pub scrape_configs: Vec<ScrapeConfig>,
}

/// Defaults applied to every job that does not set its own value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    pub scrape_interval: Duration,
    pub scrape_timeout: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            scrape_interval: DEFAULT_SCRAPE_INTERVAL,
            scrape_timeout: DEFAULT_SCRAPE_TIMEOUT,
        }
    }
}

/// One scrape job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeConfig {
    pub job_name: String,
    pub scrape_interval: Duration,
    pub scrape_timeout: Duration,
    pub metrics_path: String,
    pub scheme: String,
    pub params: BTreeMap<String, Vec<String>>,
    /// Maximum number of targets for the job; 0 disables the limit.
    pub target_limit: usize,
    pub static_configs: Vec<StaticConfig>,
}

impl ScrapeConfig {
    /// A job with the global defaults and no targets.
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            scrape_interval: DEFAULT_SCRAPE_INTERVAL,
            scrape_timeout: DEFAULT_SCRAPE_TIMEOUT,
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            scheme: DEFAULT_SCHEME.to_string(),
            params: BTreeMap::new(),
            target_limit: 0,
            static_configs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticConfig {
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    global: Option<RawGlobalConfig>,
    #[serde(default)]
    scrape_configs: Vec<Option<RawScrapeConfig>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGlobalConfig {
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    scrape_interval: Option<Duration>,
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    scrape_timeout: Option<Duration>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawScrapeConfig {
    job_name: String,
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    scrape_interval: Option<Duration>,
    #[serde(default, deserialize_with = "duration::deserialize_opt")]
    scrape_timeout: Option<Duration>,
    #[serde(default)]
    metrics_path: Option<String>,
    #[serde(default)]
    scheme: Option<String>,
    #[serde(default)]
    params: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    target_limit: usize,
    #[serde(default)]
    static_configs: Vec<StaticConfig>,
}

impl RawGlobalConfig {
    fn resolve(self) -> Result<GlobalConfig> {
        let scrape_interval = match self.scrape_interval {
            Some(d) if !d.is_zero() => d,
            _ => DEFAULT_SCRAPE_INTERVAL,
        };
        let scrape_timeout = match self.scrape_timeout {
            Some(d) if d > scrape_interval => {
                return Err(Error::InvalidConfig(
                    "global scrape timeout greater than scrape interval".to_string(),
                ))
            }
            Some(d) if !d.is_zero() => d,
            _ => DEFAULT_SCRAPE_TIMEOUT.min(scrape_interval),
        };
        Ok(GlobalConfig {
            scrape_interval,
            scrape_timeout,
        })
    }
}

impl RawScrapeConfig {
    fn resolve(self, global: &GlobalConfig) -> Result<ScrapeConfig> {
        if self.job_name.trim().is_empty() {
            return Err(Error::InvalidConfig("job_name is empty".to_string()));
        }

        let scrape_interval = match self.scrape_interval {
            Some(d) if !d.is_zero() => d,
            _ => global.scrape_interval,
        };
        let scrape_timeout = match self.scrape_timeout {
            Some(d) if d > scrape_interval => {
                return Err(Error::TimeoutExceedsInterval(self.job_name))
            }
            Some(d) if !d.is_zero() => d,
            _ => global.scrape_timeout.min(scrape_interval),
        };

        let scheme = self.scheme.unwrap_or_else(|| DEFAULT_SCHEME.to_string());
        if scheme != "http" && scheme != "https" {
            return Err(Error::InvalidConfig(format!(
                "invalid scheme {:?} for job {:?}",
                scheme, self.job_name
            )));
        }

        let metrics_path = match self.metrics_path {
            Some(p) if !p.is_empty() => p,
            _ => DEFAULT_METRICS_PATH.to_string(),
        };
        if !metrics_path.starts_with('/') {
            return Err(Error::InvalidConfig(format!(
                "metrics_path {:?} for job {:?} must start with '/'",
                metrics_path, self.job_name
            )));
        }

        Ok(ScrapeConfig {
            job_name: self.job_name,
            scrape_interval,
            scrape_timeout,
            metrics_path,
            scheme,
            params: self.params,
            target_limit: self.target_limit,
            static_configs: self.static_configs,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            scrape_configs: Vec::new(),
        }
    }
}

impl Config {
    /// Parses and validates a YAML document.
    pub fn load(s: &str) -> Result<Config> {
        let raw: RawConfig = if s.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(s)?
        };

        let global = raw.global.unwrap_or_default().resolve()?;

        let mut job_names = HashSet::new();
        let mut scrape_configs = Vec::with_capacity(raw.scrape_configs.len());
        for scfg in raw.scrape_configs {
            let scfg = scfg.ok_or_else(|| {
                Error::InvalidConfig("empty or null scrape config section".to_string())
            })?;
            let scfg = scfg.resolve(&global)?;
            if !job_names.insert(scfg.job_name.clone()) {
                return Err(Error::DuplicateJobName(scfg.job_name));
            }
            scrape_configs.push(scfg);
        }

        Ok(Config {
            global,
            scrape_configs,
        })
    }

    /// Reads and parses the file at `path`.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::from(e).context(format!("reading {}", path.display())))?;
        Config::load(&content)
            .map_err(|e| e.context(format!("parsing YAML file {}", path.display())))
    }

    pub fn job(&self, name: &str) -> Option<&ScrapeConfig> {
        self.scrape_configs.iter().find(|c| c.job_name == name)
    }
}
