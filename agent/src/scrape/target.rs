use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use url::Url;

use common::common::labels::Labels;
use common::error::{Error, Result};

use crate::config::ScrapeConfig;
use crate::discover::TargetGroup;

pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";

// TargetHealth describes the health state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetHealth {
    Unknown,
    Up,
    Down,
}

/// Outcome of the most recent scrape cycle of a target.
#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub health: TargetHealth,
    pub last_error: Option<String>,
    pub last_scrape: Option<SystemTime>,
    pub last_scrape_duration: Duration,
}

impl Default for TargetStatus {
    fn default() -> Self {
        Self {
            health: TargetHealth::Unknown,
            last_error: None,
            last_scrape: None,
            last_scrape_duration: Duration::ZERO,
        }
    }
}

// Target refers to a singular HTTP or HTTPS endpoint.
#[derive(Debug)]
pub struct Target {
    labels: Labels,
    url: Url,
    hash: u64,
    status: RwLock<TargetStatus>,
}

/// An address discovery reported that could not be turned into a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedTarget {
    pub address: String,
    pub reason: String,
}

impl Target {
    pub fn new(address: &str, cfg: &ScrapeConfig) -> Result<Target> {
        let url = url_from_address(address, cfg)?;
        let instance = match (url.host_str(), url.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(Error::InvalidTarget {
                    address: address.to_string(),
                    reason: "missing host".to_string(),
                })
            }
        };
        let labels = Labels::from([
            (JOB_LABEL, cfg.job_name.as_str()),
            (INSTANCE_LABEL, instance.as_str()),
        ]);
        let hash = calculate_hash(url.as_str());

        Ok(Target {
            labels,
            url,
            hash,
            status: RwLock::new(TargetStatus::default()),
        })
    }

    /// The scrape URL; two targets with the same URL are the same target.
    pub fn identity(&self) -> &str {
        self.url.as_str()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn instance(&self) -> &str {
        self.labels.get(INSTANCE_LABEL).unwrap_or_default()
    }

    pub fn job(&self) -> &str {
        self.labels.get(JOB_LABEL).unwrap_or_default()
    }

    pub fn status(&self) -> TargetStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn health(&self) -> TargetHealth {
        self.status().health
    }

    pub(crate) fn report(&self, start: SystemTime, duration: Duration, err: Option<&Error>) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        match err {
            Some(err) => {
                status.health = TargetHealth::Down;
                status.last_error = Some(err.to_string());
            }
            None => {
                status.health = TargetHealth::Up;
                status.last_error = None;
            }
        }
        status.last_scrape = Some(start);
        status.last_scrape_duration = duration;
    }

    /// How long to wait before the first scrape so that targets sharing an
    /// interval are spread over it. Always strictly less than `interval`.
    pub fn offset(&self, interval: Duration) -> Duration {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        offset_at(self.hash, interval, now)
    }
}

// The offset is aligned to wall-clock multiples of the interval, so a target
// keeps its phase when its loop is restarted.
fn offset_at(hash: u64, interval: Duration, now: Duration) -> Duration {
    let interval = interval.as_nanos();
    if interval == 0 {
        return Duration::ZERO;
    }
    let base = interval - now.as_nanos() % interval;
    let offset = hash as u128 % interval;
    let mut next = base + offset;
    while next >= interval {
        next -= interval;
    }
    Duration::from_nanos(next as u64)
}

fn url_from_address(address: &str, cfg: &ScrapeConfig) -> Result<Url> {
    let invalid = |reason: &str| Error::InvalidTarget {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty address"));
    }
    let raw = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}://{}", cfg.scheme, trimmed)
    };
    let mut url = Url::parse(&raw).map_err(|e| invalid(&e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    url.set_fragment(None);
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(&cfg.metrics_path);
    }

    if !cfg.params.is_empty() {
        let present: HashSet<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        let mut query = url.query_pairs_mut();
        for (key, values) in &cfg.params {
            if present.contains(key) {
                continue;
            }
            for value in values {
                query.append_pair(key, value);
            }
        }
    }
    Ok(url)
}

fn calculate_hash(url: &str) -> u64 {
    let digest = Sha256::digest(url.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Builds the targets of a group, in order and without duplicates, together
/// with the addresses that had to be dropped.
pub fn targets_from_group(
    group: &TargetGroup,
    cfg: &ScrapeConfig,
) -> (Vec<Arc<Target>>, Vec<DroppedTarget>) {
    let mut targets = Vec::with_capacity(group.targets.len());
    let mut dropped = Vec::new();
    let mut seen = HashSet::new();

    for address in &group.targets {
        match Target::new(address, cfg) {
            Ok(t) => {
                if seen.insert(t.identity().to_string()) {
                    targets.push(Arc::new(t));
                }
            }
            Err(err) => dropped.push(DroppedTarget {
                address: address.clone(),
                reason: err.to_string(),
            }),
        }
    }
    (targets, dropped)
}
