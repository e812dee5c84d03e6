#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use prometheus::Registry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use agent::appender::{Appendable, Appender, RawSample};
use agent::config::{Config, ScrapeConfig};
use agent::discover::{TargetGroup, TargetSets};
use agent::scrape::{Manager, Options, Scraper, ScraperFactory};
use common::common::labels::Labels;
use common::error::{Error, Result};

pub const RELOAD_INTERVAL: Duration = Duration::from_secs(5);

fn instance(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or_default(),
        url.port_or_known_default().unwrap_or(0)
    )
}

/// Answers every scrape instantly; hosts marked as failing refuse the
/// connection.
#[derive(Default)]
pub struct FakeScraper {
    calls: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeScraper {
    pub fn fail(&self, instance: &str) {
        self.failing.lock().unwrap().insert(instance.to_string());
    }

    pub fn calls(&self, instance: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(instance)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Scraper for FakeScraper {
    async fn scrape(&self, url: &Url, _timeout: Duration) -> Result<Vec<u8>> {
        let instance = instance(url);
        *self.calls.lock().unwrap().entry(instance.clone()).or_default() += 1;
        if self.failing.lock().unwrap().contains(&instance) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        Ok(format!("up{{instance=\"{}\"}} 1\n", instance).into_bytes())
    }
}

/// Hands out the shared [`FakeScraper`]; jobs marked as failing cannot be
/// built.
pub struct FakeFactory {
    pub scraper: Arc<FakeScraper>,
    failing_jobs: Mutex<HashSet<String>>,
    builds: AtomicUsize,
}

impl FakeFactory {
    pub fn new(scraper: Arc<FakeScraper>) -> Self {
        Self {
            scraper,
            failing_jobs: Mutex::new(HashSet::new()),
            builds: AtomicUsize::new(0),
        }
    }

    pub fn fail_job(&self, job: &str, fail: bool) {
        let mut jobs = self.failing_jobs.lock().unwrap();
        if fail {
            jobs.insert(job.to_string());
        } else {
            jobs.remove(job);
        }
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ScraperFactory for FakeFactory {
    fn build(&self, cfg: &ScrapeConfig) -> Result<Arc<dyn Scraper>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.failing_jobs.lock().unwrap().contains(&cfg.job_name) {
            return Err(Error::InvalidConfig(format!(
                "cannot build client for job {}",
                cfg.job_name
            )));
        }
        Ok(self.scraper.clone())
    }
}

/// Keeps every appended body, keyed by the target's labels.
#[derive(Default)]
pub struct Recorder {
    samples: Mutex<Vec<(Labels, RawSample)>>,
}

impl Recorder {
    pub fn count_for(&self, instance: &str) -> usize {
        self.samples
            .lock()
            .unwrap()
            .iter()
            .filter(|(labels, _)| labels.get("instance") == Some(instance))
            .count()
    }
}

impl Appender for Recorder {
    fn append(&self, labels: &Labels, samples: Vec<RawSample>) -> Result<()> {
        let mut all = self.samples.lock().unwrap();
        for s in samples {
            all.push((labels.clone(), s));
        }
        Ok(())
    }
}

pub struct RecordingAppendable(pub Arc<Recorder>);

impl Appendable for RecordingAppendable {
    fn appender(&self) -> Arc<dyn Appender> {
        self.0.clone()
    }
}

pub struct Harness {
    pub manager: Arc<Manager>,
    pub scraper: Arc<FakeScraper>,
    pub factory: Arc<FakeFactory>,
    pub recorder: Arc<Recorder>,
    pub registry: Registry,
    pub shutdown: CancellationToken,
    pub tsets: mpsc::Sender<TargetSets>,
    pub runner: JoinHandle<Result<()>>,
}

impl Harness {
    /// Starts a manager running `yaml` with fake transport and storage.
    pub fn start(yaml: &str) -> Harness {
        let scraper = Arc::new(FakeScraper::default());
        let factory = Arc::new(FakeFactory::new(scraper.clone()));
        Self::start_with(yaml, scraper, factory)
    }

    pub fn start_with(yaml: &str, scraper: Arc<FakeScraper>, factory: Arc<FakeFactory>) -> Harness {
        let recorder = Arc::new(Recorder::default());
        let registry = Registry::new();
        let shutdown = CancellationToken::new();
        let manager = Arc::new(Manager::new(Options {
            reload_interval: RELOAD_INTERVAL,
            appendable: Arc::new(RecordingAppendable(recorder.clone())),
            scraper_factory: factory.clone(),
            registry: registry.clone(),
            shutdown: shutdown.clone(),
        }));
        manager.apply_config(&Config::load(yaml).unwrap());

        let (tsets, rx) = mpsc::channel(1);
        let runner = tokio::spawn(manager.clone().run(rx));
        Harness {
            manager,
            scraper,
            factory,
            recorder,
            registry,
            shutdown,
            tsets,
            runner,
        }
    }

    pub async fn send(&self, sets: TargetSets) {
        self.tsets.send(sets).await.unwrap();
    }

    pub async fn shutdown(self) {
        self.manager.stop().await;
        self.runner.await.unwrap().unwrap();
    }
}

/// Builds a target set snapshot from `(job, targets)` pairs.
pub fn sets(groups: &[(&str, &[&str])]) -> TargetSets {
    groups
        .iter()
        .map(|(job, targets)| {
            (
                job.to_string(),
                TargetGroup::new("static", targets.iter().copied()),
            )
        })
        .collect()
}

pub fn url(addr: &str) -> String {
    format!("http://{}/metrics", addr)
}

pub async fn sleep_secs(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}
