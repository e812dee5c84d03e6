use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use prometheus::Registry;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use common::error::{Error, Result};

use crate::appender::{Appendable, Discard};
use crate::config::{Config, ScrapeConfig};
use crate::discover::{TargetGroup, TargetSets};
use crate::metrics::ScrapeMetrics;
use crate::scrape::scrape::{HttpClientFactory, ScraperFactory};
use crate::scrape::scrape_loop::ScrapePool;
use crate::scrape::target::{DroppedTarget, Target};

pub const RELOAD_INTERVAL: Duration = Duration::from_secs(5);

pub struct Options {
    /// Cadence at which armed reloads are carried out.
    pub reload_interval: Duration,
    pub appendable: Arc<dyn Appendable>,
    pub scraper_factory: Arc<dyn ScraperFactory>,
    pub registry: Registry,
    /// Process-wide shutdown; cancelling it stops every loop.
    pub shutdown: CancellationToken,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reload_interval: RELOAD_INTERVAL,
            appendable: Arc::new(Discard),
            scraper_factory: Arc::new(HttpClientFactory),
            registry: Registry::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Maintains one scrape pool per job and reconciles them with the latest
/// target sets and configuration.
pub struct Manager {
    appendable: Arc<dyn Appendable>,
    scraper_factory: Arc<dyn ScraperFactory>,
    metrics: Arc<ScrapeMetrics>,
    reload_interval: Duration,

    grace_shut: CancellationToken,
    stopping: AtomicBool,
    stopped: CancellationToken,

    // Single slot: arming an already armed reload is a no-op.
    trigger_reload: mpsc::Sender<()>,
    reload_rx: Mutex<Option<mpsc::Receiver<()>>>,

    mtx_scrape: Mutex<ManagerState>,
    // Held for the whole of a reload pass, so `stop` can wait one out.
    reload_pass: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct ManagerState {
    scrape_configs: HashMap<String, Arc<ScrapeConfig>>,
    scrape_pools: HashMap<String, Arc<ScrapePool>>,
    target_sets: TargetSets,
}

// Work for one job in a reload pass.
struct PoolWork {
    pool: Arc<ScrapePool>,
    new_config: Option<Arc<ScrapeConfig>>,
    group: Option<TargetGroup>,
}

impl Manager {
    pub fn new(opts: Options) -> Self {
        let (trigger_reload, reload_rx) = mpsc::channel(1);
        let reload_interval = if opts.reload_interval.is_zero() {
            warn!("reload interval must be positive, using {:?}", RELOAD_INTERVAL);
            RELOAD_INTERVAL
        } else {
            opts.reload_interval
        };
        Manager {
            appendable: opts.appendable,
            scraper_factory: opts.scraper_factory,
            metrics: Arc::new(ScrapeMetrics::new(&opts.registry)),
            reload_interval,
            grace_shut: opts.shutdown.child_token(),
            stopping: AtomicBool::new(false),
            stopped: CancellationToken::new(),
            trigger_reload,
            reload_rx: Mutex::new(Some(reload_rx)),
            mtx_scrape: Mutex::new(ManagerState::default()),
            reload_pass: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.mtx_scrape.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the job configurations wholesale. Pools pick the change up on
    /// the next reload pass.
    pub fn apply_config(&self, cfg: &Config) {
        let configs: HashMap<_, _> = cfg
            .scrape_configs
            .iter()
            .map(|sc| (sc.job_name.clone(), Arc::new(sc.clone())))
            .collect();
        info!("applying scrape config for {} jobs", configs.len());
        self.lock().scrape_configs = configs;
        self.arm_reload();
    }

    /// Receives target set updates until the manager is stopped. Reloading
    /// happens in a background task so that it never blocks receiving.
    pub async fn run(self: Arc<Self>, mut tsets: mpsc::Receiver<TargetSets>) -> Result<()> {
        let reload_rx = self
            .reload_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(Error::AlreadyRunning)?;
        let reloader = tokio::spawn(self.clone().reloader(reload_rx));

        loop {
            tokio::select! {
                biased;
                _ = self.grace_shut.cancelled() => break,
                ts = tsets.recv() => match ts {
                    Some(ts) => {
                        self.update_tsets(ts);
                        self.arm_reload();
                    }
                    None => {
                        debug!("target set updates closed, waiting for shutdown");
                        self.grace_shut.cancelled().await;
                        break;
                    }
                },
            }
        }

        if let Err(err) = reloader.await {
            error!("scrape reloader failed: {}", err);
        }
        Ok(())
    }

    fn arm_reload(&self) {
        let _ = self.trigger_reload.try_send(());
    }

    fn update_tsets(&self, tsets: TargetSets) {
        debug!("received target sets for {} jobs", tsets.len());
        self.lock().target_sets = tsets;
    }

    async fn reloader(self: Arc<Self>, mut trigger: mpsc::Receiver<()>) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.reload_interval, self.reload_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.grace_shut.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if trigger.try_recv().is_err() {
                continue;
            }
            let retry = self.reload().await;
            if retry {
                // Failed pools are retried on the next tick.
                self.arm_reload();
            }
        }
    }

    /// One reload pass. Returns true if some job could not be set up and
    /// should be retried.
    async fn reload(&self) -> bool {
        let _pass = self.reload_pass.lock().await;
        let start = Instant::now();
        let mut retry = false;
        let (removed, work) = {
            let mut guard = self.lock();
            if self.grace_shut.is_cancelled() {
                return false;
            }
            let state = &mut *guard;

            let gone: Vec<String> = state
                .scrape_pools
                .keys()
                .filter(|job| !state.scrape_configs.contains_key(*job))
                .cloned()
                .collect();
            let removed: Vec<Arc<ScrapePool>> = gone
                .iter()
                .filter_map(|job| state.scrape_pools.remove(job))
                .collect();

            let mut work: HashMap<String, PoolWork> = HashMap::new();
            for (job, pool) in &state.scrape_pools {
                let cfg = &state.scrape_configs[job];
                if *pool.config() != **cfg {
                    work.insert(
                        job.clone(),
                        PoolWork {
                            pool: pool.clone(),
                            new_config: Some(cfg.clone()),
                            group: None,
                        },
                    );
                }
            }

            for (job, group) in &state.target_sets {
                if let Some(w) = work.get_mut(job) {
                    w.group = Some(group.clone());
                    continue;
                }
                let pool = match state.scrape_pools.get(job) {
                    Some(pool) => pool.clone(),
                    None => {
                        let Some(cfg) = state.scrape_configs.get(job) else {
                            error!("error reloading target set: {}", Error::UnknownJob(job.clone()));
                            self.metrics.reload_errors.inc();
                            continue;
                        };
                        match ScrapePool::new(
                            cfg.clone(),
                            self.appendable.clone(),
                            self.scraper_factory.clone(),
                            self.metrics.clone(),
                            &self.grace_shut,
                        ) {
                            Ok(pool) => {
                                let pool = Arc::new(pool);
                                state.scrape_pools.insert(job.clone(), pool.clone());
                                self.metrics.pools_total.inc();
                                pool
                            }
                            Err(err) => {
                                error!("error creating new scrape pool {}: {}", job, err);
                                self.metrics.pools_failed.inc();
                                self.metrics.reload_errors.inc();
                                retry = true;
                                continue;
                            }
                        }
                    }
                };
                work.insert(
                    job.clone(),
                    PoolWork {
                        pool,
                        new_config: None,
                        group: Some(group.clone()),
                    },
                );
            }
            (removed, work)
        };

        for pool in &removed {
            info!("job {} removed from configuration, stopping its scrape pool", pool.job());
        }
        let stops = removed
            .into_iter()
            .map(|pool| tokio::spawn(async move { pool.stop().await }));

        // Pools are synced in parallel as these take a while and at high load
        // can't catch up.
        let metrics = self.metrics.clone();
        let syncs = work.into_values().map(|w| {
            let metrics = metrics.clone();
            tokio::spawn(async move {
                let mut failed = false;
                if let Some(cfg) = w.new_config {
                    if let Err(err) = w.pool.reload(cfg).await {
                        error!("error reloading scrape pool {}: {}", w.pool.job(), err);
                        metrics.reload_errors.inc();
                        failed = true;
                    }
                }
                if let Some(group) = w.group {
                    w.pool.sync(&group).await;
                }
                failed
            })
        });

        let (stopped, synced) = futures::join!(join_all(stops), join_all(syncs));
        for res in stopped {
            if let Err(err) = res {
                error!("scrape pool stop task failed: {}", err);
            }
        }
        for res in synced {
            match res {
                Ok(failed) => retry |= failed,
                Err(err) => error!("scrape pool sync task failed: {}", err),
            }
        }

        self.metrics.reloads.inc();
        debug!("reload pass finished in {:?}", start.elapsed());
        retry
    }

    /// Stops the manager and every scrape loop, returning once all of them
    /// have exited. Concurrent and repeated calls all wait for the same
    /// shutdown.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            self.stopped.cancelled().await;
            return;
        }
        self.grace_shut.cancel();
        // Pools a running pass already took out of the map are stopped by
        // that pass.
        let _pass = self.reload_pass.lock().await;
        let pools: Vec<Arc<ScrapePool>> = self
            .lock()
            .scrape_pools
            .drain()
            .map(|(_, pool)| pool)
            .collect();
        info!("stopping {} scrape pools", pools.len());
        join_all(pools.iter().map(|pool| pool.stop())).await;
        self.stopped.cancel();
    }

    pub fn metrics(&self) -> &ScrapeMetrics {
        &self.metrics
    }

    pub fn scrape_pool(&self, job: &str) -> Option<Arc<ScrapePool>> {
        self.lock().scrape_pools.get(job).cloned()
    }

    /// Active targets per job.
    pub fn targets_active(&self) -> HashMap<String, Vec<Arc<Target>>> {
        self.pools()
            .into_iter()
            .map(|(job, pool)| (job, pool.active_targets()))
            .collect()
    }

    /// Dropped targets per job.
    pub fn targets_dropped(&self) -> HashMap<String, Vec<DroppedTarget>> {
        self.pools()
            .into_iter()
            .map(|(job, pool)| (job, pool.dropped_targets()))
            .collect()
    }

    fn pools(&self) -> Vec<(String, Arc<ScrapePool>)> {
        self.lock()
            .scrape_pools
            .iter()
            .map(|(job, pool)| (job.clone(), pool.clone()))
            .collect()
    }
}
