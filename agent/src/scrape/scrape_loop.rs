use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use futures::future::join_all;
use log::{debug, info, warn};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use common::error::{Error, Result};

use crate::appender::{Appendable, RawSample};
use crate::config::ScrapeConfig;
use crate::discover::TargetGroup;
use crate::metrics::ScrapeMetrics;
use crate::scrape::scrape::{Scraper, ScraperFactory};
use crate::scrape::target::{targets_from_group, DroppedTarget, Target};

/// Lifecycle of a [`ScrapeLoop`]. States only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Created, waiting out its initial offset.
    Pending = 0,
    /// Ticking.
    Running = 1,
    /// Cancellation requested, possibly mid-scrape.
    Stopping = 2,
    /// Terminal; the stop signal has fired.
    Stopped = 3,
}

impl LoopState {
    fn from_u8(v: u8) -> LoopState {
        match v {
            0 => LoopState::Pending,
            1 => LoopState::Running,
            2 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }
}

/// Periodically scrapes a single target until stopped.
///
/// A loop is started once and must not be reused after it was stopped.
pub struct ScrapeLoop {
    target: Arc<Target>,
    scraper: Arc<dyn Scraper>,
    appendable: Arc<dyn Appendable>,
    metrics: Arc<ScrapeMetrics>,
    interval: Duration,
    timeout: Duration,

    forced_err: Mutex<Option<String>>,
    state: AtomicU8,
    started: AtomicBool,
    created_at: Instant,

    // Process shutdown. Also aborts an in-flight scrape.
    parent: CancellationToken,
    // Child of `parent`, cancelled by `stop`.
    ctx: CancellationToken,
    stopped: CancellationToken,
}

impl ScrapeLoop {
    pub fn new(
        target: Arc<Target>,
        scraper: Arc<dyn Scraper>,
        appendable: Arc<dyn Appendable>,
        metrics: Arc<ScrapeMetrics>,
        interval: Duration,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Arc<ScrapeLoop> {
        Arc::new(ScrapeLoop {
            target,
            scraper,
            appendable,
            metrics,
            interval,
            timeout,
            forced_err: Mutex::new(None),
            state: AtomicU8::new(LoopState::Pending as u8),
            started: AtomicBool::new(false),
            created_at: Instant::now(),
            parent: parent.clone(),
            ctx: parent.child_token(),
            stopped: CancellationToken::new(),
        })
    }

    /// Spawns the loop onto the runtime. Calls after the first one, or after
    /// `stop`, do nothing.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(self.clone().run());
    }

    async fn run(self: Arc<Self>) {
        let _finished = Finished(&self);

        let offset = self.target.offset(self.interval);
        debug!("scrape loop for {} starts in {:?}", self.target.url(), offset);
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => return,
            _ = tokio::time::sleep(offset) => {}
        }
        self.advance(LoopState::Pending, LoopState::Running);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // A stop that lands between the tick and here still wins.
            if self.ctx.is_cancelled() {
                break;
            }
            self.scrape_and_report().await;
        }
    }

    // An in-flight request is left to finish on `stop` (it is bounded by the
    // timeout); only process shutdown cuts it short.
    async fn scrape_and_report(&self) {
        let start = SystemTime::now();
        let timer = Instant::now();

        let result = match self.forced_error() {
            Some(err) => Err(Error::Forced(err)),
            None => {
                let scrape = tokio::time::timeout(
                    self.timeout,
                    self.scraper.scrape(self.target.url(), self.timeout),
                );
                tokio::select! {
                    biased;
                    _ = self.parent.cancelled() => {
                        debug!("scrape of {} abandoned on shutdown", self.target.url());
                        return;
                    }
                    res = scrape => res.unwrap_or(Err(Error::Timeout(self.timeout))),
                }
            }
        };

        let result = result.and_then(|body| {
            let samples = vec![RawSample {
                raw: body,
                timestamp: start,
            }];
            self.appendable
                .appender()
                .append(self.target.labels(), samples)
        });

        let duration = timer.elapsed();
        match &result {
            Ok(()) => debug!("scraped {} in {:?}", self.target.url(), duration),
            Err(err) => warn!(
                "scrape failed job={} target={}: {}",
                self.target.job(),
                self.target.url(),
                err
            ),
        }
        self.target.report(start, duration, result.as_ref().err());
        self.metrics.observe_scrape(
            self.target.job(),
            self.target.instance(),
            duration,
            result.is_ok(),
        );
    }

    /// Makes every following cycle fail with `err` without contacting the
    /// target, until cleared with `None`.
    pub fn set_forced_error(&self, err: Option<String>) {
        *self.forced_err.lock().unwrap_or_else(|e| e.into_inner()) = err;
    }

    pub fn forced_error(&self) -> Option<String> {
        self.forced_err
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancels the loop and waits until it has fully stopped. Safe to call
    /// any number of times, concurrently.
    pub async fn stop(&self) {
        self.ctx.cancel();
        if !self.started.swap(true, Ordering::AcqRel) {
            // Never spawned: nothing will fire the signal for us.
            self.finish();
        } else {
            self.advance(LoopState::Pending, LoopState::Stopping);
            self.advance(LoopState::Running, LoopState::Stopping);
        }
        self.stopped.cancelled().await;
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True until the loop has stopped.
    pub fn is_live(&self) -> bool {
        self.state() != LoopState::Stopped
    }

    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    fn advance(&self, from: LoopState, to: LoopState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        self.state.store(LoopState::Stopped as u8, Ordering::Release);
        self.stopped.cancel();
    }
}

// Fires the stop signal when the loop task ends, including by panic.
struct Finished<'a>(&'a ScrapeLoop);

impl Drop for Finished<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Owns the scrape loops of one job.
pub struct ScrapePool {
    job: String,
    appendable: Arc<dyn Appendable>,
    scraper_factory: Arc<dyn ScraperFactory>,
    metrics: Arc<ScrapeMetrics>,
    ctx: CancellationToken,

    // Serializes sync, reload and stop on this pool. Held across awaits.
    sync_lock: tokio::sync::Mutex<()>,
    // Bookkeeping only, never held across an await.
    inner: Mutex<PoolState>,
}

struct PoolState {
    config: Arc<ScrapeConfig>,
    scraper: Arc<dyn Scraper>,
    loops: HashMap<String, Arc<ScrapeLoop>>,
    last_group: TargetGroup,
    dropped: Vec<DroppedTarget>,
}

impl ScrapePool {
    /// Builds the job's scraper; fails if it cannot be constructed.
    pub fn new(
        cfg: Arc<ScrapeConfig>,
        appendable: Arc<dyn Appendable>,
        scraper_factory: Arc<dyn ScraperFactory>,
        metrics: Arc<ScrapeMetrics>,
        parent: &CancellationToken,
    ) -> Result<ScrapePool> {
        let scraper = scraper_factory.build(&cfg)?;
        Ok(ScrapePool {
            job: cfg.job_name.clone(),
            appendable,
            scraper_factory,
            metrics,
            ctx: parent.child_token(),
            sync_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(PoolState {
                config: cfg,
                scraper,
                loops: HashMap::new(),
                last_group: TargetGroup::default(),
                dropped: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn config(&self) -> Arc<ScrapeConfig> {
        self.lock().config.clone()
    }

    /// Makes the running loops match `group`: loops for vanished targets are
    /// stopped and awaited, new targets get a fresh loop, and loops for
    /// targets present before and after are left alone.
    pub async fn sync(&self, group: &TargetGroup) {
        let _sync = self.sync_lock.lock().await;
        self.sync_locked(group).await;
    }

    async fn sync_locked(&self, group: &TargetGroup) {
        if self.ctx.is_cancelled() {
            return;
        }
        let start = Instant::now();
        let config = self.config();
        let (targets, dropped) = targets_from_group(group, &config);
        for d in &dropped {
            warn!("scrape_pool={} dropping target {:?}: {}", self.job, d.address, d.reason);
        }

        let removed: Vec<Arc<ScrapeLoop>> = {
            let mut inner = self.lock();
            inner.last_group = group.clone();
            inner.dropped = dropped;

            let wanted: HashSet<&str> = targets.iter().map(|t| t.identity()).collect();
            let gone: Vec<String> = inner
                .loops
                .iter()
                .filter(|(id, l)| !wanted.contains(id.as_str()) || !l.is_live())
                .map(|(id, _)| id.clone())
                .collect();
            gone.iter().filter_map(|id| inner.loops.remove(id)).collect()
        };
        if !removed.is_empty() {
            debug!("scrape_pool={} stopping {} loops", self.job, removed.len());
        }
        join_all(removed.iter().map(|l| l.stop())).await;

        let mut inner = self.lock();
        let mut started = 0;
        for t in targets {
            if inner.loops.contains_key(t.identity()) {
                continue;
            }
            let id = t.identity().to_string();
            let l = ScrapeLoop::new(
                t,
                inner.scraper.clone(),
                self.appendable.clone(),
                self.metrics.clone(),
                inner.config.scrape_interval,
                inner.config.scrape_timeout,
                &self.ctx,
            );
            l.start();
            inner.loops.insert(id, l);
            started += 1;
        }

        let limit_err = match inner.config.target_limit {
            0 => None,
            limit if inner.loops.len() > limit => Some(format!(
                "target_limit exceeded (number of targets: {}, limit: {})",
                inner.loops.len(),
                limit
            )),
            _ => None,
        };
        if let Some(err) = &limit_err {
            warn!("scrape_pool={}: {}", self.job, err);
        }
        for l in inner.loops.values() {
            l.set_forced_error(limit_err.clone());
        }

        self.metrics
            .targets_active
            .with_label_values(&[&self.job])
            .set(inner.loops.len() as f64);
        self.metrics
            .targets_dropped
            .with_label_values(&[&self.job])
            .set(inner.dropped.len() as f64);
        self.metrics
            .sync_length
            .with_label_values(&[&self.job])
            .observe(start.elapsed().as_secs_f64());
        info!(
            "scrape_pool={} synced: {} active, {} started, {} stopped",
            self.job,
            inner.loops.len(),
            started,
            removed.len()
        );
        drop(inner);
        self.forget_discarded(&removed);
    }

    // Drops the scrape counters of discarded loops whose instance has no
    // loop left in the pool.
    fn forget_discarded(&self, discarded: &[Arc<ScrapeLoop>]) {
        if discarded.is_empty() {
            return;
        }
        let live: HashSet<String> = self
            .lock()
            .loops
            .values()
            .map(|l| l.target().instance().to_string())
            .collect();
        for l in discarded {
            let instance = l.target().instance();
            if !live.contains(instance) {
                self.metrics.forget_target(&self.job, instance);
            }
        }
    }

    /// Switches the pool to a new job configuration. If it differs from the
    /// current one, a new scraper is built and every loop is restarted
    /// against the last synced target group. A scraper that cannot be built
    /// leaves the pool untouched.
    pub async fn reload(&self, cfg: Arc<ScrapeConfig>) -> Result<()> {
        let _sync = self.sync_lock.lock().await;
        if *self.config() == *cfg {
            return Ok(());
        }
        let scraper = self.scraper_factory.build(&cfg)?;

        let (old, group) = {
            let mut inner = self.lock();
            inner.config = cfg;
            inner.scraper = scraper;
            let old: Vec<_> = inner.loops.drain().map(|(_, l)| l).collect();
            (old, inner.last_group.clone())
        };
        info!("scrape_pool={} reloading config, restarting {} loops", self.job, old.len());
        join_all(old.iter().map(|l| l.stop())).await;
        self.sync_locked(&group).await;
        self.forget_discarded(&old);
        Ok(())
    }

    /// Stops every loop and waits for all of them.
    pub async fn stop(&self) {
        let _sync = self.sync_lock.lock().await;
        self.ctx.cancel();
        let loops: Vec<_> = self.lock().loops.drain().map(|(_, l)| l).collect();
        join_all(loops.iter().map(|l| l.stop())).await;
        self.metrics
            .forget_job(&self.job, loops.iter().map(|l| l.target().instance()));
        info!("scrape_pool={} stopped {} loops", self.job, loops.len());
    }

    pub fn loops(&self) -> Vec<Arc<ScrapeLoop>> {
        self.lock().loops.values().cloned().collect()
    }

    pub fn scrape_loop(&self, identity: &str) -> Option<Arc<ScrapeLoop>> {
        self.lock().loops.get(identity).cloned()
    }

    pub fn active_targets(&self) -> Vec<Arc<Target>> {
        self.lock()
            .loops
            .values()
            .map(|l| l.target().clone())
            .collect()
    }

    pub fn dropped_targets(&self) -> Vec<DroppedTarget> {
        self.lock().dropped.clone()
    }
}
