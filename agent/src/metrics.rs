use std::time::Duration;

use prometheus::{Counter, CounterVec, GaugeVec, HistogramVec, Registry};

use common::metrics::registry::Registerer;

pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_FAILURE: &str = "failure";

pub struct ScrapeMetrics {
    pub target_scrapes: CounterVec,
    pub scrape_duration: HistogramVec,
    pub targets_active: GaugeVec,
    pub targets_dropped: GaugeVec,
    pub sync_length: HistogramVec,
    pub pools_total: Counter,
    pub pools_failed: Counter,
    pub reloads: Counter,
    pub reload_errors: Counter,
}

impl ScrapeMetrics {
    pub fn new(reg: &Registry) -> ScrapeMetrics {
        ScrapeMetrics {
            target_scrapes: reg.register_counter_vec(
                "scrape_target_scrapes_total",
                "Total number of scrape cycles by outcome",
                &["job", "instance", "outcome"],
            ),
            scrape_duration: reg.register_histogram_vec(
                "scrape_target_scrape_duration_seconds",
                "Duration of scrape cycles",
                &["job"],
            ),
            targets_active: reg.register_gauge_vec(
                "scrape_targets_active",
                "Number of targets with a running scrape loop",
                &["job"],
            ),
            targets_dropped: reg.register_gauge_vec(
                "scrape_targets_dropped",
                "Number of discovered addresses that could not be scraped",
                &["job"],
            ),
            sync_length: reg.register_histogram_vec(
                "scrape_pool_sync_length_seconds",
                "Time taken to reconcile a scrape pool against its target group",
                &["job"],
            ),
            pools_total: reg.register_counter(
                "scrape_pools_total",
                "Total number of scrape pools created",
            ),
            pools_failed: reg.register_counter(
                "scrape_pools_failed_total",
                "Total number of scrape pools that could not be created",
            ),
            reloads: reg.register_counter(
                "scrape_reloads_total",
                "Total number of completed reload passes",
            ),
            reload_errors: reg.register_counter(
                "scrape_reload_errors_total",
                "Total number of jobs skipped or left unchanged by a reload pass because of an error",
            ),
        }
    }

    pub(crate) fn observe_scrape(&self, job: &str, instance: &str, duration: Duration, ok: bool) {
        let outcome = if ok { OUTCOME_SUCCESS } else { OUTCOME_FAILURE };
        self.target_scrapes
            .with_label_values(&[job, instance, outcome])
            .inc();
        self.scrape_duration
            .with_label_values(&[job])
            .observe(duration.as_secs_f64());
    }

    /// Number of cycles a target finished with the given outcome.
    pub fn scrapes(&self, job: &str, instance: &str, outcome: &str) -> u64 {
        self.target_scrapes
            .get_metric_with_label_values(&[job, instance, outcome])
            .map(|c| c.get() as u64)
            .unwrap_or(0)
    }

    /// Removes the per-outcome scrape counters of one target.
    pub(crate) fn forget_target(&self, job: &str, instance: &str) {
        for outcome in [OUTCOME_SUCCESS, OUTCOME_FAILURE] {
            let _ = self
                .target_scrapes
                .remove_label_values(&[job, instance, outcome]);
        }
    }

    pub(crate) fn forget_job<'a>(&self, job: &str, instances: impl IntoIterator<Item = &'a str>) {
        for instance in instances {
            self.forget_target(job, instance);
        }
        let _ = self.targets_active.remove_label_values(&[job]);
        let _ = self.targets_dropped.remove_label_values(&[job]);
        let _ = self.scrape_duration.remove_label_values(&[job]);
        let _ = self.sync_length.remove_label_values(&[job]);
    }
}
