use prometheus::core::Collector;
use prometheus::{Counter, CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};

/// Registers collectors into an explicit registry instead of the process default one.
///
/// Registration failures (usually a duplicate name) are logged and the
/// collector is returned unregistered, so a second component sharing a
/// registry keeps working.
pub trait Registerer {
    fn register_gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> GaugeVec;
    fn register_counter(&self, name: &str, help: &str) -> Counter;
    fn register_counter_vec(&self, name: &str, help: &str, labels: &[&str]) -> CounterVec;
    fn register_histogram_vec(&self, name: &str, help: &str, labels: &[&str]) -> HistogramVec;
}

fn register<C: Collector + Clone + 'static>(reg: &Registry, collector: C) -> C {
    if let Err(err) = reg.register(Box::new(collector.clone())) {
        log::warn!("failed to register collector: {}", err);
    }
    collector
}

impl Registerer for Registry {
    fn register_gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
        let gauge_vec = GaugeVec::new(Opts::new(name, help), labels)
            .expect("metric options are static and valid");
        register(self, gauge_vec)
    }

    fn register_counter(&self, name: &str, help: &str) -> Counter {
        let counter = Counter::new(name, help).expect("metric options are static and valid");
        register(self, counter)
    }

    fn register_counter_vec(&self, name: &str, help: &str, labels: &[&str]) -> CounterVec {
        let counter_vec = CounterVec::new(Opts::new(name, help), labels)
            .expect("metric options are static and valid");
        register(self, counter_vec)
    }

    fn register_histogram_vec(&self, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
        let histogram_vec = HistogramVec::new(HistogramOpts::new(name, help), labels)
            .expect("metric options are static and valid");
        register(self, histogram_vec)
    }
}
