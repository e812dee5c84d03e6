use std::sync::Arc;
use std::time::{Instant, SystemTime};

use prometheus::{HistogramVec, Registry};

use common::common::labels::Labels;
use common::error::{Error, Result};
use common::metrics::registry::Registerer;

/// One successful scrape body, handed over unparsed.
#[derive(Debug, Clone)]
pub struct RawSample {
    pub raw: Vec<u8>,
    pub timestamp: SystemTime,
}

pub trait Appender: Send + Sync {
    fn append(&self, labels: &Labels, samples: Vec<RawSample>) -> Result<()>;
}

pub trait Appendable: Send + Sync {
    fn appender(&self) -> Arc<dyn Appender>;
}

/// Forwards every append to all children.
pub struct Fanout {
    children: Arc<Vec<Arc<dyn Appender>>>,
    component_id: String,
    write_latency: HistogramVec,
}

impl Fanout {
    pub fn new(children: Vec<Arc<dyn Appender>>, component_id: &str, registry: &Registry) -> Self {
        let write_latency = registry.register_histogram_vec(
            "scrape_fanout_latency_seconds",
            "Write latency for handing scraped bodies to storage",
            &["component"],
        );
        Fanout {
            children: Arc::new(children),
            component_id: component_id.to_string(),
            write_latency,
        }
    }
}

impl Appendable for Fanout {
    fn appender(&self) -> Arc<dyn Appender> {
        Arc::new(AppenderImpl {
            children: self.children.clone(),
            component_id: self.component_id.clone(),
            write_latency: self.write_latency.clone(),
        })
    }
}

struct AppenderImpl {
    children: Arc<Vec<Arc<dyn Appender>>>,
    component_id: String,
    write_latency: HistogramVec,
}

impl Appender for AppenderImpl {
    fn append(&self, labels: &Labels, samples: Vec<RawSample>) -> Result<()> {
        let start_time = Instant::now();
        let mut errors = Vec::new();
        for child in self.children.iter() {
            if let Err(err) = child.append(labels, samples.clone()) {
                errors.push(err.to_string());
            }
        }
        self.write_latency
            .with_label_values(&[&self.component_id])
            .observe(start_time.elapsed().as_secs_f64());
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Append(format!("{}: {}", labels, errors.join("; "))))
        }
    }
}

/// Drops everything it is given.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl Appender for Discard {
    fn append(&self, _labels: &Labels, _samples: Vec<RawSample>) -> Result<()> {
        Ok(())
    }
}

impl Appendable for Discard {
    fn appender(&self) -> Arc<dyn Appender> {
        Arc::new(Discard)
    }
}
