use log::info;

use crate::config::Config;
use crate::discover::discover::{TargetGroup, TargetSets};

const SOURCE: &str = "static";

/// Serves the `static_configs` of every job as a discovery snapshot.
pub struct StaticDiscovery {
    groups: TargetSets,
}

impl StaticDiscovery {
    pub fn new(cfg: &Config) -> StaticDiscovery {
        let groups = cfg
            .scrape_configs
            .iter()
            .filter(|sc| !sc.static_configs.is_empty())
            .map(|sc| {
                let targets = sc
                    .static_configs
                    .iter()
                    .flat_map(|s| s.targets.iter().cloned());
                (sc.job_name.clone(), TargetGroup::new(SOURCE, targets))
            })
            .collect();
        StaticDiscovery { groups }
    }

    pub fn refresh(&self) -> TargetSets {
        for (job, group) in &self.groups {
            info!("static targets for job {}: {:?}", job, group.targets);
        }
        self.groups.clone()
    }
}
