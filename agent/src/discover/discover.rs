use std::collections::HashMap;

/// The complete set of targets discovery currently believes live for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetGroup {
    /// Name of the discovery mechanism that produced the group.
    pub source: String,
    /// Target addresses, `host:port` or a URL.
    pub targets: Vec<String>,
}

impl TargetGroup {
    pub fn new<I, S>(source: &str, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source: source.to_string(),
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }
}

/// One discovery snapshot: job name to that job's target group.
pub type TargetSets = HashMap<String, TargetGroup>;
