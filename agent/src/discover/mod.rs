pub mod discover;
pub mod static_discovery;

pub use discover::{TargetGroup, TargetSets};
pub use static_discovery::StaticDiscovery;
