use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("found multiple scrape configs with job name {0:?}")]
    DuplicateJobName(String),
    #[error("scrape timeout greater than scrape interval for scrape config with job name {0:?}")]
    TimeoutExceedsInterval(String),
    #[error("not a valid duration string: {0:?}")]
    InvalidDuration(String),
    #[error("error creating http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP status {0}")]
    Status(u16),
    #[error("scrape timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid target {address:?}: {reason}")]
    InvalidTarget { address: String, reason: String },
    #[error("{0}")]
    Forced(String),
    #[error("append failed: {0}")]
    Append(String),
    #[error("no scrape config for job {0:?}")]
    UnknownJob(String),
    #[error("scrape manager is already running")]
    AlreadyRunning,
}

impl Error {
    pub fn context(self, context: impl Into<String>) -> Error {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
