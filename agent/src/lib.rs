pub mod appender;
pub mod config;
pub mod discover;
pub mod metrics;
pub mod scrape;
