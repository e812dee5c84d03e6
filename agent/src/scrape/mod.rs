pub mod manager;
pub mod scrape;
pub mod scrape_loop;
pub mod target;

pub use manager::{Manager, Options};
pub use scrape::{HttpClientFactory, HttpScraper, Scraper, ScraperFactory};
pub use scrape_loop::{LoopState, ScrapeLoop, ScrapePool};
pub use target::{DroppedTarget, Target, TargetHealth, TargetStatus};
