pub mod driver;
pub mod filereader;
pub mod proxyscrape;
pub mod thespeedx;

pub use driver::{ProxyScraper, ScraperDriver};
