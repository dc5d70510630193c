pub mod chart;
pub mod config;
pub mod logging;
pub mod measure;
pub mod proxy;
pub mod run_log;
pub mod stats;
pub mod summary;
