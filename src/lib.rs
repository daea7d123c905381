pub mod app;
pub mod cli;
pub mod config;
pub mod cost;
pub mod error;
pub mod export;
pub mod live;
pub mod metrics;
pub mod report;
pub mod session;
pub mod timeframe;
pub mod ui;
pub mod util;
pub mod workflow;
