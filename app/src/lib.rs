pub mod actor;
mod app;
pub mod auction;
pub mod bus;
pub mod chaos;
pub mod config;
pub mod error;
pub mod funding;
pub mod grinder;
pub mod metrics;
pub mod orchestrator;
pub mod sync_barrier;
pub mod task;
pub mod watcher;

#[cfg(test)]
mod testing;

// for main.rs
pub use app::run;
