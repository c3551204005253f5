mod config;
pub mod schedule;
pub mod summary;
pub mod train;

pub use config::TrainingConfig;
