pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod group;
pub mod metrics;
pub mod report;
pub mod schedule;
pub mod train_loop;
pub mod worker;

pub use config::RunConfig;
pub use error::{Result, WorkerErr};
pub use train_loop::{RunSummary, TrainLoop};
pub use worker::{Worker, WorkerArgs};
