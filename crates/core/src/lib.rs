//! Training, evaluation and benchmarking for video frame interpolation models.

pub mod benchmark;
pub mod config;
pub mod dataset;
pub mod evaluate;
pub mod imaging;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod schedule;
pub mod seed;
pub mod summary;
pub mod train;
pub mod types;
