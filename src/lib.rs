pub mod checkpoint;
pub mod common;
pub mod config;
pub mod convert;
pub mod data;
pub mod error;
pub mod evaluate;
pub mod loss_buffer;
pub mod metrics;
pub mod model;
pub mod schedule;
pub mod train;
pub mod visualizer;
