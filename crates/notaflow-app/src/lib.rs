pub mod cli;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod services;

pub use pipeline::worker::PipelineWorker;
