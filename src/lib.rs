pub mod config;
pub mod streaming;

pub use config::PipelineConfig;
