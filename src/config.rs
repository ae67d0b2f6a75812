// Pipeline configuration
//
// One JSON document configures the whole demo pipeline. Every field is
// optional; missing fields fall back to the defaults below.

use crate::streaming::{
    AnalyzerConfig, SimulatorConfig, StreamCommand, StreamConfig, StreamError, StreamResult,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    #[serde(default = "default_stream")]
    pub stream: StreamConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    /// Stop after this many seconds (None runs until Ctrl-C)
    #[serde(default = "default_run_seconds")]
    pub run_seconds: Option<u64>,
}

/// Stream wired to the simulator's side-commands
fn default_stream() -> StreamConfig {
    let simulator = SimulatorConfig::default();
    StreamConfig {
        event_name: simulator.event_name,
        start_command: Some(StreamCommand::new(simulator.start_command)),
        stop_command: Some(StreamCommand::new(simulator.stop_command)),
        max_emit_hz: Some(10.0),
        ..Default::default()
    }
}

fn default_run_seconds() -> Option<u64> {
    Some(10)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stream: default_stream(),
            analyzer: AnalyzerConfig::default(),
            simulator: SimulatorConfig::default(),
            run_seconds: default_run_seconds(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> StreamResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        log::info!("Loaded pipeline configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> StreamResult<()> {
        self.stream.validate()?;

        if self.stream.event_name != self.simulator.event_name {
            return Err(StreamError::InvalidConfig(format!(
                "stream listens on '{}' but the simulator emits '{}'",
                self.stream.event_name, self.simulator.event_name
            )));
        }
        if self.simulator.bins == 0 {
            return Err(StreamError::InvalidConfig(
                "simulator.bins must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
