// Spectrum analyzer state fed by a streaming session
//
// Owns everything derived from emitted frames:
// - latest `Statistics` (recomputed per frame, never partially updated)
// - `RunningTraces` (max-hold and running average)
// - waterfall history in a `RingHistoryBuffer`
//
// Reads hand out copies, so a renderer can hold a snapshot while new frames
// keep arriving. Traces and history survive stream restarts; they are reset
// only by explicit calls (or on error when `reset_on_error` is set).

use crate::streaming::buffer::{BufferMetrics, RingHistoryBuffer};
use crate::streaming::session::FrameSink;
use crate::streaming::source::Frame;
use crate::streaming::statistics::{self, Statistics};
use crate::streaming::traces::RunningTraces;
use crate::streaming::types::EmitMeta;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyzerConfig {
    /// Keep waterfall rows for emitted frames
    #[serde(default = "default_true")]
    pub track_history: bool,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_true")]
    pub max_hold_enabled: bool,
    #[serde(default = "default_true")]
    pub average_enabled: bool,
    /// Clear traces and history when the session reports an error
    #[serde(default)]
    pub reset_on_error: bool,
}

fn default_true() -> bool {
    true
}
fn default_history_capacity() -> usize {
    256
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            track_history: true,
            history_capacity: default_history_capacity(),
            max_hold_enabled: true,
            average_enabled: true,
            reset_on_error: false,
        }
    }
}

/// One waterfall line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaterfallRow {
    pub timestamp: f64,
    pub received_at_ms: i64,
    pub values: Arc<[f64]>,
}

/// Point-in-time copy of the analyzer state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerSnapshot {
    pub statistics: Option<Statistics>,
    pub max_hold: Vec<f64>,
    pub average: Vec<f64>,
    pub average_count: u64,
    pub waterfall: Vec<WaterfallRow>,
    pub frames_analyzed: u64,
}

struct AnalyzerState {
    statistics: Option<Statistics>,
    traces: RunningTraces,
    history: RingHistoryBuffer<WaterfallRow>,
    frames_analyzed: u64,
}

pub struct SpectrumAnalyzer {
    config: RwLock<AnalyzerConfig>,
    state: RwLock<AnalyzerState>,
}

impl SpectrumAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let history = RingHistoryBuffer::new(config.history_capacity);
        Self {
            config: RwLock::new(config),
            state: RwLock::new(AnalyzerState {
                statistics: None,
                traces: RunningTraces::new(),
                history,
                frames_analyzed: 0,
            }),
        }
    }

    pub fn config(&self) -> AnalyzerConfig {
        self.config.read().clone()
    }

    /// Fold one emitted frame into the analyzer state
    pub fn analyze(&self, frame: &Frame, meta: &EmitMeta) {
        let stats = statistics::reduce(frame);
        let config = self.config.read().clone();

        let mut state = self.state.write();
        state.statistics = Some(stats);
        state.frames_analyzed += 1;

        if config.max_hold_enabled {
            state.traces.update_max_hold(&frame.values);
        }
        if config.average_enabled {
            state.traces.update_average(&frame.values);
        }
        if config.track_history {
            state.history.push(WaterfallRow {
                timestamp: frame.timestamp,
                received_at_ms: meta.received_at_ms,
                values: Arc::from(frame.values.as_slice()),
            });
        }
    }

    pub fn statistics(&self) -> Option<Statistics> {
        self.state.read().statistics
    }

    pub fn max_hold(&self) -> Vec<f64> {
        self.state.read().traces.max_hold()
    }

    pub fn average(&self) -> Vec<f64> {
        self.state.read().traces.average()
    }

    pub fn average_count(&self) -> u64 {
        self.state.read().traces.average_count()
    }

    /// Waterfall rows, oldest first
    pub fn waterfall(&self) -> Vec<WaterfallRow> {
        self.state.read().history.linearized()
    }

    pub fn history_metrics(&self) -> BufferMetrics {
        self.state.read().history.get_metrics()
    }

    pub fn frames_analyzed(&self) -> u64 {
        self.state.read().frames_analyzed
    }

    pub fn snapshot(&self) -> AnalyzerSnapshot {
        let state = self.state.read();
        AnalyzerSnapshot {
            statistics: state.statistics,
            max_hold: state.traces.max_hold(),
            average: state.traces.average(),
            average_count: state.traces.average_count(),
            waterfall: state.history.linearized(),
            frames_analyzed: state.frames_analyzed,
        }
    }

    pub fn reset_max_hold(&self) {
        self.state.write().traces.reset_max_hold();
    }

    pub fn reset_average(&self) {
        self.state.write().traces.reset_average();
    }

    pub fn clear_history(&self) {
        self.state.write().history.clear();
    }

    pub fn set_history_capacity(&self, capacity: usize) {
        self.config.write().history_capacity = capacity;
        self.state.write().history.set_capacity(capacity);
    }

    pub fn set_track_history(&self, enabled: bool) {
        self.config.write().track_history = enabled;
    }

    /// Clear traces, history, the last statistics and the frame count
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.statistics = None;
        state.frames_analyzed = 0;
        state.traces.reset_max_hold();
        state.traces.reset_average();
        state.history.clear();
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new(AnalyzerConfig::default())
    }
}

impl FrameSink for SpectrumAnalyzer {
    fn on_frame(&self, frame: &Frame, meta: &EmitMeta) {
        self.analyze(frame, meta);
    }

    fn on_error(&self, message: &str) {
        if self.config.read().reset_on_error {
            log::info!("Resetting analyzer state after stream error: {}", message);
            self.reset();
        }
    }
}
