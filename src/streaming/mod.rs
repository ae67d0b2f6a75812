// Real-time spectrum streaming and analysis module
//
// Connects to a push-based frame producer, gates emission (pause, max rate),
// and folds emitted frames into statistics, traces and waterfall history.
//
// Architecture:
// - `source`: event source / command invoker / availability traits, plus the
//   in-process bus and a simulated producer
// - `session`: subscription lifecycle, retry and per-frame gating
// - `retry`: backoff policy with jitter and cancellation
// - `throttle`: minimum-interval emission gate
// - `statistics`: per-frame peak, mean and 3 dB bandwidth
// - `buffer`: ring buffer behind the waterfall
// - `traces`: max-hold and running average
// - `analyzer`: long-lived sink tying the above together

pub mod analyzer;
pub mod buffer;
pub mod retry;
pub mod session;
pub mod source;
pub mod statistics;
pub mod throttle;
pub mod traces;
pub mod types;

pub use analyzer::{AnalyzerConfig, AnalyzerSnapshot, SpectrumAnalyzer, WaterfallRow};
pub use buffer::{BufferMetrics, RingHistoryBuffer};
pub use retry::{Backoff, RetryContext, RetryError, RetryOptions, RetryPolicy, Retryable};
pub use session::{EventStreamSession, FrameSink, StreamConfig};
pub use source::{
    AvailabilityProbe, CommandInvoker, EventSource, Frame, FrameHandler, LocalEventBus, NoCommands,
    SimulatorConfig, SpectrumSimulator, StreamCommand, Subscription, Transport,
};
pub use statistics::Statistics;
pub use throttle::RateLimiter;
pub use traces::RunningTraces;
pub use types::{
    EmitMeta, SessionEvent, SessionStats, StreamError, StreamResult, StreamState, StreamStatus,
};
