// Event source abstraction for streaming
//
// The session never talks to a transport directly. It consumes three narrow
// interfaces, bundled in `Transport`:
// - `EventSource`: async subscribe(event_name, handler) -> Subscription
// - `CommandInvoker`: async start/stop side-commands to the producer
// - `AvailabilityProbe`: synchronous "is the producer present at all"
//
// Current implementations:
// - `LocalEventBus`: in-process event emitter (source + probe)
// - `SpectrumSimulator`: producer driven by start/stop commands (invoker)

mod bus;
mod simulated;

use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub use bus::LocalEventBus;
pub use simulated::{SimulatorConfig, SpectrumSimulator};

/// One timestamped spectrum frame from the producer
///
/// `domain` and `values` are paired 1:1 (e.g. frequency bins and dBm).
/// Frames with mismatched lengths are a producer contract error and are not
/// validated by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Frame {
    pub domain: Vec<f64>,
    pub values: Vec<f64>,

    /// Producer timestamp (unix millis)
    pub timestamp: f64,

    /// Sequence number for detecting frame loss
    #[serde(default)]
    pub sequence: Option<u64>,

    /// Precomputed summary fields; take precedence over recomputation
    #[serde(default)]
    pub peak_domain: Option<f64>,
    #[serde(default)]
    pub peak_value: Option<f64>,
    #[serde(default)]
    pub average_value: Option<f64>,
}

impl Frame {
    pub fn new(domain: Vec<f64>, values: Vec<f64>, timestamp: f64) -> Self {
        Self {
            domain,
            values,
            timestamp,
            ..Default::default()
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Attach producer-side peak/average fields
    pub fn with_summary(mut self, peak_domain: f64, peak_value: f64, average_value: f64) -> Self {
        self.peak_domain = Some(peak_domain);
        self.peak_value = Some(peak_value);
        self.average_value = Some(average_value);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_well_formed(&self) -> bool {
        self.domain.len() == self.values.len()
    }
}

/// An out-of-band request to the producer (start/stop)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamCommand {
    pub name: String,
    #[serde(default)]
    pub args: Option<serde_json::Value>,
}

impl StreamCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: None,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = Some(args);
        self
    }
}

/// Callback receiving one frame per physical event
pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;

/// Registered listener handle
///
/// Releasing it (explicitly or by drop) runs the source's unsubscribe
/// function exactly once.
pub struct Subscription {
    id: u64,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new<F>(id: u64, unsubscribe: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            id,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Push-based event source
///
/// Dropping a pending `subscribe` future must not leave a listener
/// registered: either register at completion, or hand the registration to a
/// `Subscription` before the next await point.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, event_name: &str, handler: FrameHandler)
        -> StreamResult<Subscription>;
}

/// Side-command invoker (start/stop requests to the producer)
#[async_trait]
pub trait CommandInvoker: Send + Sync {
    async fn invoke(&self, command: &str, args: Option<serde_json::Value>) -> StreamResult<()>;
}

/// Synchronous, side-effect-free availability check
pub trait AvailabilityProbe: Send + Sync {
    fn is_source_available(&self) -> bool;
}

/// Invoker for producers that take no side-commands
pub struct NoCommands;

#[async_trait]
impl CommandInvoker for NoCommands {
    async fn invoke(&self, command: &str, _args: Option<serde_json::Value>) -> StreamResult<()> {
        Err(StreamError::Command {
            command: command.to_string(),
            message: "no command invoker configured".to_string(),
        })
    }
}

/// The collaborators a session is wired to
#[derive(Clone)]
pub struct Transport {
    pub source: Arc<dyn EventSource>,
    pub invoker: Arc<dyn CommandInvoker>,
    pub probe: Arc<dyn AvailabilityProbe>,
}

impl Transport {
    pub fn new(
        source: Arc<dyn EventSource>,
        invoker: Arc<dyn CommandInvoker>,
        probe: Arc<dyn AvailabilityProbe>,
    ) -> Self {
        Self {
            source,
            invoker,
            probe,
        }
    }

    /// Bus acts as both source and probe
    pub fn from_bus(bus: Arc<LocalEventBus>, invoker: Arc<dyn CommandInvoker>) -> Self {
        Self {
            source: bus.clone(),
            invoker,
            probe: bus,
        }
    }
}
