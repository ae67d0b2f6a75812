// Event stream session
//
// Owns one subscription to a named event on behalf of a consumer:
// - availability check, subscribe and start command, wrapped in a RetryPolicy
// - per-frame latest update, Loading -> Ready transition, pause and rate gating
// - teardown (unsubscribe, then stop command) on stop, retry, config edges and drop
//
// Every setup run is tagged with a generation. Teardown bumps the generation,
// so a setup that completes after it was superseded releases its own
// subscription instead of publishing it, and frames delivered to a stale
// handler are ignored.
//
// A stop command is owed from the moment a start command is sent, not from
// the moment it completes. Teardown pays every owed stop, including one for
// a start command that is still in flight.

use crate::streaming::retry::{RetryError, RetryOptions, RetryPolicy};
use crate::streaming::source::{Frame, FrameHandler, StreamCommand, Subscription, Transport};
use crate::streaming::throttle::RateLimiter;
use crate::streaming::types::{
    EmitMeta, SessionEvent, SessionStats, StreamError, StreamResult, StreamState, StreamStatus,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

/// Receives every emitted frame, and setup errors
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &Frame, meta: &EmitMeta);

    fn on_error(&self, _message: &str) {}
}

pub type EmitCallback = Arc<dyn Fn(&Frame, &EmitMeta) + Send + Sync>;

type EventCallback = Box<dyn Fn(SessionEvent) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub paused: bool,
    /// Keep calling consumers while paused (meta.paused is set)
    #[serde(default)]
    pub emit_while_paused: bool,
    /// None or <= 0 disables throttling
    #[serde(default)]
    pub max_emit_hz: Option<f64>,
    #[serde(default = "default_event_name")]
    pub event_name: String,
    #[serde(default)]
    pub start_command: Option<StreamCommand>,
    #[serde(default)]
    pub stop_command: Option<StreamCommand>,
    /// Read once when the session is created
    #[serde(default)]
    pub setup_retry: RetryOptions,
}

fn default_enabled() -> bool {
    true
}
fn default_event_name() -> String {
    "spectrum-frame".to_string()
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            paused: false,
            emit_while_paused: false,
            max_emit_hz: None,
            event_name: default_event_name(),
            start_command: None,
            stop_command: None,
            setup_retry: RetryOptions::default(),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> StreamResult<()> {
        if self.event_name.trim().is_empty() {
            return Err(StreamError::InvalidConfig(
                "event_name must not be empty".to_string(),
            ));
        }
        if let Some(hz) = self.max_emit_hz {
            if hz.is_nan() {
                return Err(StreamError::InvalidConfig(
                    "max_emit_hz must be a number".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// A setup run that has asked the producer to start
struct StartedProducer {
    generation: u64,
    stop_command: Option<StreamCommand>,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    emitted: AtomicU64,
    throttled: AtomicU64,
    paused: AtomicU64,
}

struct SessionInner {
    id: String,
    transport: Transport,
    config: RwLock<StreamConfig>,
    state: RwLock<StreamState>,
    latest: RwLock<Option<Arc<Frame>>>,
    limiter: Mutex<RateLimiter>,
    generation: AtomicU64,
    /// Generation whose subscribe and start command have completed
    established: AtomicU64,
    /// Generation of the most recently received frame
    last_frame_generation: AtomicU64,
    active: Mutex<Option<Subscription>>,
    /// Producers owed a stop command on teardown
    started: Mutex<Vec<StartedProducer>>,
    retry: RetryPolicy,
    sinks: RwLock<Vec<Arc<dyn FrameSink>>>,
    consumers: RwLock<Vec<EmitCallback>>,
    event_callback: RwLock<Option<EventCallback>>,
    counters: Counters,
    /// Monotonic origin for the rate limiter clock
    epoch: Instant,
}

/// Cheap-to-clone handle to a streaming session
#[derive(Clone)]
pub struct EventStreamSession {
    inner: Arc<SessionInner>,
}

impl EventStreamSession {
    /// Create an idle session; call `connect` to subscribe
    pub fn new(config: StreamConfig, transport: Transport) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        log::info!(
            "Creating stream session {} for event '{}'",
            id,
            config.event_name
        );

        let inner = SessionInner {
            id,
            transport,
            limiter: Mutex::new(RateLimiter::new(config.max_emit_hz)),
            retry: RetryPolicy::new(config.setup_retry.clone()),
            config: RwLock::new(config),
            state: RwLock::new(StreamState::Idle),
            latest: RwLock::new(None),
            generation: AtomicU64::new(0),
            established: AtomicU64::new(0),
            last_frame_generation: AtomicU64::new(0),
            active: Mutex::new(None),
            started: Mutex::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            consumers: RwLock::new(Vec::new()),
            event_callback: RwLock::new(None),
            counters: Counters::default(),
            epoch: Instant::now(),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Create a session with its sinks attached and connect it
    pub async fn start(
        config: StreamConfig,
        transport: Transport,
        sinks: Vec<Arc<dyn FrameSink>>,
    ) -> Self {
        let session = Self::new(config, transport);
        for sink in sinks {
            session.add_sink(sink);
        }
        session.connect().await;
        session
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn add_sink(&self, sink: Arc<dyn FrameSink>) {
        self.inner.sinks.write().push(sink);
    }

    /// Register a consumer called for every emitted frame
    pub fn on_emit<F>(&self, callback: F)
    where
        F: Fn(&Frame, &EmitMeta) + Send + Sync + 'static,
    {
        self.inner.consumers.write().push(Arc::new(callback));
    }

    pub fn set_event_callback<F>(&self, callback: F)
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        *self.inner.event_callback.write() = Some(Box::new(callback));
    }

    /// Most recent frame, updated regardless of pause or throttle
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.inner.latest.read().clone()
    }

    pub fn state(&self) -> StreamState {
        self.inner.state.read().clone()
    }

    pub fn status(&self) -> StreamStatus {
        let state = self.state();
        StreamStatus {
            error_message: state.error_message().map(str::to_string),
            state,
            latest: self.latest(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        let counters = &self.inner.counters;
        SessionStats {
            frames_received: counters.received.load(Ordering::Relaxed),
            frames_emitted: counters.emitted.load(Ordering::Relaxed),
            frames_throttled: counters.throttled.load(Ordering::Relaxed),
            frames_paused: counters.paused.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> StreamConfig {
        self.inner.config.read().clone()
    }

    /// Subscribe if enabled and not already subscribed
    pub async fn connect(&self) {
        let enabled = self.inner.config.read().enabled;
        if !enabled {
            log::debug!("Stream session {} is disabled, not connecting", self.inner.id);
            return;
        }
        let subscribed = self.inner.active.lock().is_some();
        if subscribed {
            return;
        }
        self.inner.activate().await;
    }

    /// Tear down the subscription; the last frame stays readable
    pub async fn stop(&self) {
        log::info!("Stopping stream session {}", self.inner.id);
        self.inner.teardown(StreamState::Idle).await;
    }

    /// Tear down, clear the last frame and run setup again
    pub async fn retry(&self) {
        log::info!("Retrying stream session {}", self.inner.id);
        self.inner.teardown(StreamState::Idle).await;
        *self.inner.latest.write() = None;

        let enabled = self.inner.config.read().enabled;
        if enabled {
            self.inner.activate().await;
        }
    }

    /// Apply a new configuration, reacting to enabled and event name edges
    pub async fn update_config(&self, config: StreamConfig) {
        let previous = {
            let mut current = self.inner.config.write();
            std::mem::replace(&mut *current, config.clone())
        };

        if previous.max_emit_hz != config.max_emit_hz {
            *self.inner.limiter.lock() = RateLimiter::new(config.max_emit_hz);
        }

        match (previous.enabled, config.enabled) {
            (false, true) => self.inner.activate().await,
            (true, false) => self.inner.teardown(StreamState::Idle).await,
            (true, true) if previous.event_name != config.event_name => {
                self.inner.teardown(StreamState::Idle).await;
                self.inner.activate().await;
            }
            _ => {}
        }
    }

    pub async fn set_enabled(&self, enabled: bool) {
        let mut config = self.config();
        config.enabled = enabled;
        self.update_config(config).await;
    }

    /// Pausing gates emission only; `latest` keeps updating
    pub fn set_paused(&self, paused: bool) {
        self.inner.config.write().paused = paused;
    }
}

impl SessionInner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Start a new generation and publish its initial state atomically
    fn begin_generation(&self, state: StreamState) -> u64 {
        let generation = {
            let mut current = self.state.write();
            *current = state.clone();
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.emit_event(SessionEvent::StateChanged {
            session_id: self.id.clone(),
            state,
        });
        generation
    }

    fn set_state_if_current(&self, generation: u64, state: StreamState) -> bool {
        {
            let mut current = self.state.write();
            if !self.is_current(generation) {
                return false;
            }
            *current = state.clone();
        }
        self.emit_event(SessionEvent::StateChanged {
            session_id: self.id.clone(),
            state,
        });
        true
    }

    fn emit_event(&self, event: SessionEvent) {
        if let Some(callback) = self.event_callback.read().as_ref() {
            callback(event);
        }
    }

    async fn activate(self: &Arc<Self>) {
        if !self.transport.probe.is_source_available() {
            log::info!(
                "Stream session {}: event source unavailable",
                self.id
            );
            self.begin_generation(StreamState::Unavailable);
            return;
        }

        let generation = self.begin_generation(StreamState::Loading);
        self.establish(generation).await;
    }

    async fn establish(self: &Arc<Self>, generation: u64) {
        let config = self.config.read().clone();
        let handler = self.frame_handler(generation);

        let result = self
            .retry
            .run(|ctx| {
                let inner = Arc::clone(self);
                let handler = Arc::clone(&handler);
                let config = config.clone();
                async move {
                    log::debug!(
                        "Stream session {}: setup attempt {}/{}",
                        inner.id,
                        ctx.attempt,
                        ctx.max_attempts
                    );
                    inner.subscribe_and_start(generation, &config, handler).await
                }
            })
            .await;

        match result {
            Ok(subscription) => {
                let published = {
                    let mut slot = self.active.lock();
                    if self.is_current(generation) {
                        self.established.store(generation, Ordering::SeqCst);
                        Ok(slot.replace(subscription))
                    } else {
                        Err(subscription)
                    }
                };
                match published {
                    Ok(previous) => {
                        if let Some(previous) = previous {
                            previous.unsubscribe();
                        }
                        if config.start_command.is_none() {
                            self.record_start(generation, config.stop_command.clone());
                        }
                        log::info!(
                            "Stream session {} subscribed to '{}'",
                            self.id,
                            config.event_name
                        );
                        // A frame may have arrived while the start command was pending
                        if self.last_frame_generation.load(Ordering::SeqCst) == generation {
                            self.mark_ready(generation);
                        }
                    }
                    Err(subscription) => {
                        subscription.unsubscribe();
                        log::debug!(
                            "Stream session {}: released superseded subscription",
                            self.id
                        );
                        // A newer setup may be relying on the producer; its teardown pays instead
                        let settled = {
                            let state = self.state.read();
                            !matches!(*state, StreamState::Loading | StreamState::Ready)
                        };
                        if settled {
                            let owed = self.take_started(Some(generation));
                            self.send_stop_commands(owed).await;
                        }
                    }
                }
            }
            Err(RetryError::Cancelled) | Err(RetryError::Failed(StreamError::Stale)) => {
                log::debug!("Stream session {}: setup superseded", self.id);
            }
            Err(RetryError::Failed(error)) => self.fail(generation, error),
        }
    }

    async fn subscribe_and_start(
        &self,
        generation: u64,
        config: &StreamConfig,
        handler: FrameHandler,
    ) -> StreamResult<Subscription> {
        let subscription = self
            .transport
            .source
            .subscribe(&config.event_name, handler)
            .await
            .map_err(|e| match e {
                StreamError::Timeout(_) | StreamError::Setup(_) => e,
                other => StreamError::Setup(other.to_string()),
            })?;

        if !self.is_current(generation) {
            subscription.unsubscribe();
            return Err(StreamError::Stale);
        }

        if let Some(command) = &config.start_command {
            if !self.record_start(generation, config.stop_command.clone()) {
                subscription.unsubscribe();
                return Err(StreamError::Stale);
            }
            log::info!(
                "Stream session {}: invoking start command '{}'",
                self.id,
                command.name
            );
            if let Err(e) = self
                .transport
                .invoker
                .invoke(&command.name, command.args.clone())
                .await
            {
                // No listener may outlive a failed start
                subscription.unsubscribe();
                return Err(match e {
                    StreamError::Timeout(_) => e,
                    other => StreamError::StartCommand {
                        command: command.name.clone(),
                        message: other.to_string(),
                    },
                });
            }
        }

        Ok(subscription)
    }

    /// Note that `generation` asked the producer to start; false if superseded
    fn record_start(&self, generation: u64, stop_command: Option<StreamCommand>) -> bool {
        let mut started = self.started.lock();
        if !self.is_current(generation) {
            return false;
        }
        if !started.iter().any(|s| s.generation == generation) {
            started.push(StartedProducer {
                generation,
                stop_command,
            });
        }
        true
    }

    /// Take the owed stop commands, for one generation or all of them
    fn take_started(&self, generation: Option<u64>) -> Vec<StreamCommand> {
        let taken: Vec<StartedProducer> = {
            let mut started = self.started.lock();
            match generation {
                Some(generation) => {
                    let (taken, kept) = std::mem::take(&mut *started)
                        .into_iter()
                        .partition(|s| s.generation == generation);
                    *started = kept;
                    taken
                }
                None => std::mem::take(&mut *started),
            }
        };

        let mut commands: Vec<StreamCommand> = Vec::new();
        for command in taken.into_iter().filter_map(|s| s.stop_command) {
            if !commands.iter().any(|c| c.name == command.name) {
                commands.push(command);
            }
        }
        commands
    }

    async fn send_stop_commands(&self, commands: Vec<StreamCommand>) {
        for command in commands {
            log::info!(
                "Stream session {}: invoking stop command '{}'",
                self.id,
                command.name
            );
            if let Err(e) = self
                .transport
                .invoker
                .invoke(&command.name, command.args)
                .await
            {
                let error = StreamError::StopCommand {
                    command: command.name,
                    message: e.to_string(),
                };
                log::warn!("Stream session {}: {}", self.id, error);
            }
        }
    }

    fn fail(&self, generation: u64, error: StreamError) {
        let message = error.to_string();
        if !self.set_state_if_current(
            generation,
            StreamState::Error {
                message: message.clone(),
            },
        ) {
            return;
        }

        log::error!("Stream session {} setup failed: {}", self.id, message);

        let sinks = self.sinks.read().clone();
        for sink in &sinks {
            sink.on_error(&message);
        }
        self.emit_event(SessionEvent::Error {
            session_id: self.id.clone(),
            error: message,
        });
    }

    /// Loading -> Ready, at most once per generation
    fn mark_ready(&self, generation: u64) {
        let became_ready = {
            let mut state = self.state.write();
            if self.is_current(generation) && *state == StreamState::Loading {
                *state = StreamState::Ready;
                true
            } else {
                false
            }
        };
        if became_ready {
            log::info!("Stream session {} received first frame", self.id);
            self.emit_event(SessionEvent::StateChanged {
                session_id: self.id.clone(),
                state: StreamState::Ready,
            });
        }
    }

    fn frame_handler(self: &Arc<Self>, generation: u64) -> FrameHandler {
        let weak = Arc::downgrade(self);
        Arc::new(move |frame: Frame| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_frame(generation, frame);
            }
        })
    }

    fn handle_frame(&self, generation: u64, frame: Frame) {
        if !self.is_current(generation) {
            return;
        }

        let frame = Arc::new(frame);
        *self.latest.write() = Some(Arc::clone(&frame));
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.last_frame_generation.store(generation, Ordering::SeqCst);

        // Nothing is emitted before setup has completed
        if self.established.load(Ordering::SeqCst) != generation {
            return;
        }
        self.mark_ready(generation);

        let (paused, emit_while_paused) = {
            let config = self.config.read();
            (config.paused, config.emit_while_paused)
        };
        if paused && !emit_while_paused {
            self.counters.paused.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let now_ms = self.epoch.elapsed().as_micros() as f64 / 1000.0;
        if !self.limiter.lock().accept(now_ms) {
            self.counters.throttled.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let meta = EmitMeta {
            paused,
            received_at_ms: chrono::Utc::now().timestamp_millis(),
        };
        self.counters.emitted.fetch_add(1, Ordering::Relaxed);

        let sinks = self.sinks.read().clone();
        for sink in &sinks {
            sink.on_frame(&frame, &meta);
        }
        let consumers = self.consumers.read().clone();
        for consumer in &consumers {
            consumer(&frame, &meta);
        }
    }

    /// Invalidate in-flight setup, unsubscribe, then send owed stop commands
    async fn teardown(&self, next_state: StreamState) {
        self.begin_generation(next_state);
        self.retry.cancel();
        self.limiter.lock().reset();

        let owed = self.take_started(None);
        let active = self.active.lock().take();
        if let Some(subscription) = active {
            subscription.unsubscribe();
            log::info!("Stream session {} unsubscribed", self.id);
        }

        self.send_stop_commands(owed).await;
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.retry.cancel();

        if let Some(subscription) = self.active.get_mut().take() {
            subscription.unsubscribe();
        }

        for command in self.take_started(None) {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let invoker = Arc::clone(&self.transport.invoker);
                    let id = self.id.clone();
                    runtime.spawn(async move {
                        if let Err(e) = invoker.invoke(&command.name, command.args).await {
                            log::warn!(
                                "Stream session {}: stop command '{}' failed on drop: {}",
                                id,
                                command.name,
                                e
                            );
                        }
                    });
                }
                Err(_) => log::warn!(
                    "Stream session {} dropped outside a runtime; stop command '{}' not sent",
                    self.id,
                    command.name
                ),
            }
        }

        log::info!("Stream session {} dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::retry::Backoff;
    use crate::streaming::source::{CommandInvoker, EventSource, LocalEventBus};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tokio::time::Duration;

    const EVENT: &str = "spectrum-frame";

    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<String>>,
        failing: HashSet<String>,
    }

    impl RecordingInvoker {
        fn failing(commands: &[&str]) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failing: commands.iter().map(|c| c.to_string()).collect(),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandInvoker for RecordingInvoker {
        async fn invoke(
            &self,
            command: &str,
            _args: Option<serde_json::Value>,
        ) -> StreamResult<()> {
            self.calls.lock().push(command.to_string());
            if self.failing.contains(command) {
                return Err(StreamError::Command {
                    command: command.to_string(),
                    message: "device busy".to_string(),
                });
            }
            Ok(())
        }
    }

    fn fixture(invoker: RecordingInvoker) -> (Arc<LocalEventBus>, Arc<RecordingInvoker>, Transport) {
        let bus = Arc::new(LocalEventBus::new());
        let invoker = Arc::new(invoker);
        let transport = Transport::from_bus(bus.clone(), invoker.clone());
        (bus, invoker, transport)
    }

    /// Fails the first `failures` subscribe calls, with timeouts or rejections
    struct FlakySource {
        bus: Arc<LocalEventBus>,
        failures: u32,
        timeout: bool,
        attempts: Mutex<u32>,
    }

    impl FlakySource {
        fn attempts(&self) -> u32 {
            *self.attempts.lock()
        }
    }

    #[async_trait]
    impl EventSource for FlakySource {
        async fn subscribe(
            &self,
            event_name: &str,
            handler: FrameHandler,
        ) -> StreamResult<Subscription> {
            let attempt = {
                let mut attempts = self.attempts.lock();
                *attempts += 1;
                *attempts
            };
            if attempt <= self.failures {
                return Err(if self.timeout {
                    StreamError::Timeout(format!("ipc attempt {}", attempt))
                } else {
                    StreamError::ChannelClosed
                });
            }
            self.bus.subscribe(event_name, handler).await
        }
    }

    fn flaky_fixture(
        failures: u32,
        timeout: bool,
    ) -> (Arc<LocalEventBus>, Arc<FlakySource>, Transport) {
        let bus = Arc::new(LocalEventBus::new());
        let source = Arc::new(FlakySource {
            bus: bus.clone(),
            failures,
            timeout,
            attempts: Mutex::new(0),
        });
        let transport = Transport::new(
            source.clone(),
            Arc::new(RecordingInvoker::default()),
            bus.clone(),
        );
        (bus, source, transport)
    }

    fn with_commands() -> StreamConfig {
        StreamConfig {
            start_command: Some(StreamCommand::new("start")),
            stop_command: Some(StreamCommand::new("stop")),
            ..Default::default()
        }
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(vec![1.0, 2.0], vec![-50.0, -40.0], seq as f64).with_sequence(seq)
    }

    fn emitted_sequences(session: &EventStreamSession) -> Arc<Mutex<Vec<(u64, bool)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on_emit(move |frame, meta| {
            sink.lock().push((frame.sequence.unwrap_or_default(), meta.paused));
        });
        seen
    }

    #[tokio::test]
    async fn test_unavailable_source_never_subscribes() {
        let (bus, invoker, transport) = fixture(RecordingInvoker::default());
        bus.set_available(false);

        let session = EventStreamSession::start(with_commands(), transport, Vec::new()).await;

        assert_eq!(session.state(), StreamState::Unavailable);
        assert_eq!(bus.listener_count(EVENT), 0);
        assert!(invoker.calls().is_empty());
        assert!(session.status().error_message.is_none());
    }

    #[tokio::test]
    async fn test_loading_then_ready_before_first_emit() {
        let (bus, invoker, transport) = fixture(RecordingInvoker::default());
        let session = EventStreamSession::new(with_commands(), transport);

        let order = Arc::new(Mutex::new(Vec::new()));
        let events = order.clone();
        session.set_event_callback(move |event| {
            if let SessionEvent::StateChanged { state, .. } = event {
                events.lock().push(format!("{:?}", state));
            }
        });
        let emits = order.clone();
        session.on_emit(move |_, _| emits.lock().push("emit".to_string()));

        session.connect().await;
        assert_eq!(session.state(), StreamState::Loading);
        assert_eq!(invoker.calls(), vec!["start"]);
        assert_eq!(bus.listener_count(EVENT), 1);

        bus.emit(EVENT, frame(1));
        bus.emit(EVENT, frame(2));

        assert_eq!(session.state(), StreamState::Ready);
        assert_eq!(
            *order.lock(),
            vec!["Loading", "Ready", "emit", "emit"]
        );
    }

    #[tokio::test]
    async fn test_latest_tracks_every_frame_while_paused() {
        let (bus, _invoker, transport) = fixture(RecordingInvoker::default());
        let config = StreamConfig {
            paused: true,
            ..Default::default()
        };
        let session = EventStreamSession::start(config, transport, Vec::new()).await;
        let seen = emitted_sequences(&session);

        for seq in 1..=5 {
            bus.emit(EVENT, frame(seq));
        }

        assert_eq!(session.latest().unwrap().sequence, Some(5));
        assert!(seen.lock().is_empty());
        assert_eq!(session.state(), StreamState::Ready);

        let stats = session.stats();
        assert_eq!(stats.frames_received, 5);
        assert_eq!(stats.frames_paused, 5);
        assert_eq!(stats.frames_emitted, 0);

        session.set_paused(false);
        bus.emit(EVENT, frame(6));
        assert_eq!(*seen.lock(), vec![(6, false)]);
    }

    #[tokio::test]
    async fn test_emit_while_paused_marks_meta() {
        let (bus, _invoker, transport) = fixture(RecordingInvoker::default());
        let config = StreamConfig {
            paused: true,
            emit_while_paused: true,
            ..Default::default()
        };
        let session = EventStreamSession::start(config, transport, Vec::new()).await;
        let seen = emitted_sequences(&session);

        bus.emit(EVENT, frame(1));
        assert_eq!(*seen.lock(), vec![(1, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_limits_emission_but_not_latest() {
        let (bus, _invoker, transport) = fixture(RecordingInvoker::default());
        let config = StreamConfig {
            max_emit_hz: Some(10.0),
            ..Default::default()
        };
        let session = EventStreamSession::start(config, transport, Vec::new()).await;
        let seen = emitted_sequences(&session);

        // 50 frames, 20ms apart
        for seq in 0..50 {
            bus.emit(EVENT, frame(seq));
            tokio::time::advance(Duration::from_millis(20)).await;
        }

        let emitted: Vec<u64> = seen.lock().iter().map(|(seq, _)| *seq).collect();
        assert_eq!(emitted, vec![0, 5, 10, 15, 20, 25, 30, 35, 40, 45]);
        assert_eq!(session.latest().unwrap().sequence, Some(49));
        assert_eq!(session.stats().frames_throttled, 40);
    }

    #[tokio::test]
    async fn test_start_command_failure_releases_listener() {
        let (bus, invoker, transport) = fixture(RecordingInvoker::failing(&["start"]));
        let session = EventStreamSession::start(with_commands(), transport, Vec::new()).await;

        assert!(session.state().is_error());
        let message = session.status().error_message.unwrap();
        assert!(message.contains("start"), "unexpected message: {message}");
        assert_eq!(bus.listener_count(EVENT), 0);
        // Not a timeout, so no second attempt
        assert_eq!(invoker.calls(), vec!["start"]);
    }

    #[tokio::test]
    async fn test_stop_sends_stop_command_and_keeps_latest() {
        let (bus, invoker, transport) = fixture(RecordingInvoker::default());
        let session = EventStreamSession::start(with_commands(), transport, Vec::new()).await;
        bus.emit(EVENT, frame(7));

        session.stop().await;

        assert_eq!(session.state(), StreamState::Idle);
        assert_eq!(bus.listener_count(EVENT), 0);
        assert_eq!(invoker.calls(), vec!["start", "stop"]);
        assert_eq!(session.latest().unwrap().sequence, Some(7));

        // Frames after teardown are ignored
        assert_eq!(bus.emit(EVENT, frame(8)), 0);
        assert_eq!(session.latest().unwrap().sequence, Some(7));
    }

    #[tokio::test]
    async fn test_stop_command_failure_is_not_an_error_state() {
        let (bus, invoker, transport) = fixture(RecordingInvoker::failing(&["stop"]));
        let session = EventStreamSession::start(with_commands(), transport, Vec::new()).await;

        session.stop().await;

        assert_eq!(session.state(), StreamState::Idle);
        assert_eq!(bus.listener_count(EVENT), 0);
        assert_eq!(invoker.calls(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_retry_clears_latest_and_resubscribes() {
        let (bus, invoker, transport) = fixture(RecordingInvoker::default());
        let session = EventStreamSession::start(with_commands(), transport, Vec::new()).await;
        bus.emit(EVENT, frame(1));
        assert_eq!(session.state(), StreamState::Ready);

        session.retry().await;

        assert!(session.latest().is_none());
        assert_eq!(session.state(), StreamState::Loading);
        assert_eq!(bus.listener_count(EVENT), 1);
        assert_eq!(invoker.calls(), vec!["start", "stop", "start"]);

        bus.emit(EVENT, frame(2));
        assert_eq!(session.latest().unwrap().sequence, Some(2));
        assert_eq!(session.state(), StreamState::Ready);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_error() {
        let bus = Arc::new(LocalEventBus::new());
        let invoker = Arc::new(RecordingInvoker::failing(&["start"]));
        let session = EventStreamSession::start(
            with_commands(),
            Transport::from_bus(bus.clone(), invoker),
            Vec::new(),
        )
        .await;
        assert!(session.state().is_error());

        session
            .update_config(StreamConfig {
                start_command: None,
                ..with_commands()
            })
            .await;
        session.retry().await;

        assert_eq!(session.state(), StreamState::Loading);
        assert!(session.status().error_message.is_none());
        assert_eq!(bus.listener_count(EVENT), 1);
    }

    #[tokio::test]
    async fn test_enabled_edges_drive_lifecycle() {
        let (bus, invoker, transport) = fixture(RecordingInvoker::default());
        let session = EventStreamSession::new(
            StreamConfig {
                enabled: false,
                ..with_commands()
            },
            transport,
        );

        session.connect().await;
        assert_eq!(session.state(), StreamState::Idle);
        assert_eq!(bus.listener_count(EVENT), 0);

        session.set_enabled(true).await;
        assert_eq!(session.state(), StreamState::Loading);
        assert_eq!(bus.listener_count(EVENT), 1);

        session.set_enabled(false).await;
        assert_eq!(session.state(), StreamState::Idle);
        assert_eq!(bus.listener_count(EVENT), 0);
        assert_eq!(invoker.calls(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_event_name_change_resubscribes() {
        let (bus, _invoker, transport) = fixture(RecordingInvoker::default());
        let session = EventStreamSession::start(StreamConfig::default(), transport, Vec::new()).await;

        session
            .update_config(StreamConfig {
                event_name: "waterfall-frame".to_string(),
                ..Default::default()
            })
            .await;

        assert_eq!(bus.listener_count(EVENT), 0);
        assert_eq!(bus.listener_count("waterfall-frame"), 1);
    }

    #[tokio::test]
    async fn test_sinks_receive_frames_and_errors() {
        #[derive(Default)]
        struct CountingSink {
            frames: AtomicU64,
            errors: Mutex<Vec<String>>,
        }

        impl FrameSink for CountingSink {
            fn on_frame(&self, _frame: &Frame, _meta: &EmitMeta) {
                self.frames.fetch_add(1, Ordering::Relaxed);
            }

            fn on_error(&self, message: &str) {
                self.errors.lock().push(message.to_string());
            }
        }

        let sink = Arc::new(CountingSink::default());
        let (bus, _invoker, transport) = fixture(RecordingInvoker::default());
        let sinks: Vec<Arc<dyn FrameSink>> = vec![sink.clone()];
        let session = EventStreamSession::start(StreamConfig::default(), transport, sinks).await;
        bus.emit(EVENT, frame(1));
        bus.emit(EVENT, frame(2));
        assert_eq!(sink.frames.load(Ordering::Relaxed), 2);
        assert_eq!(session.stats().frames_emitted, 2);

        let failing = Arc::new(CountingSink::default());
        let (_bus, _invoker, transport) = fixture(RecordingInvoker::failing(&["start"]));
        let sinks: Vec<Arc<dyn FrameSink>> = vec![failing.clone()];
        let _failed = EventStreamSession::start(with_commands(), transport, sinks).await;
        assert_eq!(failing.errors.lock().len(), 1);
    }

    fn fixed_retry(max_attempts: u32) -> RetryOptions {
        RetryOptions {
            max_attempts,
            base_delay_ms: 100,
            backoff: Backoff::Fixed,
            jitter_ratio: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeouts_are_retried() {
        let (bus, source, transport) = flaky_fixture(2, true);
        let config = StreamConfig {
            setup_retry: fixed_retry(3),
            ..Default::default()
        };

        let session = EventStreamSession::start(config, transport, Vec::new()).await;

        assert_eq!(session.state(), StreamState::Loading);
        assert_eq!(bus.listener_count(EVENT), 1);
        assert_eq!(source.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_rejection_is_a_setup_error() {
        let (bus, source, transport) = flaky_fixture(1, false);
        let config = StreamConfig {
            setup_retry: fixed_retry(3),
            ..Default::default()
        };

        let session = EventStreamSession::start(config, transport, Vec::new()).await;

        assert!(session.state().is_error());
        let message = session.status().error_message.unwrap();
        assert!(message.starts_with("Setup failed"), "unexpected message: {message}");
        assert_eq!(bus.listener_count(EVENT), 0);
        // Only timeouts are retried
        assert_eq!(source.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_timeouts_report_last_error() {
        let (bus, source, transport) = flaky_fixture(10, true);
        let config = StreamConfig {
            setup_retry: fixed_retry(3),
            ..Default::default()
        };

        let session = EventStreamSession::start(config, transport, Vec::new()).await;

        assert_eq!(
            session.status().error_message.as_deref(),
            Some("Timeout: ipc attempt 3")
        );
        assert_eq!(bus.listener_count(EVENT), 0);
        assert_eq!(source.attempts(), 3);
    }

    #[tokio::test]
    async fn test_retry_probes_availability_again() {
        let (bus, invoker, transport) = fixture(RecordingInvoker::default());
        bus.set_available(false);
        let session = EventStreamSession::start(with_commands(), transport, Vec::new()).await;
        assert_eq!(session.state(), StreamState::Unavailable);

        bus.set_available(true);
        session.retry().await;

        assert_eq!(session.state(), StreamState::Loading);
        assert_eq!(bus.listener_count(EVENT), 1);
        // Nothing was started before, so nothing to stop
        assert_eq!(invoker.calls(), vec!["start"]);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes_and_sends_stop() {
        let (bus, invoker, transport) = fixture(RecordingInvoker::default());
        let session = EventStreamSession::start(with_commands(), transport, Vec::new()).await;
        assert_eq!(bus.listener_count(EVENT), 1);

        drop(session);
        assert_eq!(bus.listener_count(EVENT), 0);

        // Stop command runs on a spawned task
        tokio::task::yield_now().await;
        assert_eq!(invoker.calls(), vec!["start", "stop"]);
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config: StreamConfig = serde_json::from_str("{}").unwrap();
        assert!(config.enabled);
        assert_eq!(config.event_name, "spectrum-frame");
        assert_eq!(config.setup_retry.max_attempts, 3);
        assert!(config.validate().is_ok());

        let bad = StreamConfig {
            event_name: "  ".to_string(),
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(StreamError::InvalidConfig(_))));
    }
}
