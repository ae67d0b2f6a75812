// Simulated spectrum producer
//
// Publishes synthetic spectra onto a `LocalEventBus` while running. The
// producer is driven purely by side-commands, the same way a hardware
// analyzer is told to start and stop sweeping:
// - start command: spawn the sweep loop (no-op if already running)
// - stop command: cancel the sweep loop
//
// Useful for:
// - Exercising the pipeline without hardware
// - Demo and development

use super::{CommandInvoker, Frame, LocalEventBus};
use crate::streaming::types::{StreamError, StreamResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulatorConfig {
    #[serde(default = "default_event_name")]
    pub event_name: String,
    #[serde(default = "default_bins")]
    pub bins: usize,
    #[serde(default = "default_start_hz")]
    pub start_hz: f64,
    #[serde(default = "default_stop_hz")]
    pub stop_hz: f64,
    /// Delay between frames in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_noise_floor_dbm")]
    pub noise_floor_dbm: f64,
    #[serde(default = "default_peak_dbm")]
    pub peak_dbm: f64,
    /// Gaussian width of the simulated carrier, in bins
    #[serde(default = "default_peak_width_bins")]
    pub peak_width_bins: f64,
    /// Attach precomputed peak/average fields, like hardware that reports them
    #[serde(default)]
    pub include_summary: bool,
    #[serde(default = "default_start_command")]
    pub start_command: String,
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
}

fn default_event_name() -> String {
    "spectrum-frame".to_string()
}
fn default_bins() -> usize {
    512
}
fn default_start_hz() -> f64 {
    2.400e9
}
fn default_stop_hz() -> f64 {
    2.500e9
}
fn default_interval_ms() -> u64 {
    50
}
fn default_noise_floor_dbm() -> f64 {
    -95.0
}
fn default_peak_dbm() -> f64 {
    -20.0
}
fn default_peak_width_bins() -> f64 {
    4.0
}
fn default_start_command() -> String {
    "start_spectrum_simulation".to_string()
}
fn default_stop_command() -> String {
    "stop_spectrum_simulation".to_string()
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            event_name: default_event_name(),
            bins: default_bins(),
            start_hz: default_start_hz(),
            stop_hz: default_stop_hz(),
            interval_ms: default_interval_ms(),
            noise_floor_dbm: default_noise_floor_dbm(),
            peak_dbm: default_peak_dbm(),
            peak_width_bins: default_peak_width_bins(),
            include_summary: false,
            start_command: default_start_command(),
            stop_command: default_stop_command(),
        }
    }
}

pub struct SpectrumSimulator {
    bus: Arc<LocalEventBus>,
    config: SimulatorConfig,
    running: Mutex<Option<CancellationToken>>,
}

impl SpectrumSimulator {
    pub fn new(bus: Arc<LocalEventBus>, config: SimulatorConfig) -> Self {
        Self {
            bus,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the sweep loop on the current tokio runtime
    pub fn start(&self) -> StreamResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(()); // Already running
        }

        if self.config.bins == 0 {
            return Err(StreamError::InvalidConfig(
                "simulator needs at least one bin".to_string(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| StreamError::Command {
            command: self.config.start_command.clone(),
            message: format!("no async runtime: {}", e),
        })?;

        let token = CancellationToken::new();
        let cancel = token.clone();
        let bus = Arc::clone(&self.bus);
        let config = self.config.clone();

        runtime.spawn(async move {
            let mut rng = StdRng::from_rng(&mut rand::rng());
            let mut center_bin = config.bins as f64 / 2.0;
            let mut sequence = 0u64;

            log::info!(
                "Spectrum simulation started: {} bins every {} ms",
                config.bins,
                config.interval_ms
            );

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    _ = sleep(Duration::from_millis(config.interval_ms)) => {
                        // Slow drift of the carrier
                        center_bin += rng.random_range(-0.5..=0.5);
                        center_bin = center_bin.clamp(0.0, (config.bins - 1) as f64);

                        let frame = generate_frame(&config, center_bin, sequence, &mut rng);
                        sequence += 1;

                        let delivered = bus.emit(&config.event_name, frame);
                        log::trace!("Simulated frame {} delivered to {} listeners", sequence, delivered);
                    }
                }
            }

            log::info!("Spectrum simulation stopped after {} frames", sequence);
        });

        *running = Some(token);
        Ok(())
    }

    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for SpectrumSimulator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
impl CommandInvoker for SpectrumSimulator {
    async fn invoke(&self, command: &str, _args: Option<serde_json::Value>) -> StreamResult<()> {
        if command == self.config.start_command {
            self.start()
        } else if command == self.config.stop_command {
            self.stop();
            Ok(())
        } else {
            Err(StreamError::Command {
                command: command.to_string(),
                message: "unknown command".to_string(),
            })
        }
    }
}

/// Build one noisy spectrum with a gaussian carrier at `center_bin`
pub(crate) fn generate_frame<R: Rng>(
    config: &SimulatorConfig,
    center_bin: f64,
    sequence: u64,
    rng: &mut R,
) -> Frame {
    let bins = config.bins;
    let step = if bins > 1 {
        (config.stop_hz - config.start_hz) / (bins - 1) as f64
    } else {
        0.0
    };
    let width = config.peak_width_bins.max(f64::EPSILON);
    let rise = config.peak_dbm - config.noise_floor_dbm;

    let domain: Vec<f64> = (0..bins).map(|i| config.start_hz + i as f64 * step).collect();
    let values: Vec<f64> = (0..bins)
        .map(|i| {
            let offset = i as f64 - center_bin;
            let carrier = rise * (-(offset * offset) / (2.0 * width * width)).exp();
            config.noise_floor_dbm + carrier + rng.random_range(-1.5..=1.5)
        })
        .collect();

    let timestamp = chrono::Utc::now().timestamp_millis() as f64;
    let mut frame = Frame::new(domain, values, timestamp).with_sequence(sequence);

    if config.include_summary {
        let stats = crate::streaming::statistics::reduce(&frame);
        frame = frame.with_summary(stats.peak_domain, stats.peak_value, stats.average_value);
    }

    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::source::{EventSource, FrameHandler};

    fn small_config() -> SimulatorConfig {
        SimulatorConfig {
            bins: 64,
            start_hz: 0.0,
            stop_hz: 6300.0,
            interval_ms: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_generated_frame_shape_and_peak() {
        let config = small_config();
        let mut rng = StdRng::seed_from_u64(42);
        let frame = generate_frame(&config, 20.0, 3, &mut rng);

        assert!(frame.is_well_formed());
        assert_eq!(frame.len(), 64);
        assert_eq!(frame.sequence, Some(3));
        assert_eq!(frame.domain[1], 100.0);

        let peak_index = frame
            .values
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert!((18..=22).contains(&peak_index));
    }

    #[test]
    fn test_summary_is_attached_when_configured() {
        let config = SimulatorConfig {
            include_summary: true,
            ..small_config()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let frame = generate_frame(&config, 32.0, 0, &mut rng);
        assert!(frame.peak_value.is_some());
        assert!(frame.average_value.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_commands_drive_emission() {
        let bus = Arc::new(LocalEventBus::new());
        let sim = SpectrumSimulator::new(bus.clone(), small_config());

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = count.clone();
        let handler: FrameHandler = Arc::new(move |_: Frame| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        let _sub = bus.subscribe("spectrum-frame", handler).await.unwrap();

        sim.invoke("start_spectrum_simulation", None).await.unwrap();
        assert!(sim.is_running());
        tokio::time::sleep(Duration::from_millis(55)).await;

        sim.invoke("stop_spectrum_simulation", None).await.unwrap();
        assert!(!sim.is_running());
        tokio::task::yield_now().await;

        let seen = count.load(std::sync::atomic::Ordering::SeqCst);
        assert!(seen >= 4, "expected frames, got {}", seen);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_unknown_command_is_rejected() {
        let sim = SpectrumSimulator::new(Arc::new(LocalEventBus::new()), small_config());
        let err = sim.invoke("self_destruct", None).await.unwrap_err();
        assert!(matches!(err, StreamError::Command { .. }));
    }
}
