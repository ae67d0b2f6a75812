use anyhow::Context;
use clap::Parser;
use spectrum_stream::streaming::{
    EventStreamSession, LocalEventBus, SessionEvent, SpectrumAnalyzer, SpectrumSimulator, Transport,
};
use spectrum_stream::PipelineConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration};

#[derive(Parser)]
#[command(
    name = "spectrum-stream",
    version,
    about = "Stream simulated spectrum frames through the analysis pipeline"
)]
struct Cli {
    /// Pipeline configuration (JSON)
    #[arg(long, env = "SPECTRUM_STREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Override run duration in seconds (0 runs until Ctrl-C)
    #[arg(long)]
    run_seconds: Option<u64>,

    /// Override the maximum emission rate in Hz
    #[arg(long)]
    max_emit_hz: Option<f64>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(seconds) = cli.run_seconds {
        config.run_seconds = (seconds > 0).then_some(seconds);
    }
    if let Some(hz) = cli.max_emit_hz {
        config.stream.max_emit_hz = Some(hz);
    }
    config.validate().context("invalid pipeline configuration")?;

    let bus = Arc::new(LocalEventBus::new());
    let simulator = Arc::new(SpectrumSimulator::new(bus.clone(), config.simulator.clone()));
    let transport = Transport::from_bus(bus, simulator.clone());
    let analyzer = Arc::new(SpectrumAnalyzer::new(config.analyzer.clone()));

    let session = EventStreamSession::new(config.stream.clone(), transport);
    session.add_sink(analyzer.clone());
    session.set_event_callback(|event| match event {
        SessionEvent::StateChanged { session_id, state } => {
            log::info!("Session {} is now {:?}", session_id, state);
        }
        SessionEvent::Error { session_id, error } => {
            log::error!("Session {} failed: {}", session_id, error);
        }
    });
    session.connect().await;

    let deadline = async {
        match config.run_seconds {
            Some(seconds) => sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    let mut report = interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl-C")?;
                log::info!("Interrupted");
                break;
            }
            _ = report.tick() => {
                let stats = session.stats();
                match analyzer.statistics() {
                    Some(s) => println!(
                        "[{:?}] peak {:.3} MHz @ {:.1} dBm, mean {:.1} dBm, bw {:.1} kHz | emitted {} / received {}",
                        session.state(),
                        s.peak_domain / 1e6,
                        s.peak_value,
                        s.average_value,
                        s.bandwidth / 1e3,
                        stats.frames_emitted,
                        stats.frames_received,
                    ),
                    None => println!("[{:?}] waiting for frames", session.state()),
                }
            }
        }
    }

    let failure = session.status().error_message;
    session.stop().await;

    let snapshot = analyzer.snapshot();
    println!(
        "Analyzed {} frames, {} waterfall rows, average over {} frames",
        snapshot.frames_analyzed,
        snapshot.waterfall.len(),
        snapshot.average_count
    );
    if let Some(error) = failure {
        anyhow::bail!("stream ended in error: {}", error);
    }
    Ok(())
}
