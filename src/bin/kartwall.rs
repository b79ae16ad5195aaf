use anyhow::{Context, bail};
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use kartwall::transports::ReplayTransport;
use kartwall::{ConnectionState, Kartwall, KartwallConfig, LapStats};

#[derive(Parser)]
#[command(name = "kartwall")]
#[command(about = "Record laps from a karting circuit's live timing feed")]
#[command(version)]
struct Cli {
    /// Circuit id to connect to
    circuit: String,

    /// YAML configuration file
    #[arg(long, short, env = "KARTWALL_CONFIG")]
    config: Option<PathBuf>,

    /// Feed URL template, with {circuit} where the circuit id goes
    #[arg(long, env = "KARTWALL_URL_TEMPLATE")]
    url_template: Option<String>,

    /// Replay a recorded feed (one JSON message per line) instead of connecting live
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Seconds between replayed messages
    #[arg(long, default_value_t = 1.0, requires = "replay")]
    frame_interval: f64,

    /// Replay speed multiplier
    #[arg(long, default_value_t = 1.0, requires = "replay")]
    speed: f64,

    /// Log filter, e.g. `info` or `kartwall=debug`; RUST_LOG wins when set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => KartwallConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => KartwallConfig::default(),
    };
    if let Some(template) = cli.url_template {
        config.feed.url_template = template;
    }

    let mut builder = Kartwall::builder(config);
    if let Some(path) = &cli.replay {
        if !(cli.frame_interval > 0.0 && cli.speed > 0.0) {
            bail!("--frame-interval and --speed must be positive");
        }
        let replay = ReplayTransport::new(path, Duration::from_secs_f64(cli.frame_interval)).with_speed(cli.speed);
        builder = builder.transport(Arc::new(replay));
    }
    let kartwall = builder.build().await.context("starting engine")?;

    let session = kartwall.start_session(&cli.circuit).await.context("starting session")?;
    println!("Session {} started", session.id);
    kartwall.enable_lap_detection(true);

    if !kartwall.connect(&cli.circuit).await {
        let reason = kartwall.connection().last_error().unwrap_or_else(|| "unknown error".to_string());
        bail!("cannot connect to circuit {}: {reason}", cli.circuit);
    }

    let mut laps = kartwall.lap_events();
    let mut states = kartwall.connection().state_updates();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            lap = laps.recv() => match lap {
                Ok(lap) => {
                    println!("kart {:>4}  lap {:>3}  {}", lap.kart_id, lap.lap_number, lap.lap_time);
                    if let Ok(LapStats::Ready(window)) = kartwall.get_last10_laps_stats(&lap.kart_id).await {
                        println!(
                            "           last {}: best {}  avg {}  worst {}",
                            window.lap_numbers.len(),
                            window.best,
                            window.average,
                            window.worst
                        );
                    }
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Lap printer lagging"),
                Err(RecvError::Closed) => break,
            },
            Some(state) = states.next() => {
                if state == ConnectionState::Disconnected {
                    tracing::warn!("Feed gave up; stopping");
                    break;
                }
            }
        }
    }

    kartwall.disconnect().await;
    kartwall.stop_session().await.context("stopping session")?;

    let export = kartwall.export_session_data().await.context("exporting session")?;
    println!("Session {}: {} laps from {} karts", export.session.id, export.laps.len(), export.karts.len());
    if let Ok(statistics) = kartwall.get_session_statistics().await
        && let Some(best) = statistics.best_lap
    {
        println!("Best lap: kart {} {}", best.kart_id, best.lap_time);
    }
    Ok(())
}
