use anyhow::Context;
use clap::{Parser, ValueEnum};
use pedalcore::pairing::{InMemoryRelay, SignalingRelay};
use pedalcore::{CameraLayout, Gear};
use relay::client::HttpRelay;
use relay::server::{relay_bind_address, RelayServer};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Builder as TokioBuilder;
use tokio::signal;
use workflow::config::WorkflowConfig;
use workflow::runner::Runner;

mod generator;
mod relay;
mod video;
mod workflow;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LayoutArg {
    Side,
    Front,
    Manual,
}

impl From<LayoutArg> for CameraLayout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Side => CameraLayout::Side,
            LayoutArg::Front => CameraLayout::Front,
            LayoutArg::Manual => CameraLayout::Manual,
        }
    }
}

#[derive(Parser)]
#[command(author, version, about = "Synthetic ride driver and signaling relay for PedalSight")]
struct Args {
    /// Ride the synthetic camera offline and print a summary
    #[arg(long, default_value_t = false)]
    ride: bool,
    /// Load a workflow config from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    #[arg(long, default_value_t = 60.0)]
    cadence_rpm: f32,
    #[arg(long, default_value_t = 20.0)]
    duration_secs: f32,
    #[arg(long, value_enum, default_value_t = LayoutArg::Side)]
    layout: LayoutArg,
    /// Resistance level 1-3
    #[arg(long, default_value_t = 2)]
    gear: u8,
    /// Print the per-second cadence and velocity trace
    #[arg(long, default_value_t = false)]
    trace: bool,
    /// Append a one-line ride report to this file
    #[arg(long)]
    report: Option<PathBuf>,
    /// Pair a loopback phone camera in mid-ride and mirror state over the relay
    #[arg(long, default_value_t = false)]
    pair_demo: bool,
    /// Relay used by the pairing demo; in-process when omitted
    #[arg(long)]
    relay_url: Option<String>,
    /// Keep the signaling relay running on 127.0.0.1:9000
    #[arg(long, default_value_t = false)]
    serve: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let workflow_config = if let Some(path) = args.workflow.as_ref() {
        WorkflowConfig::load(path)?
    } else {
        let gear = Gear::from_level(args.gear).context("parsing --gear")?;
        WorkflowConfig::from_args(args.cadence_rpm, args.duration_secs, args.layout.into(), gear)
    };
    let runner = Runner::new(workflow_config);

    if args.ride {
        let report = runner.execute()?;
        let summary = &report.summary;
        println!(
            "Offline ride -> {:.2} km in {:.1} s, avg {:.1} km/h, max {:.1} km/h, avg {:.0} rpm, ~{:.0} W (estimate)",
            summary.distance_km,
            summary.elapsed_ms as f64 / 1_000.0,
            summary.average_velocity_kmh,
            summary.max_velocity_kmh,
            summary.average_rpm,
            summary.estimated_average_watts
        );
        if args.trace {
            for point in &report.trace {
                println!(
                    "  t={:>6.1}s rpm={:>5.1} v={:>5.1} km/h rate={:.2}x",
                    point.t_ms / 1_000.0,
                    point.rpm,
                    point.velocity_kmh,
                    point.playback_rate
                );
            }
        }
        if let Some(report_path) = args.report.as_ref() {
            let line = serde_json::to_string(&report).context("serializing ride report")?;
            if let Some(parent) = report_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(report_path)
                .with_context(|| format!("opening report {}", report_path.display()))?;
            writeln!(file, "{}", line)?;
        }
    }

    if args.pair_demo || args.serve {
        let runtime = TokioBuilder::new_multi_thread()
            .enable_all()
            .build()
            .context("creating runtime for relay and pairing")?;
        runtime.block_on(async {
            if args.serve {
                RelayServer::new().spawn(relay_bind_address())?;
            }
            if args.pair_demo {
                let relay: Arc<dyn SignalingRelay> = match args.relay_url.as_ref() {
                    Some(url) => Arc::new(HttpRelay::new(url.clone(), Duration::from_millis(200))?),
                    None if args.serve => Arc::new(HttpRelay::new(
                        format!("http://{}", relay_bind_address()),
                        Duration::from_millis(200),
                    )?),
                    None => Arc::new(InMemoryRelay::new()),
                };
                let report = runner.execute_paired(relay).await?;
                println!(
                    "Paired ride {} -> remote camera {}, pairing {}, {:.2} km, {} pedal events, {} broadcasts ({} failed)",
                    report.code,
                    if report.remote_bound { "bound" } else { "not bound" },
                    report.pairing_state,
                    report.summary.distance_km,
                    report.summary.pedal_events,
                    report.metrics.broadcasts_sent,
                    report.metrics.broadcast_failures
                );
            }
            if args.serve {
                println!("Signaling relay running on http://{} (Ctrl+C to stop)...", relay_bind_address());
                signal::ctrl_c().await.context("awaiting Ctrl+C to exit")?;
            }
            Ok::<(), anyhow::Error>(())
        })?;
    }

    Ok(())
}
