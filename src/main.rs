use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camstream::events::EventBus;
use camstream::video::format::Resolution;
use camstream::video::pipeline::StreamConfig;
use camstream::video::supervisor::SessionSupervisor;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// camstream command line arguments
#[derive(Parser, Debug)]
#[command(name = "camstream")]
#[command(version, about = "Capture a local camera and publish it over RTSP", long_about = None)]
struct CliArgs {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe device indices 0..5 and list the cameras found
    Probe {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the preview pipeline, emitting composited frames as events
    Preview {
        /// Camera index (/dev/video{N})
        #[arg(short = 'c', long, default_value_t = 0)]
        camera: u32,

        /// Capture resolution (WxH, from the preset list)
        #[arg(short = 'r', long, default_value = "640x480")]
        resolution: Resolution,

        /// Frame rate (10, 15, 20, 25 or 30)
        #[arg(short = 'f', long, default_value_t = 25)]
        fps: u32,

        /// Viewport size the frames are composited for
        #[arg(long, default_value = "1280x720")]
        viewport: Resolution,

        /// Stop after this many seconds (default: run until Ctrl-C)
        #[arg(long, value_name = "SECS")]
        duration: Option<u64>,
    },
    /// Capture, encode and publish to an RTSP ingest URL
    Stream {
        /// Camera index (/dev/video{N})
        #[arg(short = 'c', long, default_value_t = 0)]
        camera: u32,

        /// RTSP ingest URL (e.g. rtsp://host:8554/cam)
        #[arg(short = 'u', long, value_name = "URL")]
        url: String,

        /// Capture resolution (WxH, from the preset list)
        #[arg(short = 'r', long, default_value = "1280x720")]
        resolution: Resolution,

        /// Frame rate (10, 15, 20, 25 or 30)
        #[arg(short = 'f', long, default_value_t = 25)]
        fps: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camstream v{}", env!("CARGO_PKG_VERSION"));

    let bus = Arc::new(EventBus::new());
    let supervisor = SessionSupervisor::new(bus.clone());

    match args.command {
        Command::Probe { json } => {
            let cameras = supervisor.refresh_devices().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&cameras)?);
            } else if cameras.is_empty() {
                println!("No cameras found");
            } else {
                for cam in &cameras {
                    println!(
                        "index {}: /dev/video{} ({}x{})",
                        cam.index, cam.index, cam.probed_width, cam.probed_height
                    );
                }
            }
        }

        Command::Preview {
            camera,
            resolution,
            fps,
            viewport,
            duration,
        } => {
            let config = StreamConfig {
                camera_index: camera,
                resolution,
                fps,
                sink_url: String::new(),
            };

            let printer = spawn_event_printer(bus.clone());
            supervisor
                .start_preview(config, (viewport.width, viewport.height))
                .await?;
            wait_for_exit(duration).await;
            supervisor.shutdown().await;
            printer.abort();
        }

        Command::Stream {
            camera,
            url,
            resolution,
            fps,
        } => {
            let config = StreamConfig {
                camera_index: camera,
                resolution,
                fps,
                sink_url: url,
            };

            let printer = spawn_event_printer(bus.clone());
            supervisor.start_stream(config).await?;
            wait_for_exit(None).await;
            supervisor.shutdown().await;
            printer.abort();
        }
    }

    Ok(())
}

/// Subscribe to the bus and print every event as a JSON line.
///
/// Stands in for a rendering surface: `FrameReady` events are summarized
/// by their dimensions, everything else prints in full.
fn spawn_event_printer(bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event printer lagged, {} events dropped", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Block until Ctrl-C, or until the optional duration elapses.
async fn wait_for_exit(duration: Option<u64>) {
    match duration {
        Some(secs) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                    tracing::info!("Duration elapsed")
                }
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
            } else {
                tracing::info!("Interrupted");
            }
        }
    }
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "camstream=error",
        LogLevel::Warn => "camstream=warn",
        LogLevel::Info => "camstream=info",
        LogLevel::Debug => "camstream=debug",
        LogLevel::Trace => "camstream=trace",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
