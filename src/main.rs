use clap::Parser;
use sndsync::audio_sink::{list_output_devices, CpalConfig};
use sndsync::bridge::AdbBridge;
use sndsync::error::ErrorKind;
use sndsync::observer::{LogObserver, SessionObserver};
use sndsync::session::{CpalSinkFactory, MetadataSinkFactory, Session, SinkFactory};
use sndsync::{SessionConfig, SessionError, StreamMode};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sndsync")]
#[command(about = "Stream audio or now-playing metadata from an Android device over adb")]
#[command(long_about = "
Deploys a small audio server to an Android device, tunnels its port over adb
and plays the captured PCM on a local output device. With --metadata it
instead prints the media session updates published by the companion app.

EXAMPLES:
  # Play audio from the only attached device
  sndsync

  # Pick a device and an output
  sndsync --serial emulator-5554 --output-device \"USB Audio\"

  # Follow now-playing updates and keep the album art
  sndsync --metadata --artwork /tmp/cover.png
")]
struct Args {
    /// Device serial, required when more than one device is attached
    #[arg(short, long)]
    serial: Option<String>,

    /// Tunnel port (default: 9999 for audio, 9998 for metadata)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Stream metadata events instead of audio
    #[arg(short, long)]
    metadata: bool,

    /// Local server artifact pushed to the device
    #[arg(long, default_value = sndsync::config::DEFAULT_ARTIFACT)]
    artifact: PathBuf,

    /// adb executable
    #[arg(long, default_value = "adb")]
    adb: String,

    /// Output device name for audio playback
    #[arg(long)]
    output_device: Option<String>,

    /// Give up when the device sends nothing for this many seconds
    #[arg(long)]
    read_timeout: Option<f64>,

    /// Connect timeout in seconds
    #[arg(long, default_value = "5")]
    connect_timeout: f64,

    /// Write the latest album art to this file (metadata mode)
    #[arg(long)]
    artwork: Option<PathBuf>,

    /// List available output devices and exit
    #[arg(long)]
    list_devices: bool,
}

impl Args {
    fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let mut config = if self.metadata {
            SessionConfig::metadata()
        } else {
            SessionConfig::audio()
        };
        config.device_serial = self.serial.clone();
        config.adb_program = self.adb.clone();
        if let Some(port) = self.port {
            config.port = port;
        }
        config.artifact_path = self.artifact.clone();
        config.output_device = self.output_device.clone();
        config.read_timeout = self.read_timeout.map(seconds).transpose()?;
        config.connect_timeout = seconds(self.connect_timeout)?;
        config.artwork_path = self.artwork.clone();
        config.validate()?;
        Ok(config)
    }
}

fn seconds(value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| anyhow::anyhow!("invalid duration {}: {}", value, e))
}

fn init_logging(debug: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.format_timestamp_millis().init();
}

fn list_devices() -> anyhow::Result<()> {
    println!("🔊 Output devices:");
    for device in list_output_devices()? {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("  {}{}", device.name, marker);
        for (format, channels, min_rate, max_rate) in &device.configs {
            println!(
                "      {} {} ch, {}-{} Hz",
                format, channels, min_rate, max_rate
            );
        }
    }
    Ok(())
}

/// Cancel the session on Ctrl+C or SIGTERM.
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => log::info!("🛑 Interrupted"),
                        _ = term.recv() => log::info!("🛑 Terminated"),
                        _ = cancel.cancelled() => return,
                    }
                }
                Err(e) => {
                    log::warn!("Could not install SIGTERM handler: {}", e);
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => log::info!("🛑 Interrupted"),
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("🛑 Interrupted"),
                _ = cancel.cancelled() => return,
            }
        }
        cancel.cancel();
    });
}

fn hint(error: &SessionError) -> Option<&'static str> {
    match error.kind() {
        ErrorKind::DependencyMissing => Some("Install the Android platform tools or pass --adb"),
        ErrorKind::DeviceUnavailable => {
            Some("Check the USB cable, accept the debugging prompt, or pass --serial")
        }
        ErrorKind::ArtifactMissing => Some("Build the server or point --artifact at it"),
        ErrorKind::ConnectFailed | ErrorKind::HeaderTruncated => {
            Some("Make sure the server is running on the device")
        }
        ErrorKind::SinkError => Some("Run with --list-devices to see usable outputs"),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    if args.list_devices {
        return match list_devices() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                log::error!("❌ {:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    let config = match args.session_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("❌ {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    log::info!("🚀 Starting sndsync ({} mode, port {})", config.mode, config.port);

    let observer: Arc<dyn SessionObserver> = Arc::new(LogObserver);
    let bridge = Arc::new(AdbBridge::new(
        config.adb_program.clone(),
        config.device_serial.clone(),
    ));
    let sinks: Box<dyn SinkFactory> = match config.mode {
        StreamMode::Audio => Box::new(CpalSinkFactory::new(
            CpalConfig {
                device_name: config.output_device.clone(),
                progress_interval: config.progress_interval,
                ..Default::default()
            },
            observer.clone(),
        )),
        StreamMode::Metadata => Box::new(MetadataSinkFactory::new(
            config.artwork_path.clone(),
            observer.clone(),
        )),
    };

    let session = Session::new(config, bridge, sinks, observer);
    spawn_signal_listener(session.cancellation_token());

    match session.run().await {
        Ok(summary) if summary.reason.is_clean() => ExitCode::SUCCESS,
        Ok(summary) => {
            log::error!("❌ Stream ended abnormally: {}", summary.reason);
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("❌ [{}] {}", e.kind(), e);
            if let Some(hint) = hint(&e) {
                log::error!("   {}", hint);
            }
            ExitCode::FAILURE
        }
    }
}
