use anyhow::Context;
use clap::Parser;
use cpal::traits::{DeviceTrait, HostTrait};
use sdr_remote::audio_sink::{CpalConfig, CpalOutput, SinkCallback, SinkStats};
use sdr_remote::buffer_queue;
use sdr_remote::client::{Client, ClientHandle, SessionConfig};
use sdr_remote::commands::{Command, Mode};
use sdr_remote::config::ClientConfig;
use sdr_remote::connection::ConnectionState;
use sdr_remote::console::{self, ConsoleCommand};
use sdr_remote::recorder::WavRecorder;
use sdr_remote::tuner::{self, Band, StationLog, TuningState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "sdr-remote")]
#[command(about = "Remote control and audio client for a WebSocket SDR receiver")]
#[command(long_about = "
Connects to an SDR receiver over WebSocket, plays the demodulated audio and
sends tuning commands typed on stdin. Settings come from SDR_* environment
variables (or a .env file); flags override them.

EXAMPLES:
  # Connect right away and tune
  sdr-remote --connect --endpoint ws://raspberrypi:8080 --frequency 101.1

  # Record what is played
  sdr-remote --connect --record capture.wav
")]
struct Args {
    /// Receiver endpoint, ws://host:port or wss://host:port
    #[arg(long)]
    endpoint: Option<String>,

    /// Connect on startup instead of waiting for 'connect'
    #[arg(long)]
    connect: bool,

    /// Initial frequency in MHz, sent when a connection opens
    #[arg(long)]
    frequency: Option<f64>,

    /// Samples per audio buffer
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Buffers allowed to wait for playback
    #[arg(long)]
    max_queued: Option<usize>,

    /// Output sample rate of the stream
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Output device name
    #[arg(long)]
    output_device: Option<String>,

    /// Write received audio to this WAV file
    #[arg(long)]
    record: Option<PathBuf>,

    /// List available output devices and exit
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        return list_output_devices();
    }

    let config = apply_args(ClientConfig::load()?, &args)?;
    log::info!("Starting sdr-remote ({:?})", config);

    let (writer, reader) = buffer_queue::channel(config.buffer_size, config.max_queued_buffers);
    let callback = SinkCallback::new(reader);
    let sink_stats = callback.stats();
    let sink_config = CpalConfig {
        device_name: config.output_device.clone(),
        sample_rate: config.output_sample_rate,
        buffer_frames: config.buffer_size as u32,
    };
    // Keep running without a device; the session still drives the receiver
    let output = match CpalOutput::start(sink_config, callback) {
        Ok(output) => Some(output),
        Err(e) => {
            log::warn!("No audio output, continuing without playback: {}", e);
            None
        }
    };

    let recorder = match &config.record_path {
        Some(path) => Some(
            WavRecorder::create(path, config.output_sample_rate)
                .with_context(|| format!("Failed to create recording {}", path.display()))?,
        ),
        None => None,
    };

    let client = Client::spawn(
        SessionConfig {
            initial_frequency_hz: config.initial_frequency_hz,
        },
        writer,
        recorder,
    );
    let handle = client.handle();

    if args.connect {
        if let Err(e) = handle.connect(&config.endpoint).await {
            eprintln!("Connect failed: {}", e);
        }
    }

    println!("sdr-remote ready, type 'help' for commands");
    let mut console = Console {
        handle: handle.clone(),
        config: &config,
        sink_stats,
        tuning: TuningState::new(),
        stations: StationLog::new(),
        mode: Mode::Fm,
        last_underruns: 0,
        last_dropped: 0,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status_rx = handle.subscribe_status();
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.tick().await;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !console.execute(&line).await {
                        break;
                    }
                }
                Ok(None) => {
                    log::info!("stdin closed, shutting down");
                    break;
                }
                Err(e) => {
                    log::error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let update = status_rx.borrow_and_update().clone();
                if let Some(update) = update {
                    console.observe(&update.record);
                }
            }
            _ = stats_tick.tick() => console.log_stats(),
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    client.shutdown().await?;
    drop(output);
    println!("Goodbye!");
    Ok(())
}

fn apply_args(mut config: ClientConfig, args: &Args) -> anyhow::Result<ClientConfig> {
    if let Some(endpoint) = &args.endpoint {
        config.endpoint = endpoint.clone();
    }
    if let Some(mhz) = args.frequency {
        let hz = tuner_hz(mhz).context("--frequency must be a positive number of MHz")?;
        config.initial_frequency_hz = hz;
    }
    if let Some(size) = args.buffer_size {
        config.buffer_size = size;
    }
    if let Some(max) = args.max_queued {
        config.max_queued_buffers = max;
    }
    if let Some(rate) = args.sample_rate {
        config.output_sample_rate = rate;
    }
    if args.output_device.is_some() {
        config.output_device = args.output_device.clone();
    }
    if args.record.is_some() {
        config.record_path = args.record.clone();
    }
    config.validate()?;
    Ok(config)
}

fn tuner_hz(mhz: f64) -> Option<u64> {
    sdr_remote::commands::scaled_hz(&mhz.to_string(), 1e6)
        .ok()
        .filter(|&hz| hz > 0)
}

struct Console<'a> {
    handle: ClientHandle,
    config: &'a ClientConfig,
    sink_stats: Arc<SinkStats>,
    tuning: TuningState,
    stations: StationLog,
    mode: Mode,
    last_underruns: u64,
    last_dropped: u64,
}

impl Console<'_> {
    /// Returns false when the user asked to quit.
    async fn execute(&mut self, line: &str) -> bool {
        let command = match console::parse_line(line) {
            Ok(Some(command)) => command,
            Ok(None) => return true,
            Err(e) => {
                println!("{}", e);
                return true;
            }
        };

        let result = match command {
            ConsoleCommand::Connect(endpoint) => {
                let endpoint = endpoint.as_deref().unwrap_or(&self.config.endpoint);
                self.handle.connect(endpoint).await
            }
            ConsoleCommand::Disconnect => self.handle.disconnect().await,
            ConsoleCommand::Tune(None) => Ok(()),
            ConsoleCommand::Tune(Some(hz)) => {
                let band = Band::for_mode(self.mode);
                if let Some(band) = band.filter(|band| !band.contains(hz)) {
                    println!(
                        "{} Hz is outside the {} band ({}-{} Hz), tuning to the nearest channel",
                        hz, self.mode, band.min_hz, band.max_hz
                    );
                }
                match self.tuning.tune(hz, band) {
                    Some(command) => self.handle.send(command).await,
                    None => Ok(()),
                }
            }
            ConsoleCommand::Send(command) => {
                if let Command::SetMode(mode) = command {
                    self.mode = mode;
                }
                if let Command::SetSampleRate(hz) = command {
                    if !tuner::is_supported_sample_rate(hz) {
                        println!("Warning: the receiver may not support {} Hz", hz);
                    }
                }
                self.handle.send(command).await
            }
            ConsoleCommand::Status => {
                self.print_status();
                Ok(())
            }
            ConsoleCommand::Help => {
                println!("{}", console::HELP);
                Ok(())
            }
            ConsoleCommand::Quit => return false,
        };

        if let Err(e) = result {
            println!("{}", e);
        }
        true
    }

    fn observe(&mut self, record: &sdr_remote::protocol::StatusRecord) {
        self.tuning.follow(record);
        if let Ok(mode) = record.mode.parse::<Mode>() {
            self.mode = mode;
        }
        if let Some(station) = self.stations.observe(record) {
            println!("Found station at {:.3} MHz", station as f64 / 1e6);
        }
    }

    fn print_status(&mut self) {
        println!("State: {}", self.handle.state());
        match self.handle.subscribe_status().borrow().as_ref() {
            Some(update) => {
                let record = &update.record;
                println!(
                    "Tuned {:.3} MHz, {} mode, rate {} Hz, SNR {:.1} dB, {:.1} kB/s{}{} ({})",
                    record.center_frequency_hz as f64 / 1e6,
                    record.mode,
                    record.sample_rate_hz,
                    record.signal_to_noise_ratio,
                    record.throughput,
                    if record.scanning { ", scanning" } else { "" },
                    if record.seeking { ", seeking" } else { "" },
                    update.received_at.format("%H:%M:%S"),
                );
            }
            None => println!("No status received yet"),
        }
        if let Some(target) = self.tuning.target_hz() {
            println!("Target {:.3} MHz", target as f64 / 1e6);
        }
        let stations = self.stations.stations(self.mode.as_ref());
        if !stations.is_empty() {
            let list: Vec<String> = stations
                .iter()
                .map(|hz| format!("{:.1}", *hz as f64 / 1e6))
                .collect();
            println!("Stations ({}): {}", self.mode, list.join(", "));
        }
        self.log_stats();
    }

    fn log_stats(&mut self) {
        let session = self.handle.stats();
        let underruns = self.sink_stats.underruns();
        let dropped = session.dropped_buffers();
        log::info!(
            "Stats: {} frames ({} faults, {} discarded), {} buffers played, {} underruns, {} dropped",
            session.frames(),
            session.decode_faults(),
            session.discarded_frames(),
            self.sink_stats.buffers_played(),
            underruns,
            dropped,
        );

        // Underruns are expected while idle
        let connected = self.handle.state() == ConnectionState::Connected;
        if connected && underruns > self.last_underruns {
            log::warn!(
                "Playback starved {} times since last report",
                underruns - self.last_underruns
            );
        }
        if dropped > self.last_dropped {
            log::warn!(
                "Playback queue full, dropped {} buffers since last report",
                dropped - self.last_dropped
            );
        }
        self.last_underruns = underruns;
        self.last_dropped = dropped;
    }
}

fn list_output_devices() -> anyhow::Result<()> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|device| device.name().ok());

    println!("Available Output Devices:");
    for device in host.output_devices()? {
        let Ok(name) = device.name() else {
            continue;
        };
        let marker = if default_name.as_deref() == Some(name.as_str()) {
            " (default)"
        } else {
            ""
        };
        match device.default_output_config() {
            Ok(config) => println!(
                "  {}{}: {} Hz, {} channels",
                name,
                marker,
                config.sample_rate().0,
                config.channels()
            ),
            Err(_) => println!("  {}{}", name, marker),
        }
    }
    Ok(())
}
