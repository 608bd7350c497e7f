use std::process::exit;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use cs1237_rs::config::{AcquisitionConfig, ChannelMode, Gain, SampleRate};
use cs1237_rs::device::{Cs1237, BAUD_RATE};
use cs1237_rs::frame::DecodedEvent;
use cs1237_rs::interpret::Telemetry;
use cs1237_rs::logging;

#[derive(Parser, Debug)]
#[command(name = "cs1237-demo", about = "Stream corrected samples from a CS1237 bridge")]
struct Args {
    /// Serial port (e.g., /dev/ttyUSB0, COM3)
    port: Option<String>,
    #[arg(short, long, default_value_t = BAUD_RATE)]
    baud: u32,
    /// Output rate in Hz: 10, 40, 640 or 1280
    #[arg(short, long)]
    rate: Option<u16>,
    /// PGA gain: 1, 2, 64 or 128
    #[arg(short, long)]
    gain: Option<u16>,
    /// Channel code: 0 differential, 2 temperature, 3 short
    #[arg(short, long)]
    channel: Option<u8>,
    /// Seconds to stream
    #[arg(short, long, default_value_t = 10)]
    duration: u64,
    /// Disable spike correction
    #[arg(long)]
    no_filter: bool,
    /// Enable Kalman smoothing
    #[arg(long)]
    smooth: bool,
    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    logging::init_rust_logging();

    if args.list_ports {
        let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
        for port in ports {
            println!("{}", port.port_name);
        }
        return Ok(());
    }
    let Some(port) = args.port.as_deref() else {
        bail!("a serial port is required (see --list-ports)");
    };

    let config = AcquisitionConfig {
        enable_outlier_filter: !args.no_filter,
        enable_smoothing: args.smooth,
        ..AcquisitionConfig::default()
    };
    let (device, streams) = Cs1237::connect_serial(port, args.baud, config)?;

    // 1. Configuration
    if let Some(hz) = args.rate {
        device.set_sample_rate(SampleRate::from_hz_checked(hz)?)?;
    }
    if let Some(factor) = args.gain {
        device.set_gain(Gain::from_factor_checked(factor)?)?;
    }
    if let Some(code) = args.channel {
        device.set_channel(ChannelMode::from_code_checked(code)?)?;
    }
    device.query_status()?;

    // 2. Acquisition
    println!("Streaming for {}s...", args.duration);
    device.start()?;
    let deadline = Instant::now() + Duration::from_secs(args.duration);
    while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
        match streams
            .samples
            .recv_timeout(remaining.min(Duration::from_millis(200)))
        {
            Ok(sample) => println!("{:>9.3}s {:>+14.4}", sample.time, sample.value),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for event in streams.events.try_iter() {
            if let DecodedEvent::TextLine(line) = event {
                println!("> {line}");
            }
        }
        for record in streams.telemetry.try_iter() {
            match record {
                Telemetry::Fault(fault) => eprintln!("Device error: {fault}"),
                other => info!("{other:?}"),
            }
        }
    }

    // 3. Cleanup
    println!("Stopping...");
    device.stop()?;
    let stats = device.stats();
    device.shutdown()?;
    println!(
        "Done. {} frames, {} samples, {} corrected, {} resync bytes.",
        stats.frames, stats.samples, stats.outliers, stats.resync_discards
    );
    Ok(())
}
