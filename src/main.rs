use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{warn, LevelFilter};

use bioradio_link::bioradio::RESPONSE_TIMEOUT;
use bioradio_link::frame::{Frame, FrameAssembler, GET_FIRMWARE_VERSION};
use bioradio_link::logging::init_rust_logging;
use bioradio_link::{
    radio, BdAddr, BioRadio, ConnectOptions, Discovery, FirmwareVersion, OpenDiagnostics,
    TransportError,
};

#[derive(Parser, Debug)]
#[command(
    name = "bioradio-probe",
    about = "Connect to a BioRadio and query its firmware version"
)]
struct Args {
    /// Serial device path (e.g. /dev/rfcomm0) or Bluetooth address
    target: String,
    /// Bluetooth address for the RFCOMM fallback when `target` is a serial path
    #[arg(long)]
    address: Option<String>,
    /// RFCOMM channel tried after SDP-advertised channels
    #[arg(long)]
    channel: Option<u8>,
    #[arg(long)]
    baud: Option<u32>,
    /// Baseband connect timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,
    /// Serial probe window in milliseconds
    #[arg(long)]
    probe_window: Option<u64>,
    /// Firmware queries before giving up
    #[arg(long, default_value_t = 3)]
    retries: u32,
    /// Only run service discovery and print the records
    #[arg(long)]
    sdp_only: bool,
    /// JSON file with connection options
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print results as JSON
    #[arg(long)]
    json: bool,
    /// Append the raw bytes received during the firmware query (skipped
    /// frames and noise included) to this file
    #[arg(long)]
    dump: Option<PathBuf>,
    /// -v debug, -vv trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_rust_logging(match args.verbose {
        0 => None,
        1 => Some(LevelFilter::Debug),
        _ => Some(LevelFilter::Trace),
    });

    let options = load_options(&args)?;

    if args.sdp_only {
        return run_discovery(&args, options);
    }

    println!("--- Connecting to {} ---", args.target);
    let mut device = match BioRadio::connect(&args.target, &options) {
        Ok(device) => device,
        Err(TransportError::NoChannelAvailable(diagnostics)) => {
            print_diagnostics(&diagnostics, args.json)?;
            bail!("no RFCOMM channel could be opened");
        }
        Err(e) => return Err(e.into()),
    };
    println!("Connected via {}", device.describe());

    let result = query_firmware(&mut device, &args);
    device.close();
    let version = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&version)?);
    } else {
        println!("Firmware: {version}");
    }
    Ok(())
}

fn load_options(args: &Args) -> Result<ConnectOptions> {
    let mut options = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<ConnectOptions>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => ConnectOptions::default(),
    };

    if let Some(address) = &args.address {
        options.radio.address = Some(address.clone());
    }
    if let Some(channel) = args.channel {
        options.radio.preferred_channel = channel;
    }
    if let Some(baud) = args.baud {
        options.serial.baud_rate = baud;
    }
    if let Some(secs) = args.timeout {
        options.radio.connect_timeout =
            Duration::try_from_secs_f64(secs).context("invalid --timeout")?;
    }
    if let Some(ms) = args.probe_window {
        options.probe_window = Duration::from_millis(ms);
    }
    options.validate()?;
    Ok(options)
}

fn run_discovery(args: &Args, mut options: ConnectOptions) -> Result<()> {
    if options.radio.address.is_none() && args.target.parse::<BdAddr>().is_ok() {
        options.radio.address = Some(args.target.clone());
    }
    if options.radio.address.is_none() {
        bail!("--sdp-only needs a bluetooth address (as target or --address)");
    }

    let discovery = radio::discover_services(&options.radio)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&discovery)?);
    } else {
        print_discovery(&discovery);
    }
    Ok(())
}

fn print_discovery(discovery: &Discovery) {
    if let Some(error) = &discovery.query_error {
        println!("SDP query failed: {error}");
    }
    println!("{} service record(s)", discovery.records.len());
    for record in &discovery.records {
        println!(
            "  {:<10}  {:<24}  rfcomm={}  spp={}",
            record
                .handle
                .map_or_else(|| "-".to_string(), |h| format!("0x{h:08X}")),
            record.name.as_deref().unwrap_or("-"),
            record
                .rfcomm_channel
                .map_or_else(|| "-".to_string(), |c| c.to_string()),
            record.is_serial_port()
        );
    }
    let order: Vec<String> = discovery
        .candidates
        .iter()
        .map(|c| format!("{}({})", c.id, c.source))
        .collect();
    println!("Candidate order: {}", order.join(" "));
}

fn print_diagnostics(diagnostics: &OpenDiagnostics, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(diagnostics)?);
    } else {
        println!("{diagnostics}");
    }
    Ok(())
}

fn query_firmware(device: &mut BioRadio, args: &Args) -> Result<FirmwareVersion> {
    let mut last_error = None;
    for attempt in 1..=args.retries.max(1) {
        match exchange_firmware(device, args.dump.as_deref()) {
            Ok(frame) => {
                println!("Response: {}", hex(&frame.to_bytes()?));
                return Ok(FirmwareVersion::from_payload(&frame.payload)?);
            }
            Err(e) => {
                println!("[attempt {attempt}] firmware query failed: {e}");
                if !e.is_retryable() {
                    return Err(e.into());
                }
                last_error = Some(e);
                thread::sleep(Duration::from_millis(250));
            }
        }
    }
    match last_error {
        Some(e) => Err(e.into()),
        None => bail!("no firmware query was sent"),
    }
}

/// One firmware round trip over raw reads, so every received byte
/// (skipped frames and noise included) can be appended to `dump`.
fn exchange_firmware(
    device: &mut BioRadio,
    dump: Option<&Path>,
) -> bioradio_link::Result<Frame> {
    device.flush_input()?;
    device.send(&GET_FIRMWARE_VERSION)?;

    let mut assembler = FrameAssembler::new();
    let deadline = Instant::now() + RESPONSE_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::Timeout(format!(
                "no response to {} within {:?}",
                GET_FIRMWARE_VERSION.name, RESPONSE_TIMEOUT
            )));
        }
        let chunk = device.read(READ_CHUNK, remaining)?;
        if chunk.is_empty() {
            continue;
        }
        if let Some(path) = dump {
            if let Err(e) = append(path, &chunk) {
                warn!("dump to {} failed: {e:#}", path.display());
            }
        }
        assembler.push(&chunk);
        while let Some(frame) = assembler.next_frame() {
            if frame.command == GET_FIRMWARE_VERSION.command {
                return Ok(frame);
            }
            println!("Skipped: {}", hex(&frame.to_bytes()?));
        }
    }
}

fn append(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(bytes)?;
    Ok(())
}

const READ_CHUNK: usize = 256;

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
