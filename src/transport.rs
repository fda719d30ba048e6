//! Blocking byte-stream contract shared by every backend, and the factory
//! that picks a backend for a target.
//!
//! `connect()` tries the OS serial device first. Some hosts expose a serial
//! node for a paired device that is never wired to an RFCOMM channel: the
//! port opens fine but nothing ever arrives. A port that fails to open, or
//! stays silent through the response probe, is abandoned in favour of a
//! native RFCOMM channel opened directly against the Bluetooth stack.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::bluetooth::BdAddr;
use crate::errors::{Result, TransportError};
use crate::frame::{FrameAssembler, GET_FIRMWARE_VERSION};
use crate::radio::{DefaultBackend, NativeRadioTransport, RadioBackend, RadioConfig};
use crate::serial::{SerialConfig, SerialTransport};

const DEFAULT_PROBE_WINDOW: Duration = Duration::from_secs(2);
const DEFAULT_PROBE_ATTEMPTS: u32 = 3;

/// Upper bound on how long stale input is drained before a request.
pub const DRAIN_LIMIT: Duration = Duration::from_millis(200);
const DRAIN_SLICE: Duration = Duration::from_millis(20);
const PROBE_READ_CHUNK: usize = 64;

// ============================================================================
// Contract
// ============================================================================

/// Lifecycle of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Opening,
    Open,
    Failed(String),
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportState::Closed => f.write_str("closed"),
            TransportState::Opening => f.write_str("opening"),
            TransportState::Open => f.write_str("open"),
            TransportState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Modem line signals some device firmware inspects at the protocol level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSignals {
    pub dtr: bool,
    pub rts: bool,
}

/// Blocking byte stream to the device.
///
/// Every call that can block is bounded: `open` by the backend's connect
/// timeout, `write` by its write timeout and `read` by the caller's timeout.
pub trait TransportPort: Send {
    /// Acquire the underlying channel. On failure the state is `Failed` and
    /// the transport may be opened again or dropped.
    fn open(&mut self) -> Result<()>;

    /// Write all of `bytes`, retrying partial writes until the write timeout
    /// elapses (`TransportError::Timeout`).
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Wait up to `timeout` for data and return what is available, at most
    /// `max_len` bytes. An empty vector means nothing arrived in time.
    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>>;

    /// Bytes received and not yet read.
    fn bytes_available(&self) -> usize;

    /// Release the channel. Idempotent and infallible.
    fn close(&mut self);

    fn state(&self) -> TransportState;

    fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    fn line_signals(&self) -> LineSignals;

    /// Apply DTR/RTS. Backends without modem lines store the values as
    /// advisory no-ops.
    fn set_line_signals(&mut self, signals: LineSignals) -> Result<()>;

    /// Short human-readable identity, e.g. `serial:/dev/cu.BioRadio`.
    fn describe(&self) -> String;
}

// ============================================================================
// Helpers
// ============================================================================

/// Discard stale input, bounded by `limit`. Returns the number of bytes dropped.
pub fn drain(transport: &mut dyn TransportPort, limit: Duration) -> Result<usize> {
    let deadline = Instant::now() + limit;
    let mut drained = 0usize;
    while Instant::now() < deadline {
        let chunk = transport.read(256, DRAIN_SLICE)?;
        if chunk.is_empty() {
            break;
        }
        drained += chunk.len();
    }
    if drained > 0 {
        debug!("drained {} stale bytes from {}", drained, transport.describe());
    }
    Ok(drained)
}

/// Check whether the device answers a firmware query on this transport.
///
/// Sends GetGlobal FirmwareVersion up to `attempts` times and waits `window`
/// after each for one complete frame. Transport errors count as silence.
pub fn probe(transport: &mut dyn TransportPort, window: Duration, attempts: u32) -> bool {
    let attempts = attempts.max(1);
    let request = GET_FIRMWARE_VERSION.to_bytes();

    if let Err(e) = drain(transport, DRAIN_LIMIT) {
        debug!("probe drain failed on {}: {}", transport.describe(), e);
        return false;
    }

    for attempt in 1..=attempts {
        if let Err(e) = transport.write(&request) {
            warn!(
                "probe write failed on {} (attempt {}/{}): {}",
                transport.describe(),
                attempt,
                attempts,
                e
            );
            return false;
        }

        let deadline = Instant::now() + window;
        let mut assembler = FrameAssembler::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match transport.read(PROBE_READ_CHUNK, remaining) {
                Ok(bytes) => {
                    assembler.push(&bytes);
                    if let Some(frame) = assembler.next_frame() {
                        info!(
                            "device answered on {} (attempt {}, command={:#X}, {} payload bytes)",
                            transport.describe(),
                            attempt,
                            frame.command,
                            frame.payload.len()
                        );
                        return true;
                    }
                }
                Err(e) => {
                    debug!("probe read failed on {}: {}", transport.describe(), e);
                    return false;
                }
            }
        }
        debug!(
            "no response on {} (attempt {}/{})",
            transport.describe(),
            attempt,
            attempts
        );
    }
    false
}

/// Config durations as whole milliseconds in JSON (`"write_timeout": 2000`).
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// Transport Selection
// ============================================================================

/// Everything `connect()` needs: both backends' settings plus the probe window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectOptions {
    pub serial: SerialConfig,
    /// `radio.address` is the native fallback for serial targets.
    pub radio: RadioConfig,
    #[serde(with = "millis")]
    pub probe_window: Duration,
    pub probe_attempts: u32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            radio: RadioConfig::default(),
            probe_window: DEFAULT_PROBE_WINDOW,
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
        }
    }
}

impl ConnectOptions {
    pub fn validate(&self) -> Result<()> {
        if self.probe_window.is_zero() {
            return Err(TransportError::Config("probe_window must be non-zero".into()));
        }
        self.serial.validate()?;
        self.radio.validate()
    }
}

/// Open a transport to `target`, a serial device path or a Bluetooth address.
pub fn connect(target: &str, options: &ConnectOptions) -> Result<Box<dyn TransportPort>> {
    connect_with_backend(target, options, DefaultBackend::default())
}

/// `connect()` with an explicit native backend.
pub fn connect_with_backend<B: RadioBackend>(
    target: &str,
    options: &ConnectOptions,
    backend: B,
) -> Result<Box<dyn TransportPort>> {
    options.validate()?;

    if let Ok(address) = target.parse::<BdAddr>() {
        info!("{} is a bluetooth address, opening RFCOMM directly", address);
        let mut radio = options.radio.clone();
        radio.address = Some(address.to_string());
        return open_native(radio, backend);
    }

    let mut serial_config = options.serial.clone();
    serial_config.path = target.to_string();
    let mut serial = SerialTransport::new(serial_config);

    let serial_failure = match serial.open() {
        Ok(()) => {
            if probe(&mut serial, options.probe_window, options.probe_attempts) {
                return Ok(Box::new(serial));
            }
            serial.close();
            format!(
                "{} opened but gave no response within {:?} x{}",
                target, options.probe_window, options.probe_attempts
            )
        }
        Err(e) => format!("{target} could not be opened: {e}"),
    };

    if options.radio.address.is_none() {
        return Err(TransportError::Connect(format!(
            "{serial_failure}; no bluetooth address configured for the RFCOMM fallback"
        )));
    }

    warn!("{}; falling back to native RFCOMM", serial_failure);
    open_native(options.radio.clone(), backend)
}

fn open_native<B: RadioBackend>(config: RadioConfig, backend: B) -> Result<Box<dyn TransportPort>> {
    let mut radio = NativeRadioTransport::with_backend(config, backend);
    radio.open()?;
    Ok(Box::new(radio))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode;
    use std::collections::VecDeque;

    /// In-memory transport answering each write with a scripted reply.
    struct Loopback {
        replies: VecDeque<Vec<u8>>,
        inbound: VecDeque<u8>,
        writes: Vec<Vec<u8>>,
    }

    impl Loopback {
        fn new(replies: Vec<Vec<u8>>) -> Self {
            Self {
                replies: replies.into(),
                inbound: VecDeque::new(),
                writes: Vec::new(),
            }
        }
    }

    impl TransportPort for Loopback {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn write(&mut self, bytes: &[u8]) -> Result<usize> {
            self.writes.push(bytes.to_vec());
            if let Some(reply) = self.replies.pop_front() {
                self.inbound.extend(reply);
            }
            Ok(bytes.len())
        }
        fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
            if self.inbound.is_empty() {
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                return Ok(Vec::new());
            }
            let n = max_len.min(self.inbound.len());
            Ok(self.inbound.drain(..n).collect())
        }
        fn bytes_available(&self) -> usize {
            self.inbound.len()
        }
        fn close(&mut self) {}
        fn state(&self) -> TransportState {
            TransportState::Open
        }
        fn line_signals(&self) -> LineSignals {
            LineSignals::default()
        }
        fn set_line_signals(&mut self, _signals: LineSignals) -> Result<()> {
            Ok(())
        }
        fn describe(&self) -> String {
            "loopback".into()
        }
    }

    #[test]
    fn probe_succeeds_on_first_complete_frame() {
        let reply = encode(0xF, &[0, 0, 1, 2, 3, 4]).unwrap();
        let mut t = Loopback::new(vec![reply]);
        assert!(probe(&mut t, Duration::from_millis(100), 3));
        assert_eq!(t.writes, vec![vec![0xF0, 0xF1, 0x00]]);
    }

    #[test]
    fn probe_retries_then_gives_up_on_silence() {
        let mut t = Loopback::new(vec![]);
        assert!(!probe(&mut t, Duration::from_millis(30), 2));
        assert_eq!(t.writes.len(), 2);
    }

    #[test]
    fn probe_ignores_noise_without_a_frame() {
        let mut t = Loopback::new(vec![vec![0x00, 0x11], vec![0x22]]);
        assert!(!probe(&mut t, Duration::from_millis(30), 2));
    }

    #[test]
    fn drain_empties_pending_input() {
        let mut t = Loopback::new(vec![]);
        t.inbound.extend([1u8, 2, 3, 4]);
        assert_eq!(drain(&mut t, DRAIN_LIMIT).unwrap(), 4);
        assert_eq!(t.bytes_available(), 0);
    }

    #[test]
    fn options_reject_zero_probe_window() {
        let options = ConnectOptions {
            probe_window: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn option_durations_are_milliseconds_in_json() {
        let options: ConnectOptions = serde_json::from_str(
            r#"{"probe_window": 750, "radio": {"connect_timeout": 5000}, "serial": {"write_timeout": 250}}"#,
        )
        .unwrap();
        assert_eq!(options.probe_window, Duration::from_millis(750));
        assert_eq!(options.radio.connect_timeout, Duration::from_secs(5));
        assert_eq!(options.radio.write_timeout, RadioConfig::default().write_timeout);
        assert_eq!(options.serial.write_timeout, Duration::from_millis(250));

        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["probe_window"], 750);
        assert_eq!(json["radio"]["pump_interval"], 50);
        assert_eq!(json["serial"]["read_timeout"], options.serial.read_timeout.as_millis() as u64);
    }

    #[test]
    fn state_display_is_readable() {
        assert_eq!(TransportState::Open.to_string(), "open");
        assert_eq!(
            TransportState::Failed("timeout".into()).to_string(),
            "failed (timeout)"
        );
    }
}
