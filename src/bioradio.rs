//! BioRadio device driver.
//!
//! Request/response exchange over any [`TransportPort`]. The device answers
//! a request with a frame carrying the same command nibble; unrelated frames
//! (late replies, unsolicited status) are skipped while waiting.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::errors::{Result, TransportError};
use crate::frame::{
    Command, Frame, FrameAssembler, GET_FIRMWARE_VERSION, GET_MODE, MODE_ACQUIRE,
    MODE_IDLE, PARAM_FIRMWARE_VERSION, SET_MODE_ACQUIRE, SET_MODE_IDLE,
};
use crate::transport::{self, ConnectOptions, TransportPort, DRAIN_LIMIT};

// ============================================================================
// Constants
// ============================================================================

/// Default wait for a command response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `set_mode` waits for an optional acknowledgement frame.
const SET_MODE_ACK_WAIT: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 256;

// ============================================================================
// Data Types
// ============================================================================

/// Firmware and hardware revisions as reported by GetGlobal FirmwareVersion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirmwareVersion {
    pub firmware: (u8, u8),
    pub hardware: (u8, u8),
}

impl FirmwareVersion {
    /// Decode `[param=0x00, _, fw_major, fw_minor, hw_major, hw_minor, ..]`.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        match payload {
            [PARAM_FIRMWARE_VERSION, _, fw_major, fw_minor, hw_major, hw_minor, ..] => Ok(Self {
                firmware: (*fw_major, *fw_minor),
                hardware: (*hw_major, *hw_minor),
            }),
            [param, ..] if *param != PARAM_FIRMWARE_VERSION => Err(TransportError::Protocol(
                format!("GetGlobal answered parameter {param:#04X}, not FirmwareVersion"),
            )),
            _ => Err(TransportError::Protocol(format!(
                "firmware response too short: {} bytes",
                payload.len()
            ))),
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FW={}.{:02} HW={}.{:02}",
            self.firmware.0, self.firmware.1, self.hardware.0, self.hardware.1
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceMode {
    Idle,
    Acquire,
    Other(u8),
}

impl DeviceMode {
    pub fn from_byte(value: u8) -> Self {
        match value {
            MODE_IDLE => DeviceMode::Idle,
            MODE_ACQUIRE => DeviceMode::Acquire,
            other => DeviceMode::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            DeviceMode::Idle => MODE_IDLE,
            DeviceMode::Acquire => MODE_ACQUIRE,
            DeviceMode::Other(v) => v,
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "idle" => Ok(DeviceMode::Idle),
            "acquire" => Ok(DeviceMode::Acquire),
            other => Err(TransportError::Config(format!(
                "unknown mode '{other}' (expected idle or acquire)"
            ))),
        }
    }
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Idle => f.write_str("idle"),
            DeviceMode::Acquire => f.write_str("acquire"),
            DeviceMode::Other(v) => write!(f, "mode {v:#04X}"),
        }
    }
}

// ============================================================================
// BioRadio Driver
// ============================================================================

/// BioRadio device driver.
///
/// ```ignore
/// let mut radio = BioRadio::connect("/dev/cu.BioRadio", &ConnectOptions::default())?;
/// println!("{}", radio.firmware_version()?);
/// radio.set_mode(DeviceMode::Acquire)?;
/// while let Some(frame) = radio.read_frame(Duration::from_millis(500))? {
///     // ...
/// }
/// radio.close();
/// ```
pub struct BioRadio {
    transport: Box<dyn TransportPort>,
    assembler: FrameAssembler,
}

impl BioRadio {
    // ------------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------------

    pub fn new(transport: Box<dyn TransportPort>) -> Self {
        Self {
            transport,
            assembler: FrameAssembler::new(),
        }
    }

    /// Connect through [`transport::connect`]: serial first, native RFCOMM
    /// when the serial path is missing or silent.
    pub fn connect(target: &str, options: &ConnectOptions) -> Result<Self> {
        let transport = transport::connect(target, options)?;
        info!("BioRadio connected via {}", transport.describe());
        Ok(Self::new(transport))
    }

    pub fn transport(&self) -> &dyn TransportPort {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn TransportPort {
        self.transport.as_mut()
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    // ------------------------------------------------------------------------
    // Device Commands
    // ------------------------------------------------------------------------

    /// Send `command` and wait for the frame that answers it.
    pub fn request(&mut self, command: &Command, timeout: Duration) -> Result<Frame> {
        self.flush_input()?;
        self.send(command)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(format!(
                    "no response to {} within {:?}",
                    command.name, timeout
                )));
            }
            match self.read_frame(remaining)? {
                Some(frame) if frame.command == command.command => return Ok(frame),
                Some(frame) => debug!(
                    "skipping frame command={:#X} ({} bytes) while waiting for {}",
                    frame.command,
                    frame.payload.len(),
                    command.name
                ),
                None => {}
            }
        }
    }

    pub fn firmware_version(&mut self) -> Result<FirmwareVersion> {
        let frame = self.request(&GET_FIRMWARE_VERSION, RESPONSE_TIMEOUT)?;
        let version = FirmwareVersion::from_payload(&frame.payload)?;
        debug!("device firmware: {}", version);
        Ok(version)
    }

    pub fn mode(&mut self) -> Result<DeviceMode> {
        let frame = self.request(&GET_MODE, RESPONSE_TIMEOUT)?;
        let byte = frame
            .payload
            .first()
            .copied()
            .ok_or_else(|| TransportError::Protocol("empty GetMode response".into()))?;
        Ok(DeviceMode::from_byte(byte))
    }

    /// Switch device mode. Firmware may or may not acknowledge; a missing
    /// acknowledgement is not an error.
    pub fn set_mode(&mut self, mode: DeviceMode) -> Result<()> {
        let command = match mode {
            DeviceMode::Idle => SET_MODE_IDLE,
            DeviceMode::Acquire => SET_MODE_ACQUIRE,
            DeviceMode::Other(v) => {
                return Err(TransportError::Config(format!(
                    "refusing to set unknown mode {v:#04X}"
                )))
            }
        };
        match self.request(&command, SET_MODE_ACK_WAIT) {
            Ok(frame) => debug!("SetMode acknowledged: {:02X?}", frame.payload),
            Err(TransportError::Timeout(_)) => {
                debug!("no acknowledgement for {}", command.name)
            }
            Err(e) => return Err(e),
        }
        info!("device mode set to {}", mode);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Raw I/O
    // ------------------------------------------------------------------------

    pub fn send(&mut self, command: &Command) -> Result<()> {
        let bytes = command.to_bytes();
        debug!("sending {}: {:02X?}", command.name, bytes);
        self.transport.write(&bytes)?;
        Ok(())
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        self.transport.write(bytes)
    }

    /// Raw read, bypassing (and not disturbing) frame assembly.
    pub fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        self.transport.read(max_len, timeout)
    }

    /// Next complete frame, or `None` if none arrives within `timeout`.
    pub fn read_frame(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        if let Some(frame) = self.assembler.next_frame() {
            return Ok(Some(frame));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let chunk = self.transport.read(READ_CHUNK, remaining)?;
            if chunk.is_empty() {
                continue;
            }
            self.assembler.push(&chunk);
            if let Some(frame) = self.assembler.next_frame() {
                if self.assembler.discarded() > 0 {
                    debug!("{} noise bytes discarded so far", self.assembler.discarded());
                }
                return Ok(Some(frame));
            }
        }
    }

    pub fn bytes_available(&self) -> usize {
        self.transport.bytes_available() + self.assembler.len()
    }

    /// Drop stale input, both buffered frames and bytes still in the
    /// transport. Bounded by the drain limit.
    pub fn flush_input(&mut self) -> Result<usize> {
        let pending = self.assembler.len();
        self.assembler.clear();
        Ok(pending + transport::drain(self.transport.as_mut(), DRAIN_LIMIT)?)
    }

    /// Return the device to idle (best effort) and release the transport.
    pub fn close(&mut self) {
        if self.transport.is_open() {
            if let Err(e) = self.send(&SET_MODE_IDLE) {
                warn!("could not idle device before close: {}", e);
            }
        }
        self.transport.close();
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }
}

impl Drop for BioRadio {
    fn drop(&mut self) {
        self.transport.close();
    }
}
