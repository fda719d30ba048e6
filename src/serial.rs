use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serialport::{FlowControl, SerialPort};

use crate::errors::{Result, TransportError};
use crate::transport::{LineSignals, TransportPort, TransportState};

/// Default serial baud rate for BioRadio devices
pub const BAUD_RATE: u32 = 460_800;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings for the OS serial device path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device node, e.g. `/dev/cu.BioRadio-SerialPort` or `COM5`.
    pub path: String,
    pub baud_rate: u32,
    /// Initial port timeout; `read()` overrides it per call.
    #[serde(with = "crate::transport::millis")]
    pub read_timeout: Duration,
    #[serde(with = "crate::transport::millis")]
    pub write_timeout: Duration,
    pub dtr: bool,
    pub rts: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            baud_rate: BAUD_RATE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            dtr: false,
            rts: false,
        }
    }
}

impl SerialConfig {
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(TransportError::Config("baud_rate must be non-zero".into()));
        }
        if self.write_timeout.is_zero() {
            return Err(TransportError::Config("write_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Transport over a conventional OS serial device.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    state: TransportState,
    signals: LineSignals,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        let signals = LineSignals {
            dtr: config.dtr,
            rts: config.rts,
        };
        Self {
            config,
            port: None,
            state: TransportState::Closed,
            signals,
        }
    }

    /// Create and open in one step.
    pub fn connect(config: SerialConfig) -> Result<Self> {
        let mut transport = Self::new(config);
        transport.open()?;
        Ok(transport)
    }

    pub fn path(&self) -> &str {
        &self.config.path
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(TransportError::NotOpen)
    }

    /// Push DTR/RTS to the port. Platforms without modem control keep the
    /// values as advisory state only.
    fn apply_signals(&mut self) {
        let signals = self.signals;
        let path = self.config.path.clone();
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.write_data_terminal_ready(signals.dtr) {
                debug!("DTR not supported on {}: {}", path, e);
            }
            if let Err(e) = port.write_request_to_send(signals.rts) {
                debug!("RTS not supported on {}: {}", path, e);
            }
        }
    }
}

impl TransportPort for SerialTransport {
    fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        self.config.validate()?;
        self.state = TransportState::Opening;

        let opened = serialport::new(&self.config.path, self.config.baud_rate)
            .flow_control(FlowControl::None)
            .timeout(self.config.read_timeout)
            .open();

        match opened {
            Ok(port) => {
                self.port = Some(port);
                self.apply_signals();
                self.state = TransportState::Open;
                info!(
                    "serial port open: path={}, baud={}",
                    self.config.path, self.config.baud_rate
                );
                Ok(())
            }
            Err(e) => {
                warn!("cannot open serial port {}: {}", self.config.path, e);
                self.state = TransportState::Failed(e.to_string());
                Err(e.into())
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let write_timeout = self.config.write_timeout;
        let deadline = Instant::now() + write_timeout;
        let port = self.port_mut()?;

        let mut written = 0usize;
        while written < bytes.len() {
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout(format!(
                    "serial write timed out after {:?}: {} of {} bytes sent",
                    write_timeout,
                    written,
                    bytes.len()
                )));
            }
            match port.write(&bytes[written..]) {
                Ok(n) => written += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
        port.flush()?;
        debug!("serial TX: {} bytes: {:02X?}", bytes.len(), bytes);
        Ok(written)
    }

    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let port = self.port_mut()?;
        let mut buf = vec![0u8; max_len];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            port.set_timeout(remaining)?;
            match port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => {
                    buf.truncate(n);
                    debug!("serial RX: {} bytes", n);
                    return Ok(buf);
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    return Ok(Vec::new());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = TransportState::Failed(e.to_string());
                    return Err(e.into());
                }
            }
        }
    }

    fn bytes_available(&self) -> usize {
        self.port
            .as_ref()
            .and_then(|p| p.bytes_to_read().ok())
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("serial port closed: path={}", self.config.path);
        }
        self.state = TransportState::Closed;
    }

    fn state(&self) -> TransportState {
        self.state.clone()
    }

    fn line_signals(&self) -> LineSignals {
        self.signals
    }

    fn set_line_signals(&mut self, signals: LineSignals) -> Result<()> {
        self.signals = signals;
        self.apply_signals();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.config.path)
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_port() -> SerialConfig {
        SerialConfig {
            path: "/dev/bioradio-link-does-not-exist".into(),
            ..Default::default()
        }
    }

    #[test]
    fn failed_open_leaves_failed_state_and_close_is_safe() {
        let mut t = SerialTransport::new(missing_port());
        assert_eq!(t.state(), TransportState::Closed);
        assert!(t.open().is_err());
        assert!(matches!(t.state(), TransportState::Failed(_)));

        t.close();
        t.close();
        assert_eq!(t.state(), TransportState::Closed);
    }

    #[test]
    fn io_on_unopened_port_reports_not_open() {
        let mut t = SerialTransport::new(missing_port());
        assert!(matches!(t.write(&[0xF0]), Err(TransportError::NotOpen)));
        assert!(matches!(
            t.read(8, Duration::from_millis(10)),
            Err(TransportError::NotOpen)
        ));
        assert_eq!(t.bytes_available(), 0);
    }

    #[test]
    fn line_signals_are_kept_without_a_port() {
        let mut t = SerialTransport::new(missing_port());
        let signals = LineSignals {
            dtr: true,
            rts: false,
        };
        t.set_line_signals(signals).unwrap();
        assert_eq!(t.line_signals(), signals);
    }

    #[cfg(unix)]
    #[test]
    fn write_reaches_the_other_end_of_a_pty() {
        let (mut master, slave) = serialport::TTYPort::pair().unwrap();
        let path = slave.name().unwrap();
        drop(slave);
        master.set_timeout(Duration::from_millis(500)).unwrap();

        let mut t = SerialTransport::new(SerialConfig {
            path,
            ..Default::default()
        });
        t.open().unwrap();
        let frame = [0xF0, 0xF6, 0x06, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        assert_eq!(t.write(&frame).unwrap(), frame.len());

        let mut received = [0u8; 9];
        master.read_exact(&mut received).unwrap();
        assert_eq!(received, frame);
        t.close();
    }

    #[test]
    fn config_defaults_match_device() {
        let cfg = SerialConfig::default();
        assert_eq!(cfg.baud_rate, 460_800);
        assert!(cfg.validate().is_ok());
        let bad = SerialConfig {
            baud_rate: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
