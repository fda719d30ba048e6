use std::io;
use thiserror::Error;

use crate::radio::OpenDiagnostics;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("bluetooth error: {0}")]
    Bluetooth(#[from] BluetoothError),
    /// Baseband or channel open failed or timed out.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Discovery and the brute-force channel search were exhausted.
    #[error("no RFCOMM channel could be opened: {0}")]
    NoChannelAvailable(Box<OpenDiagnostics>),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("transport is not open")]
    NotOpen,
    #[error("channel closed by remote device")]
    Disconnected,
    #[error("run loop executor: {0}")]
    Executor(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether a fresh connection attempt (with a fresh discovery pass) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connect(_)
            | TransportError::NoChannelAvailable(_)
            | TransportError::Timeout(_)
            | TransportError::Disconnected => true,
            TransportError::Bluetooth(e) => !matches!(e, BluetoothError::InvalidAddress(_)),
            TransportError::Io(_)
            | TransportError::Serial(_)
            | TransportError::Protocol(_)
            | TransportError::NotOpen
            | TransportError::Executor(_)
            | TransportError::Config(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum BluetoothError {
    #[error("invalid bluetooth address: {0}")]
    InvalidAddress(String),
    #[error("device not found: {address}")]
    NotFound { address: String },
    #[error("baseband connection failed: {0}")]
    Baseband(String),
    #[error("service discovery failed: {0}")]
    Sdp(String),
    #[error("rfcomm channel {channel} failed with code {code}")]
    Rfcomm { channel: u8, code: i32 },
}

pub type Result<T> = std::result::Result<T, TransportError>;
