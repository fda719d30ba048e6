//! BioRadio transport and framing layer with optional Python bindings.
//!
//! The device speaks a small binary request/response protocol over
//! Bluetooth SPP. This crate provides:
//!
//! - the frame codec ([`frame`]),
//! - a blocking [`TransportPort`] implemented over an OS serial device
//!   ([`SerialTransport`]) and over a native RFCOMM channel
//!   ([`NativeRadioTransport`]),
//! - [`connect`], which tries the serial device first and falls back to
//!   native RFCOMM when the serial node is missing or silent,
//! - the [`BioRadio`] driver on top.
//!
//! # Native RFCOMM
//!
//! Platform Bluetooth objects are thread-affine, so all of them live on a
//! dedicated run-loop thread ([`RunLoopExecutor`]). Channel selection
//! tries SDP-advertised channels, then the configured channel, then sweeps
//! 1..=30. A failed open reports every attempt in [`OpenDiagnostics`].

pub mod bioradio;
pub mod bluetooth;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod errors;
pub mod executor;
pub mod frame;
pub mod locator;
pub mod logging;
pub mod radio;
pub mod sdp;
pub mod serial;
pub mod transport;

pub use bioradio::{BioRadio, DeviceMode, FirmwareVersion};
pub use bluetooth::{BdAddr, SocketBackend};
pub use errors::*;
pub use executor::{EventLoop, ExecutorState, RunLoopExecutor};
pub use frame::{decode, encode, try_parse, Command, Frame, FrameAssembler, ParseResult};
pub use locator::{CandidateChannel, ChannelLocator, ChannelSource, Discovery};
pub use radio::{
    discover_services, ChannelDelegate, DefaultBackend, NativeRadioTransport, OpenDiagnostics,
    OpenMode, RadioBackend, RadioConfig, RadioStack,
};
pub use serial::{SerialConfig, SerialTransport};
pub use transport::{connect, connect_with_backend, ConnectOptions, TransportPort, TransportState};

// ============================================================================
// Python Bindings
// ============================================================================

#[cfg(feature = "python")]
mod python {
    use std::time::Duration;

    use pyo3::exceptions::{PyConnectionError, PyIOError, PyTimeoutError, PyValueError};
    use pyo3::prelude::*;
    use pyo3::types::PyBytes;

    use crate::frame::LengthEncoding;
    use crate::{
        BioRadio, ConnectOptions, DeviceMode, Frame, ParseResult, TransportError,
    };

    fn to_py_err(e: TransportError) -> PyErr {
        match e {
            TransportError::Timeout(_) => PyTimeoutError::new_err(e.to_string()),
            TransportError::Connect(_)
            | TransportError::NoChannelAvailable(_)
            | TransportError::Disconnected
            | TransportError::Bluetooth(_) => PyConnectionError::new_err(e.to_string()),
            TransportError::Config(_) | TransportError::Protocol(_) => {
                PyValueError::new_err(e.to_string())
            }
            _ => PyIOError::new_err(e.to_string()),
        }
    }

    fn seconds(value: f64) -> PyResult<Duration> {
        Duration::try_from_secs_f64(value)
            .map_err(|_| PyValueError::new_err(format!("invalid timeout {value}")))
    }

    /// One protocol frame.
    ///
    /// Attributes:
    ///     command: Command nibble (0-15).
    ///     payload: Payload bytes.
    ///     extended: True if the frame uses the explicit length byte.
    #[pyclass(name = "Frame", frozen, eq)]
    #[derive(Clone, PartialEq, Eq)]
    struct PyFrame {
        #[pyo3(get)]
        command: u8,
        data: Vec<u8>,
        #[pyo3(get)]
        extended: bool,
    }

    #[pymethods]
    impl PyFrame {
        #[new]
        fn new(command: u8, payload: Vec<u8>) -> Self {
            Frame::new(command, payload).into()
        }

        #[getter]
        fn payload<'py>(&self, py: Python<'py>) -> Bound<'py, PyBytes> {
            PyBytes::new(py, &self.data)
        }

        /// Wire encoding including the sync byte.
        fn to_bytes<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyBytes>> {
            let bytes = Frame::new(self.command, self.data.clone())
                .to_bytes()
                .map_err(to_py_err)?;
            Ok(PyBytes::new(py, &bytes))
        }

        fn __repr__(&self) -> String {
            format!(
                "Frame(command=0x{:X}, payload={:02X?}, extended={})",
                self.command, self.data, self.extended
            )
        }

        fn __len__(&self) -> usize {
            self.data.len()
        }
    }

    impl From<Frame> for PyFrame {
        fn from(f: Frame) -> Self {
            PyFrame {
                command: f.command,
                extended: f.length_encoding == LengthEncoding::Extended,
                data: f.payload,
            }
        }
    }

    /// BioRadio device connection.
    ///
    /// Example:
    ///     >>> radio = BioRadio.connect("/dev/cu.BioRadio", address="00:1A:7D:DA:71:13")
    ///     >>> print(radio.firmware_version())
    ///     >>> radio.close()
    #[pyclass(name = "BioRadio", unsendable)]
    struct PyBioRadio {
        inner: BioRadio,
    }

    #[pymethods]
    impl PyBioRadio {
        /// Connect to a serial device path or Bluetooth address.
        ///
        /// Args:
        ///     target: Serial device path or Bluetooth address.
        ///     address: Bluetooth address used if the serial path is dead.
        ///     channel: RFCOMM channel tried after SDP-advertised ones.
        ///     timeout: Baseband connect timeout in seconds.
        ///
        /// Raises:
        ///     ConnectionError: If neither path yields a working channel.
        #[staticmethod]
        #[pyo3(signature = (target, address=None, channel=1, timeout=15.0))]
        fn connect(
            py: Python<'_>,
            target: &str,
            address: Option<String>,
            channel: u8,
            timeout: f64,
        ) -> PyResult<Self> {
            let mut options = ConnectOptions::default();
            options.radio.address = address;
            options.radio.preferred_channel = channel;
            options.radio.connect_timeout = seconds(timeout)?;
            let target = target.to_string();

            let inner = py
                .detach(move || BioRadio::connect(&target, &options))
                .map_err(to_py_err)?;
            Ok(PyBioRadio { inner })
        }

        /// Firmware/hardware revision string, e.g. "FW=4.07 HW=2.01".
        fn firmware_version(&mut self, py: Python<'_>) -> PyResult<String> {
            let inner = &mut self.inner;
            py.detach(|| inner.firmware_version())
                .map(|v| v.to_string())
                .map_err(to_py_err)
        }

        fn mode(&mut self, py: Python<'_>) -> PyResult<String> {
            let inner = &mut self.inner;
            py.detach(|| inner.mode())
                .map(|m| m.to_string())
                .map_err(to_py_err)
        }

        /// Args:
        ///     name: "idle" or "acquire".
        fn set_mode(&mut self, py: Python<'_>, name: &str) -> PyResult<()> {
            let mode = DeviceMode::parse(name).map_err(to_py_err)?;
            let inner = &mut self.inner;
            py.detach(|| inner.set_mode(mode)).map_err(to_py_err)
        }

        fn write(&mut self, py: Python<'_>, data: Vec<u8>) -> PyResult<usize> {
            let inner = &mut self.inner;
            py.detach(|| inner.write(&data)).map_err(to_py_err)
        }

        /// Up to `max_len` bytes; empty if nothing arrives within `timeout` seconds.
        #[pyo3(signature = (max_len=256, timeout=1.0))]
        fn read<'py>(
            &mut self,
            py: Python<'py>,
            max_len: usize,
            timeout: f64,
        ) -> PyResult<Bound<'py, PyBytes>> {
            let timeout = seconds(timeout)?;
            let inner = &mut self.inner;
            let data = py
                .detach(|| inner.read(max_len, timeout))
                .map_err(to_py_err)?;
            Ok(PyBytes::new(py, &data))
        }

        #[pyo3(signature = (timeout=1.0))]
        fn read_frame(&mut self, py: Python<'_>, timeout: f64) -> PyResult<Option<PyFrame>> {
            let timeout = seconds(timeout)?;
            let inner = &mut self.inner;
            py.detach(|| inner.read_frame(timeout))
                .map(|f| f.map(PyFrame::from))
                .map_err(to_py_err)
        }

        #[getter]
        fn bytes_available(&self) -> usize {
            self.inner.bytes_available()
        }

        #[getter]
        fn transport(&self) -> String {
            self.inner.describe()
        }

        fn close(&mut self, py: Python<'_>) {
            let inner = &mut self.inner;
            py.detach(|| inner.close());
        }

        fn __repr__(&self) -> String {
            format!("BioRadio({})", self.inner.describe())
        }
    }

    /// Encode one frame.
    #[pyfunction]
    fn encode<'py>(py: Python<'py>, command: u8, payload: Vec<u8>) -> PyResult<Bound<'py, PyBytes>> {
        let bytes = crate::frame::encode(command, &payload).map_err(to_py_err)?;
        Ok(PyBytes::new(py, &bytes))
    }

    /// Scan `buffer` for one frame.
    ///
    /// Returns:
    ///     ("frame", Frame, consumed), ("garbage", None, consumed) or
    ///     ("incomplete", None, 0).
    #[pyfunction]
    fn try_parse(buffer: Vec<u8>) -> (&'static str, Option<PyFrame>, usize) {
        match crate::frame::try_parse(&buffer) {
            ParseResult::Incomplete => ("incomplete", None, 0),
            ParseResult::Frame(frame, consumed) => ("frame", Some(frame.into()), consumed),
            ParseResult::Garbage(consumed) => ("garbage", None, consumed),
        }
    }

    /// Set the level forwarded into Python logging ("debug", "info", ...).
    #[pyfunction]
    #[pyo3(signature = (level=None))]
    fn set_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        crate::logging::set_python_log_level_str(py, level)
    }

    #[pymodule]
    fn _core(m: &Bound<'_, PyModule>) -> PyResult<()> {
        crate::logging::init_python_logging(m.py())?;

        m.add_class::<PyBioRadio>()?;
        m.add_class::<PyFrame>()?;
        m.add_function(wrap_pyfunction!(encode, m)?)?;
        m.add_function(wrap_pyfunction!(try_parse, m)?)?;
        m.add_function(wrap_pyfunction!(set_log_level, m)?)?;

        m.add("SYNC_BYTE", crate::frame::SYNC_BYTE)?;
        m.add("BAUD_RATE", crate::serial::BAUD_RATE)?;
        Ok(())
    }
}
