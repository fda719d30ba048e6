//! Native RFCOMM transport.
//!
//! Native channel handles live on the [`RunLoopExecutor`] thread for their
//! whole life. Open, data and close notifications arrive there through a
//! [`ChannelDelegate`], which buffers them for the blocking
//! [`TransportPort`] calls made from any other thread.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::bluetooth::BdAddr;
use crate::errors::{BluetoothError, Result, TransportError};
use crate::executor::{EventLoop, RunLoopExecutor};
use crate::locator::{is_valid_channel, CandidateChannel, ChannelLocator, ChannelSource, Discovery};
use crate::sdp::ServiceRecord;
use crate::transport::{LineSignals, TransportPort, TransportState};

#[cfg(not(feature = "bluez"))]
pub type DefaultBackend = crate::bluetooth::SocketBackend;
#[cfg(feature = "bluez")]
pub type DefaultBackend = crate::bluez::BluezBackend;

/// Open status reported when the channel closes before any open outcome.
pub const CLOSED_BEFORE_OPEN: i32 = -1;

const EXECUTOR_NAME: &str = "bioradio-runloop";

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Paired device address, `AA:BB:CC:DD:EE:FF`.
    pub address: Option<String>,
    /// Tried right after any SDP-advertised channels.
    pub preferred_channel: u8,
    #[serde(with = "crate::transport::millis")]
    pub connect_timeout: Duration,
    #[serde(with = "crate::transport::millis")]
    pub write_timeout: Duration,
    #[serde(with = "crate::transport::millis")]
    pub baseband_settle: Duration,
    #[serde(with = "crate::transport::millis")]
    pub sdp_settle: Duration,
    #[serde(with = "crate::transport::millis")]
    pub sdp_timeout: Duration,
    #[serde(with = "crate::transport::millis")]
    pub sync_open_wait: Duration,
    #[serde(with = "crate::transport::millis")]
    pub async_open_wait: Duration,
    #[serde(with = "crate::transport::millis")]
    pub schedule_timeout: Duration,
    #[serde(with = "crate::transport::millis")]
    pub join_timeout: Duration,
    #[serde(with = "crate::transport::millis")]
    pub pump_interval: Duration,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            address: None,
            preferred_channel: 1,
            connect_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(2),
            baseband_settle: Duration::from_secs(1),
            sdp_settle: Duration::from_secs(2),
            sdp_timeout: Duration::from_secs(10),
            sync_open_wait: Duration::from_secs(3),
            async_open_wait: Duration::from_secs(5),
            schedule_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(3),
            pump_interval: Duration::from_millis(50),
        }
    }
}

impl RadioConfig {
    pub fn validate(&self) -> Result<()> {
        if !is_valid_channel(self.preferred_channel) {
            return Err(TransportError::Config(format!(
                "preferred_channel {} outside 1..=30",
                self.preferred_channel
            )));
        }
        let required = [
            ("connect_timeout", self.connect_timeout),
            ("write_timeout", self.write_timeout),
            ("sync_open_wait", self.sync_open_wait),
            ("async_open_wait", self.async_open_wait),
            ("schedule_timeout", self.schedule_timeout),
            ("pump_interval", self.pump_interval),
        ];
        if let Some((name, _)) = required.iter().find(|(_, d)| d.is_zero()) {
            return Err(TransportError::Config(format!("{name} must be non-zero")));
        }
        if let Some(address) = &self.address {
            address
                .parse::<BdAddr>()
                .map_err(|e| TransportError::Config(e.to_string()))?;
        }
        Ok(())
    }

    pub fn bdaddr(&self) -> Result<BdAddr> {
        match &self.address {
            Some(address) => Ok(address.parse()?),
            None => Err(TransportError::Config(
                "no bluetooth address configured".into(),
            )),
        }
    }

    fn locator(&self) -> ChannelLocator {
        ChannelLocator::new(self.sdp_settle, self.sdp_timeout)
    }
}

// ============================================================================
// Native stack contract
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// The native call blocks until the stack has an answer.
    Sync,
    /// The native call returns at once; the outcome arrives as a callback.
    Async,
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpenMode::Sync => "sync",
            OpenMode::Async => "async",
        })
    }
}

/// A platform Bluetooth stack bound to one remote device.
///
/// Every method is called on the executor thread that created the stack.
/// Callbacks into a [`ChannelDelegate`] are made from [`EventLoop::run_for`]
/// or from within `open_channel` itself.
pub trait RadioStack: EventLoop {
    fn is_connected(&self) -> bool;

    fn open_baseband(&mut self, timeout: Duration) -> Result<()>;

    fn close_baseband(&mut self) -> Result<()>;

    fn device_name(&self) -> Option<String>;

    /// Start a fresh, uncached service query.
    fn query_services(&mut self, timeout: Duration) -> Result<()>;

    /// Service records from the most recent successful query.
    fn services(&self) -> Vec<ServiceRecord>;

    /// Ask the stack to open `channel`. `Ok` means the request was accepted;
    /// the outcome is reported through `delegate.on_open_complete`. A
    /// rejected request returns `BluetoothError::Rfcomm` with the native code.
    fn open_channel(
        &mut self,
        channel: u8,
        mode: OpenMode,
        delegate: Arc<ChannelDelegate>,
    ) -> Result<()>;

    fn write(&mut self, bytes: &[u8]) -> Result<usize>;

    fn close_channel(&mut self) -> Result<()>;
}

/// Creates stacks. `attach` runs on the executor thread, so the stack type
/// does not need to be `Send`.
pub trait RadioBackend: Clone + Send + Sync + 'static {
    type Stack: RadioStack + 'static;

    fn name(&self) -> &'static str;

    fn attach(&self, address: BdAddr, config: &RadioConfig) -> Result<Self::Stack>;
}

// ============================================================================
// Delegate
// ============================================================================

#[derive(Debug, Default)]
struct DelegateState {
    buffer: VecDeque<u8>,
    open: Option<std::result::Result<(), i32>>,
    closed: bool,
}

/// Thread-safe mailbox between native callbacks and blocking callers.
///
/// The callback methods only touch the buffer and flags under one lock and
/// never block on anything else.
#[derive(Debug, Default)]
pub struct ChannelDelegate {
    state: Mutex<DelegateState>,
    signal: Condvar,
}

impl ChannelDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DelegateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `Err(code)` carries the native status of a failed open.
    pub fn on_open_complete(&self, status: std::result::Result<(), i32>) {
        let mut state = self.lock();
        if state.open.is_none() {
            state.open = Some(status);
        }
        self.signal.notify_all();
    }

    pub fn on_data(&self, bytes: &[u8]) {
        let mut state = self.lock();
        state.buffer.extend(bytes);
        self.signal.notify_all();
    }

    pub fn on_closed(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.signal.notify_all();
    }

    /// Wait for the open outcome. `None` if nothing was reported in time.
    pub fn wait_open(&self, timeout: Duration) -> Option<std::result::Result<(), i32>> {
        let guard = self.lock();
        let (state, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |s| s.open.is_none() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        match state.open {
            Some(status) => Some(status),
            None if state.closed => Some(Err(CLOSED_BEFORE_OPEN)),
            None => None,
        }
    }

    /// Take up to `max_len` buffered bytes, waiting up to `timeout` for the
    /// first one. Buffered bytes are still returned after a remote close;
    /// once drained, a closed channel reports `Disconnected`.
    pub fn read(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let guard = self.lock();
        let (mut state, _) = self
            .signal
            .wait_timeout_while(guard, timeout, |s| s.buffer.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);

        if state.buffer.is_empty() {
            return if state.closed {
                Err(TransportError::Disconnected)
            } else {
                Ok(Vec::new())
            };
        }
        let n = max_len.min(state.buffer.len());
        Ok(state.buffer.drain(..n).collect())
    }

    pub fn available(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum AttemptOutcome {
    Opened,
    /// The stack refused the open request outright.
    Rejected { code: i32 },
    /// The open callback reported failure.
    Failed { code: i32 },
    TimedOut,
    Error { message: String },
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Opened => f.write_str("opened"),
            AttemptOutcome::Rejected { code } => write!(f, "rejected code={code:#X}"),
            AttemptOutcome::Failed { code } => write!(f, "failed code={code:#X}"),
            AttemptOutcome::TimedOut => f.write_str("no callback"),
            AttemptOutcome::Error { message } => write!(f, "error: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelAttempt {
    pub channel: u8,
    pub source: ChannelSource,
    pub service_name: Option<String>,
    pub mode: OpenMode,
    pub outcome: AttemptOutcome,
    pub elapsed_ms: u64,
}

/// Everything learned while trying to open a channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OpenDiagnostics {
    pub address: String,
    pub backend: String,
    pub device_name: Option<String>,
    pub discovery: Discovery,
    pub attempts: Vec<ChannelAttempt>,
    pub opened_channel: Option<u8>,
}

impl OpenDiagnostics {
    /// Failure codes per channel, in attempt order.
    pub fn failure_codes(&self) -> Vec<(u8, i32)> {
        self.attempts
            .iter()
            .filter_map(|a| match a.outcome {
                AttemptOutcome::Rejected { code } | AttemptOutcome::Failed { code } => {
                    Some((a.channel, code))
                }
                _ => None,
            })
            .collect()
    }

    pub fn attempted_channels(&self) -> Vec<u8> {
        let mut out: Vec<u8> = Vec::new();
        for a in &self.attempts {
            if out.last() != Some(&a.channel) {
                out.push(a.channel);
            }
        }
        out
    }
}

impl fmt::Display for OpenDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} records, {} attempts)",
            self.address,
            self.discovery.records.len(),
            self.attempts.len()
        )?;
        if let Some(err) = &self.discovery.query_error {
            write!(f, "; sdp: {err}")?;
        }
        for a in &self.attempts {
            write!(f, "; ch{} [{} {}] {}", a.channel, a.source, a.mode, a.outcome)?;
        }
        Ok(())
    }
}

fn outcome_of(err: &TransportError) -> AttemptOutcome {
    match err {
        TransportError::Bluetooth(BluetoothError::Rfcomm { code, .. }) => {
            AttemptOutcome::Rejected { code: *code }
        }
        TransportError::Timeout(_) => AttemptOutcome::TimedOut,
        other => AttemptOutcome::Error {
            message: other.to_string(),
        },
    }
}

// ============================================================================
// Transport
// ============================================================================

/// [`TransportPort`] over an RFCOMM channel opened through a native stack.
pub struct NativeRadioTransport<B: RadioBackend = DefaultBackend> {
    config: RadioConfig,
    backend: B,
    executor: Option<RunLoopExecutor<B::Stack>>,
    delegate: Option<Arc<ChannelDelegate>>,
    channel: Option<CandidateChannel>,
    state: TransportState,
    signals: LineSignals,
    diagnostics: Option<OpenDiagnostics>,
}

impl NativeRadioTransport<DefaultBackend> {
    pub fn new(config: RadioConfig) -> Self {
        Self::with_backend(config, DefaultBackend::default())
    }

    /// Create and open in one step.
    pub fn connect(config: RadioConfig) -> Result<Self> {
        let mut transport = Self::new(config);
        transport.open()?;
        Ok(transport)
    }
}

impl<B: RadioBackend> NativeRadioTransport<B> {
    pub fn with_backend(config: RadioConfig, backend: B) -> Self {
        Self {
            config,
            backend,
            executor: None,
            delegate: None,
            channel: None,
            state: TransportState::Closed,
            signals: LineSignals::default(),
            diagnostics: None,
        }
    }

    /// The open channel number.
    pub fn channel_id(&self) -> Option<u8> {
        self.channel.as_ref().map(|c| c.id)
    }

    pub fn channel(&self) -> Option<&CandidateChannel> {
        self.channel.as_ref()
    }

    /// Diagnostics from the most recent `open()`, successful or not.
    pub fn diagnostics(&self) -> Option<&OpenDiagnostics> {
        self.diagnostics.as_ref()
    }

    pub fn config(&self) -> &RadioConfig {
        &self.config
    }

    fn executor(&self) -> Result<&RunLoopExecutor<B::Stack>> {
        self.executor.as_ref().ok_or(TransportError::NotOpen)
    }

    fn open_inner(&mut self, address: BdAddr, diag: &mut OpenDiagnostics) -> Result<()> {
        let executor = start_executor(&self.backend, address, &self.config)?;
        let executor = self.executor.insert(executor);

        connect_baseband(executor, address, &self.config)?;
        diag.device_name = executor
            .schedule_and_wait(self.config.schedule_timeout, |s| Ok(s.device_name()))
            .unwrap_or(None);

        diag.discovery = self
            .config
            .locator()
            .discover(executor, self.config.preferred_channel);

        let candidates = diag.discovery.candidates.clone();
        for candidate in candidates {
            for mode in [OpenMode::Sync, OpenMode::Async] {
                let delegate = Arc::new(ChannelDelegate::new());
                let started = Instant::now();
                let outcome = try_channel(executor, &self.config, &candidate, mode, &delegate);
                let opened = outcome == AttemptOutcome::Opened;

                if opened {
                    info!(
                        "RFCOMM channel {} open ({}, {} mode)",
                        candidate.id, candidate.source, mode
                    );
                } else {
                    debug!("channel {} ({} mode): {}", candidate.id, mode, outcome);
                }
                diag.attempts.push(ChannelAttempt {
                    channel: candidate.id,
                    source: candidate.source,
                    service_name: candidate.service_name.clone(),
                    mode,
                    outcome,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });

                if opened {
                    diag.opened_channel = Some(candidate.id);
                    self.delegate = Some(delegate);
                    self.channel = Some(candidate);
                    return Ok(());
                }
            }
        }

        Err(TransportError::NoChannelAvailable(Box::new(diag.clone())))
    }

    /// Tear down the channel, the baseband link and the executor thread.
    /// Secondary errors are logged, never returned.
    fn teardown(&mut self) {
        if let Some(mut executor) = self.executor.take() {
            if executor.is_running() {
                let timeout = self.config.schedule_timeout;
                if let Err(e) = executor.schedule_and_wait(timeout, |s| s.close_channel()) {
                    debug!("closing RFCOMM channel: {}", e);
                }
                if let Err(e) = executor.schedule_and_wait(timeout, |s| s.close_baseband()) {
                    debug!("closing baseband: {}", e);
                }
            }
            executor.stop(self.config.join_timeout);
        }
        self.delegate = None;
        self.channel = None;
    }

    fn remote_closed(&self) -> bool {
        self.delegate.as_ref().is_some_and(|d| d.is_closed())
    }
}

fn start_executor<B: RadioBackend>(
    backend: &B,
    address: BdAddr,
    config: &RadioConfig,
) -> Result<RunLoopExecutor<B::Stack>> {
    let mut executor = RunLoopExecutor::new(EXECUTOR_NAME, config.pump_interval);
    let backend = backend.clone();
    let stack_config = config.clone();
    executor.start(move || backend.attach(address, &stack_config))?;
    Ok(executor)
}

fn connect_baseband<S: RadioStack + 'static>(
    executor: &RunLoopExecutor<S>,
    address: BdAddr,
    config: &RadioConfig,
) -> Result<()> {
    let connected = executor.schedule_and_wait(config.schedule_timeout, |s| Ok(s.is_connected()))?;
    if connected {
        debug!("baseband to {} already up", address);
        return Ok(());
    }

    let timeout = config.connect_timeout;
    info!("opening baseband connection to {}", address);
    executor
        .schedule_and_wait(timeout + config.schedule_timeout, move |s| {
            s.open_baseband(timeout)
        })
        .map_err(|e| TransportError::Connect(format!("baseband to {address}: {e}")))?;

    if !config.baseband_settle.is_zero() {
        thread::sleep(config.baseband_settle);
    }
    Ok(())
}

fn try_channel<S: RadioStack + 'static>(
    executor: &RunLoopExecutor<S>,
    config: &RadioConfig,
    candidate: &CandidateChannel,
    mode: OpenMode,
    delegate: &Arc<ChannelDelegate>,
) -> AttemptOutcome {
    let channel = candidate.id;
    let native_delegate = delegate.clone();
    if let Err(e) = executor.schedule_and_wait(config.schedule_timeout, move |s| {
        s.open_channel(channel, mode, native_delegate)
    }) {
        return outcome_of(&e);
    }

    let wait = match mode {
        OpenMode::Sync => config.sync_open_wait,
        OpenMode::Async => config.async_open_wait,
    };
    let outcome = match delegate.wait_open(wait) {
        Some(Ok(())) => AttemptOutcome::Opened,
        Some(Err(code)) => AttemptOutcome::Failed { code },
        // A synchronous open that returned success is trusted even if the
        // stack never delivers the callback.
        None if mode == OpenMode::Sync => AttemptOutcome::Opened,
        None => AttemptOutcome::TimedOut,
    };

    if outcome != AttemptOutcome::Opened {
        if let Err(e) = executor.schedule_and_wait(config.schedule_timeout, |s| s.close_channel())
        {
            debug!("discarding channel {}: {}", channel, e);
        }
    }
    outcome
}

impl<B: RadioBackend> TransportPort for NativeRadioTransport<B> {
    fn open(&mut self) -> Result<()> {
        if self.state == TransportState::Open && !self.remote_closed() {
            return Ok(());
        }
        self.config.validate()?;
        let address = self.config.bdaddr()?;

        self.teardown();
        self.state = TransportState::Opening;

        let mut diag = OpenDiagnostics {
            address: address.to_string(),
            backend: self.backend.name().to_string(),
            ..Default::default()
        };
        let result = self.open_inner(address, &mut diag);
        self.diagnostics = Some(diag);

        match result {
            Ok(()) => {
                self.state = TransportState::Open;
                Ok(())
            }
            Err(e) => {
                warn!("native open of {} failed: {}", address, e);
                self.teardown();
                self.state = TransportState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        if self.state != TransportState::Open {
            return Err(TransportError::NotOpen);
        }
        if self.remote_closed() {
            return Err(TransportError::Disconnected);
        }

        let write_timeout = self.config.write_timeout;
        let pump_interval = self.config.pump_interval;
        let deadline = Instant::now() + write_timeout;
        let executor = self.executor()?;
        let stalled = |written: usize| {
            TransportError::Timeout(format!(
                "RFCOMM write timed out after {:?}: {} of {} bytes sent",
                write_timeout,
                written,
                bytes.len()
            ))
        };

        let mut written = 0usize;
        while written < bytes.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(stalled(written));
            }
            let chunk = bytes[written..].to_vec();
            match executor.schedule_and_wait(remaining, move |s| s.write(&chunk)) {
                // Stack is applying back-pressure; let the run loop drain.
                Ok(0) => thread::sleep(pump_interval.min(remaining)),
                Ok(n) => written += n,
                Err(TransportError::Timeout(_)) => return Err(stalled(written)),
                Err(e) => return Err(e),
            }
        }
        debug!("RFCOMM TX: {} bytes: {:02X?}", bytes.len(), bytes);
        Ok(written)
    }

    fn read(&mut self, max_len: usize, timeout: Duration) -> Result<Vec<u8>> {
        let delegate = match (&self.state, &self.delegate) {
            (TransportState::Open, Some(delegate)) => delegate.clone(),
            _ => return Err(TransportError::NotOpen),
        };
        match delegate.read(max_len, timeout) {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    debug!("RFCOMM RX: {} bytes", bytes.len());
                }
                Ok(bytes)
            }
            Err(TransportError::Disconnected) => {
                info!("RFCOMM channel closed by remote device");
                self.teardown();
                self.state = TransportState::Closed;
                Err(TransportError::Disconnected)
            }
            Err(e) => Err(e),
        }
    }

    fn bytes_available(&self) -> usize {
        self.delegate.as_ref().map(|d| d.available()).unwrap_or(0)
    }

    fn close(&mut self) {
        if self.executor.is_some() {
            info!(
                "closing RFCOMM channel {:?} to {}",
                self.channel_id(),
                self.config.address.as_deref().unwrap_or("?")
            );
        }
        self.teardown();
        self.state = TransportState::Closed;
    }

    fn state(&self) -> TransportState {
        if self.state == TransportState::Open
            && self
                .delegate
                .as_ref()
                .is_some_and(|d| d.is_closed() && d.available() == 0)
        {
            return TransportState::Closed;
        }
        self.state.clone()
    }

    fn line_signals(&self) -> LineSignals {
        self.signals
    }

    /// RFCOMM carries no modem lines here; the values are stored only.
    fn set_line_signals(&mut self, signals: LineSignals) -> Result<()> {
        self.signals = signals;
        Ok(())
    }

    fn describe(&self) -> String {
        match self.channel_id() {
            Some(ch) => format!(
                "rfcomm:{}#{}",
                self.config.address.as_deref().unwrap_or("?"),
                ch
            ),
            None => format!("rfcomm:{}", self.config.address.as_deref().unwrap_or("?")),
        }
    }
}

impl<B: RadioBackend> Drop for NativeRadioTransport<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Run only the discovery stage against `config.address`: start the run
/// loop, bring up the baseband link and query SDP. No channel is opened.
pub fn discover_services(config: &RadioConfig) -> Result<Discovery> {
    discover_services_with(config, DefaultBackend::default())
}

pub fn discover_services_with<B: RadioBackend>(config: &RadioConfig, backend: B) -> Result<Discovery> {
    config.validate()?;
    let address = config.bdaddr()?;
    let mut executor = start_executor(&backend, address, config)?;

    let result = connect_baseband(&executor, address, config)
        .map(|()| config.locator().discover(&executor, config.preferred_channel));

    if executor.is_running() {
        if let Err(e) = executor.schedule_and_wait(config.schedule_timeout, |s| s.close_baseband()) {
            debug!("closing baseband after discovery: {}", e);
        }
    }
    executor.stop(config.join_timeout);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delegate_read_times_out_empty() {
        let d = ChannelDelegate::new();
        let start = Instant::now();
        assert!(d.read(16, Duration::from_millis(60)).unwrap().is_empty());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(60));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn delegate_wakes_reader_on_data() {
        let d = Arc::new(ChannelDelegate::new());
        let feeder = d.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            feeder.on_data(&[0xF0, 0x30]);
            feeder.on_data(&[0x01]);
        });
        let first = d.read(1, Duration::from_secs(2)).unwrap();
        assert_eq!(first, vec![0xF0]);
        handle.join().unwrap();
        assert_eq!(d.read(16, Duration::from_millis(10)).unwrap(), vec![0x30, 0x01]);
    }

    #[test]
    fn close_wakes_reader_after_buffer_drains() {
        let d = Arc::new(ChannelDelegate::new());
        d.on_data(&[1, 2]);
        d.on_closed();
        assert_eq!(d.read(8, Duration::from_secs(1)).unwrap(), vec![1, 2]);

        let start = Instant::now();
        assert!(matches!(
            d.read(8, Duration::from_secs(5)),
            Err(TransportError::Disconnected)
        ));
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn open_outcome_is_first_reported_status() {
        let d = ChannelDelegate::new();
        assert_eq!(d.wait_open(Duration::from_millis(10)), None);
        d.on_open_complete(Err(0x2C5));
        d.on_open_complete(Ok(()));
        assert_eq!(d.wait_open(Duration::from_millis(10)), Some(Err(0x2C5)));

        let closed = ChannelDelegate::new();
        closed.on_closed();
        assert_eq!(
            closed.wait_open(Duration::from_secs(1)),
            Some(Err(CLOSED_BEFORE_OPEN))
        );
    }

    #[test]
    fn config_validation() {
        assert!(RadioConfig::default().validate().is_ok());
        let bad_channel = RadioConfig {
            preferred_channel: 31,
            ..Default::default()
        };
        assert!(bad_channel.validate().is_err());
        let bad_address = RadioConfig {
            address: Some("not-an-address".into()),
            ..Default::default()
        };
        assert!(bad_address.validate().is_err());
        assert!(matches!(
            RadioConfig::default().bdaddr(),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn diagnostics_summarise_attempts() {
        let diag = OpenDiagnostics {
            address: "00:11:22:33:44:55".into(),
            attempts: vec![
                ChannelAttempt {
                    channel: 3,
                    source: ChannelSource::SdpDiscovered,
                    service_name: Some("SPP".into()),
                    mode: OpenMode::Sync,
                    outcome: AttemptOutcome::Failed { code: 0x2C5 },
                    elapsed_ms: 10,
                },
                ChannelAttempt {
                    channel: 3,
                    source: ChannelSource::SdpDiscovered,
                    service_name: Some("SPP".into()),
                    mode: OpenMode::Async,
                    outcome: AttemptOutcome::TimedOut,
                    elapsed_ms: 5000,
                },
            ],
            ..Default::default()
        };
        assert_eq!(diag.attempted_channels(), vec![3]);
        assert_eq!(diag.failure_codes(), vec![(3, 0x2C5)]);
        let text = diag.to_string();
        assert!(text.contains("ch3 [sdp sync] failed code=0x2C5"));
        assert!(text.contains("no callback"));
    }
}
