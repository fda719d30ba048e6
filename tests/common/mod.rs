//! Simulated native stack for driving `NativeRadioTransport` without a radio.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use bioradio_link::sdp::{ServiceRecord, Uuid, UUID_SERIAL_PORT};
use bioradio_link::{
    BdAddr, BluetoothError, ChannelDelegate, EventLoop, OpenMode, RadioBackend, RadioConfig,
    RadioStack, Result, TransportError,
};

pub const ADDRESS: &str = "00:1A:7D:DA:71:13";
pub const ECONNREFUSED: i32 = 111;
pub const EHOSTDOWN: i32 = 112;

/// How the simulated device answers an open of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelBehavior {
    /// `open_channel` returns the code immediately.
    Reject(i32),
    /// `open_channel` is accepted but the callback reports the code.
    FailCallback(i32),
    /// Opens in either mode.
    Open,
    /// Sync opens are rejected; async opens succeed from the run loop.
    OpenAsyncOnly,
}

#[derive(Debug, Default)]
pub struct SimState {
    pub records: Vec<ServiceRecord>,
    pub behaviors: HashMap<u8, ChannelBehavior>,
    pub device_name: Option<String>,
    pub baseband_error: Option<String>,
    pub sdp_error: Option<String>,
    /// Bytes delivered to the open channel on the next pump.
    pub inbound: VecDeque<u8>,
    /// Reply queued into `inbound` on each write.
    pub replies: VecDeque<Vec<u8>>,
    pub remote_close: bool,
    pub written: Vec<u8>,
    /// Most bytes taken by one `write` call.
    pub write_chunk: Option<usize>,
    /// Total bytes taken before every `write` returns 0.
    pub write_budget: Option<usize>,
    pub opens: Vec<(u8, OpenMode)>,
    /// Thread of every native call, tagged with the call name.
    pub calls: Vec<(&'static str, ThreadId)>,
    pub baseband_closed: bool,
}

impl SimState {
    pub fn native_threads(&self) -> Vec<ThreadId> {
        let mut threads: Vec<ThreadId> = self.calls.iter().map(|(_, t)| *t).collect();
        threads.dedup();
        threads
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimBackend {
    pub state: Arc<Mutex<SimState>>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap()
    }

    pub fn with_spp_records(self, channels: &[u8]) -> Self {
        self.lock().records = channels
            .iter()
            .enumerate()
            .map(|(i, ch)| spp_record(0x0001_0000 + i as u32, *ch))
            .collect();
        self
    }

    pub fn with_channel(self, channel: u8, behavior: ChannelBehavior) -> Self {
        self.lock().behaviors.insert(channel, behavior);
        self
    }

    pub fn accepting_per_write(self, bytes: usize) -> Self {
        self.lock().write_chunk = Some(bytes);
        self
    }

    pub fn stalling_after(self, bytes: usize) -> Self {
        self.lock().write_budget = Some(bytes);
        self
    }

    pub fn push_inbound(&self, bytes: &[u8]) {
        self.lock().inbound.extend(bytes);
    }

    pub fn queue_reply(&self, bytes: Vec<u8>) {
        self.lock().replies.push_back(bytes);
    }

    pub fn close_remote(&self) {
        self.lock().remote_close = true;
    }
}

pub fn spp_record(handle: u32, channel: u8) -> ServiceRecord {
    ServiceRecord {
        handle: Some(handle),
        name: Some(format!("Serial Port {channel}")),
        rfcomm_channel: Some(channel),
        service_classes: vec![Uuid::Short(UUID_SERIAL_PORT)],
    }
}

impl RadioBackend for SimBackend {
    type Stack = SimStack;

    fn name(&self) -> &'static str {
        "sim"
    }

    fn attach(&self, _address: BdAddr, _config: &RadioConfig) -> Result<SimStack> {
        self.lock().calls.push(("attach", thread::current().id()));
        Ok(SimStack {
            state: self.state.clone(),
            connected: false,
            records: Vec::new(),
            channel: None,
        })
    }
}

struct SimChannel {
    id: u8,
    delegate: Arc<ChannelDelegate>,
    open: bool,
    /// Callback status still to be delivered from the run loop.
    pending: Option<std::result::Result<(), i32>>,
}

pub struct SimStack {
    state: Arc<Mutex<SimState>>,
    connected: bool,
    records: Vec<ServiceRecord>,
    channel: Option<SimChannel>,
}

impl SimStack {
    fn record(&self, call: &'static str) -> MutexGuard<'_, SimState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((call, thread::current().id()));
        state
    }
}

impl EventLoop for SimStack {
    fn run_for(&mut self, slice: Duration) {
        if let Some(channel) = self.channel.as_mut() {
            if let Some(status) = channel.pending.take() {
                channel.open = status.is_ok();
                channel.delegate.on_open_complete(status);
            }
            if channel.open {
                let mut state = self.state.lock().unwrap();
                if !state.inbound.is_empty() {
                    let bytes: Vec<u8> = state.inbound.drain(..).collect();
                    channel.delegate.on_data(&bytes);
                }
                if state.remote_close {
                    channel.delegate.on_closed();
                    channel.open = false;
                }
            }
        }
        thread::sleep(slice);
    }
}

impl RadioStack for SimStack {
    fn is_connected(&self) -> bool {
        drop(self.record("is_connected"));
        self.connected
    }

    fn open_baseband(&mut self, _timeout: Duration) -> Result<()> {
        let error = self.record("open_baseband").baseband_error.clone();
        match error {
            Some(reason) => Err(BluetoothError::Baseband(reason).into()),
            None => {
                self.connected = true;
                Ok(())
            }
        }
    }

    fn close_baseband(&mut self) -> Result<()> {
        self.record("close_baseband").baseband_closed = true;
        self.connected = false;
        Ok(())
    }

    fn device_name(&self) -> Option<String> {
        self.record("device_name").device_name.clone()
    }

    fn query_services(&mut self, _timeout: Duration) -> Result<()> {
        let state = self.record("query_services");
        if let Some(reason) = &state.sdp_error {
            return Err(BluetoothError::Sdp(reason.clone()).into());
        }
        let records = state.records.clone();
        drop(state);
        self.records = records;
        Ok(())
    }

    fn services(&self) -> Vec<ServiceRecord> {
        drop(self.record("services"));
        self.records.clone()
    }

    fn open_channel(
        &mut self,
        channel: u8,
        mode: OpenMode,
        delegate: Arc<ChannelDelegate>,
    ) -> Result<()> {
        let behavior = {
            let mut state = self.record("open_channel");
            state.opens.push((channel, mode));
            state
                .behaviors
                .get(&channel)
                .copied()
                .unwrap_or(ChannelBehavior::Reject(ECONNREFUSED))
        };

        let (open, pending) = match (behavior, mode) {
            (ChannelBehavior::Reject(code), _) => {
                return Err(BluetoothError::Rfcomm { channel, code }.into())
            }
            (ChannelBehavior::OpenAsyncOnly, OpenMode::Sync) => {
                return Err(BluetoothError::Rfcomm {
                    channel,
                    code: EHOSTDOWN,
                }
                .into())
            }
            (ChannelBehavior::FailCallback(code), _) => (false, Some(Err(code))),
            (ChannelBehavior::Open, OpenMode::Sync) => {
                delegate.on_open_complete(Ok(()));
                (true, None)
            }
            (ChannelBehavior::Open | ChannelBehavior::OpenAsyncOnly, OpenMode::Async) => {
                (false, Some(Ok(())))
            }
        };

        self.channel = Some(SimChannel {
            id: channel,
            delegate,
            open,
            pending,
        });
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut state = self.record("write");
        let Some(channel) = self.channel.as_ref() else {
            return Err(TransportError::NotOpen);
        };
        if !channel.open {
            return Err(TransportError::Disconnected);
        }
        let mut accepted = bytes.len();
        if let Some(chunk) = state.write_chunk {
            accepted = accepted.min(chunk);
        }
        if let Some(budget) = state.write_budget {
            accepted = accepted.min(budget.saturating_sub(state.written.len()));
        }
        if accepted == 0 {
            return Ok(0);
        }
        state.written.extend_from_slice(&bytes[..accepted]);
        if let Some(reply) = state.replies.pop_front() {
            state.inbound.extend(reply);
        }
        Ok(accepted)
    }

    fn close_channel(&mut self) -> Result<()> {
        drop(self.record("close_channel"));
        self.channel = None;
        Ok(())
    }
}

/// Settle times zeroed and waits shortened for fast tests.
pub fn test_config() -> RadioConfig {
    RadioConfig {
        address: Some(ADDRESS.to_string()),
        preferred_channel: 1,
        connect_timeout: Duration::from_secs(1),
        write_timeout: Duration::from_secs(1),
        baseband_settle: Duration::ZERO,
        sdp_settle: Duration::ZERO,
        sdp_timeout: Duration::from_secs(1),
        sync_open_wait: Duration::from_millis(200),
        async_open_wait: Duration::from_millis(300),
        schedule_timeout: Duration::from_secs(2),
        join_timeout: Duration::from_secs(2),
        pump_interval: Duration::from_millis(5),
    }
}
