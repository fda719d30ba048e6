//! Native stack over the BlueZ D-Bus API (`bluer`).
//!
//! `bluer` is async; the stack owns a current-thread tokio runtime that only
//! makes progress while the executor thread pumps it, which gives the same
//! thread affinity as the socket stack.

use std::io;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use bluer::l2cap::{self, SeqPacket};
use bluer::rfcomm::{self, Stream};
use bluer::{Adapter, AdapterEvent, Address, AddressType, Device, Session};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::{Builder, Runtime};
use tokio::task::JoinHandle;

use crate::bluetooth::{BdAddr, SDP_PSM};
use crate::errors::{BluetoothError, Result, TransportError};
use crate::executor::EventLoop;
use crate::radio::{ChannelDelegate, OpenMode, RadioBackend, RadioConfig, RadioStack};
use crate::sdp::{self, ServiceRecord};

const READ_CHUNK: usize = 4096;
const SDP_MTU: usize = 4096;

fn bt_err(e: bluer::Error) -> TransportError {
    BluetoothError::Baseband(e.to_string()).into()
}

fn rfcomm_code(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

#[derive(Debug, Clone, Default)]
pub struct BluezBackend;

impl RadioBackend for BluezBackend {
    type Stack = BluezStack;

    fn name(&self) -> &'static str {
        "bluez-dbus"
    }

    fn attach(&self, address: BdAddr, config: &RadioConfig) -> Result<BluezStack> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let address = Address::new(address.octets());
        let (session, adapter, device) =
            runtime.block_on(resolve_device(address, config.connect_timeout))?;
        info!("bluez device resolved: addr={}, adapter={}", address, adapter.name());

        Ok(BluezStack {
            runtime,
            _session: session,
            _adapter: adapter,
            device,
            address,
            config: config.clone(),
            sdp: None,
            records: Vec::new(),
            channel: None,
        })
    }
}

async fn resolve_device(address: Address, timeout: Duration) -> Result<(Session, Adapter, Device)> {
    let session = Session::new().await.map_err(bt_err)?;
    let adapter = session.default_adapter().await.map_err(bt_err)?;
    adapter.set_powered(true).await.map_err(bt_err)?;

    let known = adapter.device_addresses().await.map_err(bt_err)?;
    if !known.contains(&address) {
        wait_for_device(&adapter, address, timeout).await?;
    }
    let device = adapter.device(address).map_err(bt_err)?;
    if !device.is_paired().await.unwrap_or(false) {
        warn!("{} is not paired; RFCOMM connects may be refused", address);
    }
    Ok((session, adapter, device))
}

async fn wait_for_device(adapter: &Adapter, address: Address, timeout: Duration) -> Result<()> {
    let mut events = adapter.discover_devices().await.map_err(bt_err)?;
    let found = tokio::time::timeout(timeout, async {
        while let Some(evt) = events.next().await {
            if let AdapterEvent::DeviceAdded(addr) = evt {
                if addr == address {
                    return true;
                }
            }
        }
        false
    })
    .await;

    match found {
        Ok(true) => {
            info!("device discovered: addr={}", address);
            Ok(())
        }
        _ => Err(BluetoothError::NotFound {
            address: address.to_string(),
        }
        .into()),
    }
}

async fn sdp_exchange(socket: &SeqPacket, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
    let exchange = async {
        socket.send(request).await?;
        let mut buf = vec![0u8; SDP_MTU];
        let n = socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok::<_, io::Error>(buf)
    };
    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(pdu)) if pdu.is_empty() => {
            Err(BluetoothError::Sdp("SDP server closed the connection".into()).into())
        }
        Ok(Ok(pdu)) => Ok(pdu),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(TransportError::Timeout(format!(
            "no SDP response within {timeout:?}"
        ))),
    }
}

enum Phase {
    Connecting(JoinHandle<io::Result<Stream>>),
    Connected(Stream),
    Open(Stream),
    Closed,
}

struct BluezChannel {
    id: u8,
    delegate: Arc<ChannelDelegate>,
    phase: Phase,
}

pub struct BluezStack {
    runtime: Runtime,
    _session: Session,
    _adapter: Adapter,
    device: Device,
    address: Address,
    config: RadioConfig,
    sdp: Option<SeqPacket>,
    records: Vec<ServiceRecord>,
    channel: Option<BluezChannel>,
}

impl EventLoop for BluezStack {
    fn run_for(&mut self, slice: Duration) {
        let Some(channel) = self.channel.as_mut() else {
            self.runtime.block_on(tokio::time::sleep(slice));
            return;
        };

        match mem::replace(&mut channel.phase, Phase::Closed) {
            Phase::Connecting(handle) => {
                self.runtime.block_on(tokio::time::sleep(slice));
                if !handle.is_finished() {
                    channel.phase = Phase::Connecting(handle);
                    return;
                }
                match self.runtime.block_on(handle) {
                    Ok(Ok(stream)) => {
                        channel.phase = Phase::Open(stream);
                        channel.delegate.on_open_complete(Ok(()));
                    }
                    Ok(Err(e)) => channel.delegate.on_open_complete(Err(rfcomm_code(&e))),
                    Err(e) => {
                        debug!("RFCOMM connect task for channel {} ended: {}", channel.id, e);
                        channel.delegate.on_open_complete(Err(libc::ECANCELED));
                    }
                }
            }
            Phase::Connected(stream) => {
                channel.phase = Phase::Open(stream);
                channel.delegate.on_open_complete(Ok(()));
            }
            Phase::Open(mut stream) => {
                let mut buf = [0u8; READ_CHUNK];
                let read = self
                    .runtime
                    .block_on(tokio::time::timeout(slice, stream.read(&mut buf)));
                match read {
                    Err(_) => channel.phase = Phase::Open(stream),
                    Ok(Ok(0)) => {
                        info!("RFCOMM channel {} closed by remote", channel.id);
                        channel.delegate.on_closed();
                    }
                    Ok(Ok(n)) => {
                        channel.delegate.on_data(&buf[..n]);
                        channel.phase = Phase::Open(stream);
                    }
                    Ok(Err(e)) => {
                        debug!("RFCOMM channel {} read failed: {}", channel.id, e);
                        channel.delegate.on_closed();
                    }
                }
            }
            Phase::Closed => self.runtime.block_on(tokio::time::sleep(slice)),
        }
    }
}

impl RadioStack for BluezStack {
    fn is_connected(&self) -> bool {
        self.sdp.is_some()
            || self
                .runtime
                .block_on(self.device.is_connected())
                .unwrap_or(false)
    }

    /// Connecting to the SDP PSM brings up the ACL link without needing any
    /// profile BlueZ knows about.
    fn open_baseband(&mut self, timeout: Duration) -> Result<()> {
        if self.sdp.is_some() {
            return Ok(());
        }
        let target = l2cap::SocketAddr::new(self.address, AddressType::BrEdr, SDP_PSM);
        let socket = self
            .runtime
            .block_on(tokio::time::timeout(timeout, SeqPacket::connect(target)))
            .map_err(|_| TransportError::Timeout(format!("L2CAP connect after {timeout:?}")))?
            .map_err(|e| BluetoothError::Baseband(e.to_string()))?;
        self.sdp = Some(socket);
        Ok(())
    }

    fn close_baseband(&mut self) -> Result<()> {
        self.sdp = None;
        Ok(())
    }

    fn device_name(&self) -> Option<String> {
        self.runtime.block_on(self.device.name()).ok().flatten()
    }

    fn query_services(&mut self, timeout: Duration) -> Result<()> {
        if self.sdp.is_none() {
            self.open_baseband(timeout)?;
        }
        let socket = self.sdp.as_ref().ok_or(TransportError::NotOpen)?;
        let runtime = &self.runtime;
        let result = sdp::search_attributes(sdp::UUID_L2CAP, |request| {
            runtime.block_on(sdp_exchange(socket, request, timeout))
        });
        match result {
            Ok(records) => {
                self.records = records;
                Ok(())
            }
            Err(e) => {
                self.sdp = None;
                Err(e)
            }
        }
    }

    fn services(&self) -> Vec<ServiceRecord> {
        self.records.clone()
    }

    fn open_channel(
        &mut self,
        channel: u8,
        mode: OpenMode,
        delegate: Arc<ChannelDelegate>,
    ) -> Result<()> {
        self.close_channel()?;
        let target = rfcomm::SocketAddr::new(self.address, channel);
        debug!(
            "opening RFCOMM stream: addr={}, channel={}, mode={}",
            self.address, channel, mode
        );

        let phase = match mode {
            OpenMode::Async => Phase::Connecting(self.runtime.spawn(Stream::connect(target))),
            OpenMode::Sync => {
                let wait = self.config.sync_open_wait;
                match self
                    .runtime
                    .block_on(tokio::time::timeout(wait, Stream::connect(target)))
                {
                    Ok(Ok(stream)) => Phase::Connected(stream),
                    Ok(Err(e)) => {
                        return Err(BluetoothError::Rfcomm {
                            channel,
                            code: rfcomm_code(&e),
                        }
                        .into())
                    }
                    Err(_) => {
                        return Err(TransportError::Timeout(format!(
                            "RFCOMM channel {channel} did not connect within {wait:?}"
                        )))
                    }
                }
            }
        };

        self.channel = Some(BluezChannel {
            id: channel,
            delegate,
            phase,
        });
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let channel = self.channel.as_mut().ok_or(TransportError::NotOpen)?;
        let stream = match &mut channel.phase {
            Phase::Open(stream) | Phase::Connected(stream) => stream,
            Phase::Connecting(_) => return Err(TransportError::NotOpen),
            Phase::Closed => return Err(TransportError::Disconnected),
        };
        let timeout = self.config.write_timeout;
        match self
            .runtime
            .block_on(tokio::time::timeout(timeout, stream.write(bytes)))
        {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotConnected => {
                Err(TransportError::Disconnected)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(0),
        }
    }

    fn close_channel(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            if let Phase::Connecting(handle) = channel.phase {
                handle.abort();
            }
            debug!("released RFCOMM channel {}", channel.id);
        }
        Ok(())
    }
}
