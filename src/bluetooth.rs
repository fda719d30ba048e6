//! BlueZ kernel sockets: addresses, RFCOMM and L2CAP connects, the SDP
//! client and the default [`RadioStack`] built from them.
//!
//! Works against an already-paired device without root. Every socket is
//! non-blocking; readiness is driven from [`EventLoop::run_for`] on the
//! executor thread.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{getsockopt, sockopt};

use crate::errors::{BluetoothError, Result, TransportError};
use crate::executor::EventLoop;
use crate::radio::{ChannelDelegate, OpenMode, RadioBackend, RadioConfig, RadioStack};
use crate::sdp::{self, ServiceRecord};

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_L2CAP: libc::c_int = 0;
const BTPROTO_RFCOMM: libc::c_int = 3;

/// L2CAP PSM of the SDP server.
pub const SDP_PSM: u16 = 0x0001;

const READ_CHUNK: usize = 4096;
const SDP_MTU: usize = 4096;

// ============================================================================
// Addresses
// ============================================================================

/// Bluetooth device address, stored most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// `bdaddr_t` stores the bytes in reverse order compared to the usual
    /// string form.
    fn to_bdaddr_t(self) -> [u8; 6] {
        let mut out = self.0;
        out.reverse();
        out
    }
}

impl FromStr for BdAddr {
    type Err = BluetoothError;

    /// Accepts `AA:BB:CC:DD:EE:FF` or `AA-BB-CC-DD-EE-FF`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || BluetoothError::InvalidAddress(s.to_string());
        let sep = if s.contains('-') { '-' } else { ':' };
        let parts: Vec<&str> = s.split(sep).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

// ============================================================================
// Raw sockets
// ============================================================================

#[repr(C)]
struct SockAddrRc {
    rc_family: libc::sa_family_t,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

#[repr(C)]
struct SockAddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

fn bt_socket(kind: libc::c_int, protocol: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            kind | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            protocol,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Start a non-blocking connect. `Ok(true)` if it completed immediately.
fn start_connect<A>(fd: &OwnedFd, addr: &A) -> io::Result<bool> {
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            addr as *const A as *const libc::sockaddr,
            mem::size_of::<A>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EAGAIN) => Ok(false),
        _ => Err(err),
    }
}

fn poll_timeout(timeout: Duration) -> PollTimeout {
    let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
    PollTimeout::from(ms)
}

/// Wait for `flags` on `fd`. Returns the reported events, empty on timeout.
fn wait_for(fd: &OwnedFd, flags: PollFlags, timeout: Duration) -> io::Result<PollFlags> {
    let mut fds = [PollFd::new(fd.as_fd(), flags)];
    match poll(&mut fds, poll_timeout(timeout)) {
        Ok(0) => Ok(PollFlags::empty()),
        Ok(_) => Ok(fds[0].revents().unwrap_or(PollFlags::empty())),
        Err(nix::errno::Errno::EINTR) => Ok(PollFlags::empty()),
        Err(e) => Err(e.into()),
    }
}

/// Pending error on a socket after a non-blocking connect.
fn socket_error(fd: &OwnedFd) -> io::Result<i32> {
    getsockopt(fd, sockopt::SocketError).map_err(io::Error::from)
}

/// Finish a connect started by `start_connect`, waiting up to `timeout`.
/// Returns the native error code on failure.
fn finish_connect(fd: &OwnedFd, timeout: Duration) -> std::result::Result<(), ConnectFailure> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ConnectFailure::TimedOut);
        }
        let events = wait_for(fd, PollFlags::POLLOUT, remaining).map_err(ConnectFailure::Io)?;
        if events.is_empty() {
            continue;
        }
        return match socket_error(fd).map_err(ConnectFailure::Io)? {
            0 => Ok(()),
            code => Err(ConnectFailure::Refused(code)),
        };
    }
}

#[derive(Debug)]
enum ConnectFailure {
    Refused(i32),
    TimedOut,
    Io(io::Error),
}

fn fd_read(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn fd_write(fd: &OwnedFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn rfcomm_addr(address: BdAddr, channel: u8) -> SockAddrRc {
    SockAddrRc {
        rc_family: AF_BLUETOOTH as libc::sa_family_t,
        rc_bdaddr: address.to_bdaddr_t(),
        rc_channel: channel,
    }
}

/// Connect an L2CAP SEQPACKET socket to `psm`, bounded by `timeout`.
pub fn connect_l2cap(address: BdAddr, psm: u16, timeout: Duration) -> Result<OwnedFd> {
    let fd = bt_socket(libc::SOCK_SEQPACKET, BTPROTO_L2CAP)?;
    let addr = SockAddrL2 {
        l2_family: AF_BLUETOOTH as libc::sa_family_t,
        l2_psm: psm.to_le(),
        l2_bdaddr: address.to_bdaddr_t(),
        l2_cid: 0,
        l2_bdaddr_type: 0,
    };
    debug!("opening L2CAP socket: addr={}, psm={:#06X}", address, psm);

    if !start_connect(&fd, &addr)? {
        match finish_connect(&fd, timeout) {
            Ok(()) => {}
            Err(ConnectFailure::Refused(code)) => {
                return Err(BluetoothError::Baseband(format!(
                    "L2CAP psm {psm:#06X}: {}",
                    io::Error::from_raw_os_error(code)
                ))
                .into())
            }
            Err(ConnectFailure::TimedOut) => {
                return Err(TransportError::Timeout(format!(
                    "L2CAP connect to {address} after {timeout:?}"
                )))
            }
            Err(ConnectFailure::Io(e)) => return Err(e.into()),
        }
    }
    Ok(fd)
}

// ============================================================================
// SDP client
// ============================================================================

/// SDP client over an L2CAP connection to PSM 1. Holding it open keeps the
/// baseband link to the device up.
pub struct SdpClient {
    fd: OwnedFd,
    timeout: Duration,
}

impl SdpClient {
    pub fn connect(address: BdAddr, timeout: Duration) -> Result<Self> {
        let fd = connect_l2cap(address, SDP_PSM, timeout)?;
        Ok(Self { fd, timeout })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Send one request PDU and wait for one response PDU.
    pub fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut sent = 0;
        while sent < request.len() {
            match fd_write(&self.fd, &request[sent..]) {
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_for(&self.fd, PollFlags::POLLOUT, Duration::from_millis(50))?;
                }
                Err(e) => return Err(e.into()),
            }
            if Instant::now() >= deadline {
                return Err(TransportError::Timeout("SDP request not sent".into()));
            }
        }

        let mut buf = vec![0u8; SDP_MTU];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout(format!(
                    "no SDP response within {:?}",
                    self.timeout
                )));
            }
            let events = wait_for(&self.fd, PollFlags::POLLIN, remaining)?;
            if events.is_empty() {
                continue;
            }
            match fd_read(&self.fd, &mut buf) {
                Ok(0) => return Err(BluetoothError::Sdp("SDP server closed the connection".into()).into()),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Every record reachable over L2CAP, which covers all RFCOMM services.
    pub fn search(&mut self) -> Result<Vec<ServiceRecord>> {
        sdp::search_attributes(sdp::UUID_L2CAP, |request| self.exchange(request))
    }
}

// ============================================================================
// Socket stack
// ============================================================================

enum ChannelPhase {
    Connecting,
    /// Connected inside `open_channel`; the callback fires on the next pump.
    Connected,
    Open,
    Closed,
}

struct SocketChannel {
    id: u8,
    fd: OwnedFd,
    delegate: Arc<ChannelDelegate>,
    phase: ChannelPhase,
}

/// Native stack over BlueZ kernel sockets. The baseband link is the SDP
/// L2CAP connection.
pub struct SocketStack {
    address: BdAddr,
    config: RadioConfig,
    sdp: Option<SdpClient>,
    records: Vec<ServiceRecord>,
    channel: Option<SocketChannel>,
}

impl SocketStack {
    pub fn new(address: BdAddr, config: RadioConfig) -> Self {
        Self {
            address,
            config,
            sdp: None,
            records: Vec::new(),
            channel: None,
        }
    }

    fn pump_channel(&mut self, slice: Duration) {
        let Some(channel) = self.channel.as_mut() else {
            thread::sleep(slice);
            return;
        };

        let flags = match channel.phase {
            ChannelPhase::Connected => {
                channel.phase = ChannelPhase::Open;
                channel.delegate.on_open_complete(Ok(()));
                PollFlags::POLLIN
            }
            ChannelPhase::Connecting => PollFlags::POLLOUT,
            ChannelPhase::Open => PollFlags::POLLIN,
            ChannelPhase::Closed => {
                thread::sleep(slice);
                return;
            }
        };

        let events = match wait_for(&channel.fd, flags, slice) {
            Ok(events) => events,
            Err(e) => {
                warn!("poll on RFCOMM channel {} failed: {}", channel.id, e);
                thread::sleep(slice);
                return;
            }
        };
        if events.is_empty() {
            return;
        }

        match channel.phase {
            ChannelPhase::Connecting => {
                let status = match socket_error(&channel.fd) {
                    Ok(0) => Ok(()),
                    Ok(code) => Err(code),
                    Err(e) => Err(e.raw_os_error().unwrap_or(libc::EIO)),
                };
                channel.phase = if status.is_ok() {
                    ChannelPhase::Open
                } else {
                    ChannelPhase::Closed
                };
                channel.delegate.on_open_complete(status);
            }
            ChannelPhase::Open => read_available(channel, events),
            ChannelPhase::Connected | ChannelPhase::Closed => {}
        }
    }
}

fn read_available(channel: &mut SocketChannel, events: PollFlags) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match fd_read(&channel.fd, &mut buf) {
            Ok(0) => break,
            Ok(n) => channel.delegate.on_data(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if events.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
                    break;
                }
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("RFCOMM channel {} read failed: {}", channel.id, e);
                break;
            }
        }
    }
    info!("RFCOMM channel {} closed by remote", channel.id);
    channel.phase = ChannelPhase::Closed;
    channel.delegate.on_closed();
}

impl EventLoop for SocketStack {
    fn run_for(&mut self, slice: Duration) {
        self.pump_channel(slice);
    }
}

impl RadioStack for SocketStack {
    fn is_connected(&self) -> bool {
        self.sdp.is_some()
    }

    fn open_baseband(&mut self, timeout: Duration) -> Result<()> {
        if self.sdp.is_some() {
            return Ok(());
        }
        let client = SdpClient::connect(self.address, timeout).map_err(|e| match e {
            TransportError::Bluetooth(_) | TransportError::Timeout(_) => e,
            other => BluetoothError::Baseband(other.to_string()).into(),
        })?;
        debug!("baseband up via SDP socket fd={}", client.raw_fd());
        self.sdp = Some(client);
        Ok(())
    }

    fn close_baseband(&mut self) -> Result<()> {
        self.sdp = None;
        Ok(())
    }

    /// Raw sockets have no access to the remote name.
    fn device_name(&self) -> Option<String> {
        None
    }

    fn query_services(&mut self, timeout: Duration) -> Result<()> {
        if self.sdp.is_none() {
            self.open_baseband(timeout)?;
        }
        let client = self.sdp.as_mut().ok_or(TransportError::NotOpen)?;
        client.timeout = timeout;
        match client.search() {
            Ok(records) => {
                self.records = records;
                Ok(())
            }
            Err(e) => {
                // The session state is unknown after a failed transaction.
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
        self.channel = None;
        let fd = bt_socket(libc::SOCK_STREAM, BTPROTO_RFCOMM)?;
        let addr = rfcomm_addr(self.address, channel);
        debug!(
            "opening RFCOMM socket: addr={}, channel={}, mode={}",
            self.address, channel, mode
        );

        let rejected = |code: i32| TransportError::from(BluetoothError::Rfcomm { channel, code });
        let connected = match start_connect(&fd, &addr) {
            Ok(done) => done,
            Err(e) => return Err(rejected(e.raw_os_error().unwrap_or(libc::EIO))),
        };

        let phase = match (connected, mode) {
            (true, _) => ChannelPhase::Connected,
            (false, OpenMode::Async) => ChannelPhase::Connecting,
            (false, OpenMode::Sync) => match finish_connect(&fd, self.config.sync_open_wait) {
                Ok(()) => ChannelPhase::Connected,
                Err(ConnectFailure::Refused(code)) => return Err(rejected(code)),
                Err(ConnectFailure::TimedOut) => {
                    return Err(TransportError::Timeout(format!(
                        "RFCOMM channel {channel} did not connect within {:?}",
                        self.config.sync_open_wait
                    )))
                }
                Err(ConnectFailure::Io(e)) => return Err(e.into()),
            },
        };

        self.channel = Some(SocketChannel {
            id: channel,
            fd,
            delegate,
            phase,
        });
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        let channel = self.channel.as_ref().ok_or(TransportError::NotOpen)?;
        if !matches!(channel.phase, ChannelPhase::Open | ChannelPhase::Connected) {
            return Err(TransportError::Disconnected);
        }
        match fd_write(&channel.fd, bytes) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_for(&channel.fd, PollFlags::POLLOUT, self.config.pump_interval)?;
                Ok(0)
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Err(TransportError::Disconnected),
            Err(e) => Err(e.into()),
        }
    }

    fn close_channel(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            debug!("closing RFCOMM socket for channel {}", channel.id);
        }
        Ok(())
    }
}

/// Default native backend: BlueZ kernel sockets through `libc` and `nix`.
#[derive(Debug, Clone, Default)]
pub struct SocketBackend;

impl RadioBackend for SocketBackend {
    type Stack = SocketStack;

    fn name(&self) -> &'static str {
        "bluez-socket"
    }

    fn attach(&self, address: BdAddr, config: &RadioConfig) -> Result<SocketStack> {
        // Fails early when the kernel has no Bluetooth support.
        bt_socket(libc::SOCK_STREAM, BTPROTO_RFCOMM).map_err(|e| {
            BluetoothError::Baseband(format!("bluetooth sockets unavailable: {e}"))
        })?;
        Ok(SocketStack::new(address, config.clone()))
    }
}
