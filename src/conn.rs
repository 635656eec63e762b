// CLASSIFICATION: COMMUNITY
// Filename: conn.rs v0.2
// Author: Lukas Bower
// Date Modified: 2026-07-26

//! Connection slots.
//!
//! A [`Conn`] binds one textual control channel to at most one OS socket or
//! listener. The ctl file parses line commands into [`Command`] values and
//! dispatches them under the slot lock; the data file forwards bytes to the
//! socket. A slot tears its socket down when the last open handle on any of
//! its files is closed.

use std::fmt;
use std::io::{Read, Write};
use std::net::{
    Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs, UdpSocket,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use log::{debug, info};
use socket2::{SockRef, TcpKeepalive};

use crate::trees::{can_open, File, FileHandle, HandleRef, OpenMode};

/// Socket family a slot belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Network {
    /// Stream sockets.
    Tcp,
    /// Datagram sockets, connected to a single peer.
    Udp,
}

impl Network {
    /// Directory name of the family.
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a slot, as surfaced by the status file.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// No socket and no listener.
    Closed,
    /// A listener is bound; accepts happen through the listen file.
    Announcing,
    /// A socket is connected; the data file carries its bytes.
    Established,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnState::Closed => "Closed",
            ConnState::Announcing => "Announcing",
            ConnState::Established => "Established",
        })
    }
}

/// Established socket, one variant per family.
pub(crate) enum Stream {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Stream {
    fn dial(network: Network, address: &str) -> Result<Self> {
        match network {
            Network::Tcp => Ok(Stream::Tcp(TcpStream::connect(address)?)),
            Network::Udp => {
                let target = address
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| anyhow!("cannot resolve address: {address}"))?;
                let socket = if target.is_ipv4() {
                    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?
                } else {
                    UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0))?
                };
                socket.connect(target)?;
                Ok(Stream::Udp(socket))
            }
        }
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => {
                let mut s: &TcpStream = s;
                s.read(buf)
            }
            Stream::Udp(s) => s.recv(buf),
        }
    }

    pub(crate) fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => {
                let mut s: &TcpStream = s;
                s.write(buf)
            }
            Stream::Udp(s) => s.send(buf),
        }
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Stream::Tcp(s) => s.local_addr(),
            Stream::Udp(s) => s.local_addr(),
        }
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match self {
            Stream::Tcp(s) => s.peer_addr(),
            Stream::Udp(s) => s.peer_addr(),
        }
    }

    fn set_keepalive(&self, period: Duration) -> Result<()> {
        match self {
            Stream::Tcp(s) => {
                let params = TcpKeepalive::new().with_time(period);
                SockRef::from(s).set_tcp_keepalive(&params)?;
                Ok(())
            }
            Stream::Udp(_) => bail!("keepalive only valid on tcp connections"),
        }
    }

    fn shutdown(&self) {
        if let Stream::Tcp(s) = self {
            let _ = s.shutdown(Shutdown::Both);
        }
    }
}

/// Parsed ctl command.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Connect { host: String, port: u16 },
    Announce { port: u16 },
    Accept,
    Keepalive { period: Duration },
    Hangup,
}

fn parse_port(s: &str) -> Result<u16> {
    match s.parse::<u64>() {
        Ok(n) if n <= 65535 => Ok(n as u16),
        _ => bail!("invalid port: {s}"),
    }
}

/// Parse one ctl write: whitespace-trimmed, space-tokenized, one command
/// per write.
pub(crate) fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim();
    let mut tokens = line.split(' ');
    let cmd = tokens.next().unwrap_or("");
    let args: Vec<&str> = tokens.collect();

    match cmd {
        "connect" => {
            if args.len() == 2 {
                bail!("manual local port assignment not supported");
            }
            if args.len() != 1 {
                bail!("invalid address");
            }
            let parts: Vec<&str> = args[0].split('!').collect();
            if parts.len() != 2 {
                bail!("invalid address");
            }
            Ok(Command::Connect {
                host: parts[0].to_string(),
                port: parse_port(parts[1])?,
            })
        }
        "announce" => {
            if args.len() != 1 {
                bail!("invalid arguments");
            }
            let port = if args[0] == "*" { "0" } else { args[0] };
            Ok(Command::Announce {
                port: parse_port(port)?,
            })
        }
        "accept" => Ok(Command::Accept),
        "keepalive" => {
            let period = match args.len() {
                0 => Duration::from_secs(30),
                1 => {
                    let ms: u64 = args[0]
                        .parse()
                        .map_err(|_| anyhow!("invalid keepalive period: {}", args[0]))?;
                    Duration::from_millis(ms)
                }
                _ => bail!("invalid arguments"),
            };
            Ok(Command::Keepalive { period })
        }
        "hangup" | "reject" => Ok(Command::Hangup),
        "bind" | "ttl" | "tos" | "ignoreadvice" | "addmulti" | "remmulti" | "checksum"
        | "tcpporthogdefence" => {
            bail!("unimplemented command: {line}")
        }
        _ => bail!("unimplemented command: {line}"),
    }
}

struct Inner {
    stream: Option<Arc<Stream>>,
    listener: Option<Arc<TcpListener>>,
    address: String,
    connect_pending: bool,
    owned: u32,
    state: ConnState,
}

/// One connection slot: the state machine behind a numbered subtree.
pub struct Conn {
    network: Network,
    inner: Mutex<Inner>,
}

impl Conn {
    /// Fresh slot with no socket.
    pub fn new(network: Network) -> Self {
        Self {
            network,
            inner: Mutex::new(Inner {
                stream: None,
                listener: None,
                address: String::new(),
                connect_pending: false,
                owned: 0,
                state: ConnState::Closed,
            }),
        }
    }

    /// Slot created around an already-accepted socket.
    pub(crate) fn accepted(network: Network, stream: TcpStream) -> Self {
        let conn = Self::new(network);
        {
            let mut inner = conn.inner.lock().unwrap();
            inner.stream = Some(Arc::new(Stream::Tcp(stream)));
            inner.state = ConnState::Established;
        }
        conn
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.inner.lock().unwrap().state
    }

    /// Parse and execute one ctl command.
    pub fn command(&self, line: &str) -> Result<()> {
        let cmd = parse_command(line)?;
        let mut inner = self.inner.lock().unwrap();
        match cmd {
            Command::Connect { host, port } => {
                inner.address = format!("{host}:{port}");
                inner.connect_pending = true;
                debug!("connect queued: {}", inner.address);
                Ok(())
            }
            Command::Announce { port } => {
                let listener = match self.network {
                    // ":port" listens on every family: the v6 wildcard
                    // accepts both on dual-stack hosts, with a v4 fallback
                    // where v6 is unavailable.
                    Network::Tcp => match TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)) {
                        Ok(listener) => listener,
                        Err(_) => TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))?,
                    },
                    Network::Udp => bail!("announce not supported on udp"),
                };
                inner.address = format!(":{port}");
                inner.listener = Some(Arc::new(listener));
                inner.state = ConnState::Announcing;
                info!("announce: {}", inner.address);
                Ok(())
            }
            Command::Accept => Ok(()),
            Command::Keepalive { period } => {
                let stream = match inner.stream.clone() {
                    Some(s) => s,
                    None => bail!("keepalive only valid on tcp connections"),
                };
                drop(inner);
                debug!("keepalive: {period:?}");
                stream.set_keepalive(period)
            }
            Command::Hangup => {
                Self::hangup_locked(&mut inner);
                Ok(())
            }
        }
    }

    fn hangup_locked(inner: &mut Inner) {
        if let Some(stream) = inner.stream.take() {
            debug!("hangup");
            stream.shutdown();
        }
        inner.listener = None;
        inner.connect_pending = false;
        inner.state = ConnState::Closed;
    }

    /// Close the socket and the listener, if any, and mark the slot Closed.
    pub fn hangup(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::hangup_locked(&mut inner);
    }

    /// Perform the pending dial, if one was queued by `connect`.
    ///
    /// Holds the slot lock for the duration of the dial; connect is a
    /// one-shot transition and concurrent openers must observe either the
    /// pending state or the established socket, never a half-dialed slot.
    pub(crate) fn dial(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.connect_pending {
            inner.connect_pending = false;
            let stream = Stream::dial(self.network, &inner.address)?;
            info!(
                "connected: {}",
                stream.peer_addr().map(|a| a.to_string()).unwrap_or_default()
            );
            inner.stream = Some(Arc::new(stream));
            inner.state = ConnState::Established;
        }
        if inner.stream.is_none() {
            bail!("not connected");
        }
        Ok(())
    }

    /// Block on the announced listener and hand back the accepted socket.
    pub(crate) fn accept(&self) -> Result<TcpStream> {
        let listener = {
            let inner = self.inner.lock().unwrap();
            match inner.listener.clone() {
                Some(l) => l,
                None => bail!("not announced"),
            }
        };
        // Accept runs without the slot lock so ctl stays responsive while
        // the walk blocks.
        let (stream, peer) = listener.accept()?;
        info!("accepted: {peer}");
        Ok(stream)
    }

    pub(crate) fn stream(&self) -> Result<Arc<Stream>> {
        self.inner
            .lock()
            .unwrap()
            .stream
            .clone()
            .ok_or_else(|| anyhow!("not connected"))
    }

    /// Record one more live handle on this slot's files.
    pub fn own(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.owned += 1;
    }

    /// Drop one live handle; the last one tears the socket down.
    ///
    /// Only the socket: an announced listener survives the counter hitting
    /// zero, so a client may clunk its control FID and keep accepting
    /// through listen walks on other FIDs. The listener goes away on an
    /// explicit hangup.
    pub fn disown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.owned -= 1;
        if inner.owned == 0 {
            if let Some(stream) = inner.stream.take() {
                debug!("hangup");
                stream.shutdown();
                inner.state = ConnState::Closed;
            }
        }
    }

    /// Local socket address in `host!port` form, empty without a socket.
    pub(crate) fn local_text(&self) -> Vec<u8> {
        let stream = self.inner.lock().unwrap().stream.clone();
        stream
            .and_then(|s| s.local_addr().ok())
            .map(|a| bang_format(a).into_bytes())
            .unwrap_or_default()
    }

    /// Remote socket address in `host!port` form, empty without a socket.
    pub(crate) fn remote_text(&self) -> Vec<u8> {
        let stream = self.inner.lock().unwrap().stream.clone();
        stream
            .and_then(|s| s.peer_addr().ok())
            .map(|a| bang_format(a).into_bytes())
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn listener_addr(&self) -> Option<SocketAddr> {
        let inner = self.inner.lock().unwrap();
        inner.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

/// Plan 9 address convention: the first `:` of the OS form becomes `!`.
fn bang_format(addr: SocketAddr) -> String {
    addr.to_string().replacen(':', "!", 1)
}

/// The per-slot command/response file.
///
/// Writes carry commands; reads drain the response buffer, which the family
/// handler pre-loads with the decimal slot number so the clone-then-read
/// pattern yields the slot id.
pub struct CtlFile {
    name: String,
    perm: u32,
    owner: String,
    group: String,
    conn: Arc<Conn>,
    buf: Arc<Mutex<Vec<u8>>>,
}

impl CtlFile {
    /// Ctl file for `conn`.
    pub fn new(name: &str, perm: u32, owner: &str, group: &str, conn: Arc<Conn>) -> Self {
        Self {
            name: name.to_string(),
            perm,
            owner: owner.to_string(),
            group: group.to_string(),
            conn,
            buf: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append response bytes for the client to read.
    pub(crate) fn response(&self, bytes: &[u8]) {
        self.buf.lock().unwrap().extend_from_slice(bytes);
    }
}

impl File for CtlFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn perm(&self) -> u32 {
        self.perm
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn open(&self, user: &str, mode: OpenMode) -> Result<HandleRef> {
        if !can_open(self.perm, &self.owner, user, mode) {
            bail!("permission denied");
        }
        Ok(Arc::new(CtlHandle {
            conn: self.conn.clone(),
            buf: self.buf.clone(),
        }))
    }
}

struct CtlHandle {
    conn: Arc<Conn>,
    buf: Arc<Mutex<Vec<u8>>>,
}

impl FileHandle for CtlHandle {
    fn read_at(&self, count: usize, _offset: u64) -> Result<Vec<u8>> {
        let mut buf = self.buf.lock().unwrap();
        let n = count.min(buf.len());
        Ok(buf.drain(..n).collect())
    }

    fn write_at(&self, data: &[u8], _offset: u64) -> Result<usize> {
        let line = std::str::from_utf8(data).map_err(|_| anyhow!("ctl command is not utf-8"))?;
        self.conn.command(line)?;
        Ok(data.len())
    }
}

/// The per-slot byte-stream file.
///
/// The first open performs the dial queued by `connect`. End-of-stream
/// latches the file dead; later reads and writes fail with a closed-
/// connection error.
pub struct DataFile {
    name: String,
    perm: u32,
    owner: String,
    group: String,
    conn: Arc<Conn>,
    dead: Arc<AtomicBool>,
}

impl DataFile {
    /// Data file for `conn`.
    pub fn new(name: &str, perm: u32, owner: &str, group: &str, conn: Arc<Conn>) -> Self {
        Self {
            name: name.to_string(),
            perm,
            owner: owner.to_string(),
            group: group.to_string(),
            conn,
            dead: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl File for DataFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn perm(&self) -> u32 {
        self.perm
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn open(&self, user: &str, mode: OpenMode) -> Result<HandleRef> {
        if !can_open(self.perm, &self.owner, user, mode) {
            bail!("permission denied");
        }
        self.conn.dial()?;
        Ok(Arc::new(DataHandle {
            conn: self.conn.clone(),
            dead: self.dead.clone(),
        }))
    }
}

struct DataHandle {
    conn: Arc<Conn>,
    dead: Arc<AtomicBool>,
}

impl FileHandle for DataHandle {
    fn read_at(&self, count: usize, _offset: u64) -> Result<Vec<u8>> {
        if self.dead.load(Ordering::Acquire) {
            bail!("connection closed");
        }
        let stream = self.conn.stream()?;
        let mut buf = vec![0u8; count];
        let n = stream.read(&mut buf)?;
        if n == 0 && count > 0 {
            self.dead.store(true, Ordering::Release);
        }
        buf.truncate(n);
        Ok(buf)
    }

    fn write_at(&self, data: &[u8], _offset: u64) -> Result<usize> {
        if self.dead.load(Ordering::Acquire) {
            bail!("connection closed");
        }
        let stream = self.conn.stream()?;
        Ok(stream.write(data)?)
    }
}
