//! `NetStack` over `std::net` sockets and rustls.
//!
//! # Design
//! A dispatch thread ticks every `dispatch_interval`. Each tick locks the
//! stack, finishes any lookups answered by their worker threads, then drives
//! every connection with non-blocking socket I/O and fires the resulting
//! callbacks while still holding the lock.
//!
//! - Name lookups and TCP connects block, so both run on short-lived worker
//!   threads and report back over a channel.
//! - Plaintext handed to `output` is reported through `sent` once all of its
//!   ciphertext has reached the socket.
//! - Delivered but unconsumed plaintext counts against `recv_window`; reading
//!   pauses until `recved` frees room.
//! - A clean close or EOF delivers the absent chain exactly once.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, ServerName};
use tracing::{debug, warn};

use crate::stack::{
    ConfigId, ConnId, ConnectionEvents, EventContext, FoundCallback, LookupStart, NetStack,
    RecvChain, StackError, StackGuard,
};
use crate::state::CallbackArg;

const IDLE_POLL_TICK: Duration = Duration::from_millis(500);
const SEGMENT_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct StdStackConfig {
    pub dispatch_interval: Duration,
    /// Plaintext bytes delivered to `recv` but not yet passed to `recved`.
    pub recv_window: usize,
}

impl Default for StdStackConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_millis(5),
            recv_window: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Handshaking,
    Established,
    PeerClosed,
}

struct Session {
    tls: ClientConnection,
    sock: TcpStream,
    eof: bool,
}

impl Session {
    /// Push queued ciphertext to the socket. True once nothing is left.
    fn flush(&mut self) -> Result<bool, StackError> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.sock) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(stack_error(&err)),
            }
        }
        Ok(true)
    }

    /// Read and decrypt whatever the socket has, stopping once `limit`
    /// plaintext bytes are buffered.
    fn fill(&mut self, limit: usize) -> Result<(), StackError> {
        while !self.eof {
            match self.tls.read_tls(&mut self.sock) {
                Ok(0) => self.eof = true,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(stack_error(&err)),
            }
            match self.tls.process_new_packets() {
                Ok(io_state) if io_state.plaintext_bytes_to_read() >= limit => return Ok(()),
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "TLS failure");
                    // Best effort: let the peer see the alert.
                    let _ = self.tls.write_tls(&mut self.sock);
                    return Err(StackError::Tls);
                }
            }
        }
        Ok(())
    }

    /// Take up to `budget` plaintext bytes. The flag is set when the peer has
    /// closed and nothing more will arrive.
    fn drain(&mut self, budget: usize) -> Result<(Vec<Bytes>, bool), StackError> {
        let mut segments = Vec::new();
        let mut taken = 0;
        while taken < budget {
            let mut buf = vec![0u8; (budget - taken).min(SEGMENT_SIZE)];
            match self.tls.reader().read(&mut buf) {
                Ok(0) => return Ok((segments, true)),
                Ok(n) => {
                    buf.truncate(n);
                    taken += n;
                    segments.push(Bytes::from(buf));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("peer closed without close_notify");
                    return Ok((segments, true));
                }
                Err(err) => return Err(stack_error(&err)),
            }
        }
        Ok((segments, false))
    }
}

struct Connection {
    tls_config: Arc<ClientConfig>,
    server_name: Option<ServerName<'static>>,
    arg: Option<CallbackArg>,
    events: Option<Arc<dyn ConnectionEvents>>,
    idle_poll_shots: u8,
    last_activity: Instant,
    phase: Phase,
    connecting: Option<Receiver<io::Result<TcpStream>>>,
    session: Option<Session>,
    queued: Vec<u8>,
    unflushed: usize,
    in_flight: usize,
}

impl Connection {
    fn new(tls_config: Arc<ClientConfig>) -> Self {
        Self {
            tls_config,
            server_name: None,
            arg: None,
            events: None,
            idle_poll_shots: 0,
            last_activity: Instant::now(),
            phase: Phase::Idle,
            connecting: None,
            session: None,
            queued: Vec::new(),
            unflushed: 0,
            in_flight: 0,
        }
    }

    fn start_session(&mut self, sock: TcpStream, addr: IpAddr) -> Result<(), StackError> {
        sock.set_nonblocking(true).map_err(|err| stack_error(&err))?;
        let _ = sock.set_nodelay(true);
        let name = self
            .server_name
            .clone()
            .unwrap_or(ServerName::IpAddress(addr.into()));
        let mut tls = ClientConnection::new(Arc::clone(&self.tls_config), name).map_err(|err| {
            warn!(%err, "failed to start TLS session");
            StackError::Tls
        })?;
        tls.set_buffer_limit(None);
        self.session = Some(Session {
            tls,
            sock,
            eof: false,
        });
        self.phase = Phase::Handshaking;
        Ok(())
    }
}

enum Delivery {
    Connected,
    Sent(u16),
    Recv(RecvChain),
    Closed,
    Poll,
}

struct PendingLookup {
    host: String,
    answer: Receiver<Option<IpAddr>>,
    found: FoundCallback,
}

pub struct StdStack {
    config: StdStackConfig,
    next_id: u32,
    tls_configs: HashMap<ConfigId, Arc<ClientConfig>>,
    conns: HashMap<ConnId, Connection>,
    peers: HashMap<ConnId, IpAddr>,
    dns_cache: HashMap<String, IpAddr>,
    lookups: Vec<PendingLookup>,
}

impl StdStack {
    pub fn new(config: StdStackConfig) -> Self {
        Self {
            config,
            next_id: 1,
            tls_configs: HashMap::new(),
            conns: HashMap::new(),
            peers: HashMap::new(),
            dns_cache: HashMap::new(),
            lookups: Vec::new(),
        }
    }

    /// Wrap a new stack in a guard and start its dispatch thread.
    pub fn spawn(config: StdStackConfig) -> io::Result<StackGuard<Self>> {
        let interval = config.dispatch_interval;
        let guard = StackGuard::new(Self::new(config));
        let weak = guard.downgrade();
        thread::Builder::new()
            .name("picofetch-dispatch".to_string())
            .spawn(move || {
                while let Some(stack) = weak.upgrade() {
                    stack.lock().tick();
                    drop(stack);
                    thread::sleep(interval);
                }
                debug!("dispatch thread exiting");
            })?;
        Ok(guard)
    }

    /// One dispatch pass: finish lookups, then drive every connection.
    pub fn tick(&mut self) {
        self.finish_lookups();
        let now = Instant::now();
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            match self.drive(id, now) {
                Ok(deliveries) => self.deliver(id, deliveries),
                Err(err) => self.fail(id, err),
            }
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn finish_lookups(&mut self) {
        let mut waiting = Vec::new();
        for lookup in mem::take(&mut self.lookups) {
            match lookup.answer.try_recv() {
                Ok(addr) => {
                    debug!(host = %lookup.host, ?addr, "lookup finished");
                    if let Some(addr) = addr {
                        self.dns_cache.insert(lookup.host, addr);
                    }
                    (lookup.found)(addr);
                }
                Err(TryRecvError::Empty) => waiting.push(lookup),
                Err(TryRecvError::Disconnected) => (lookup.found)(None),
            }
        }
        self.lookups = waiting;
    }

    fn drive(&mut self, id: ConnId, now: Instant) -> Result<Vec<Delivery>, StackError> {
        let window = self.config.recv_window;
        let peer = self.peers.get(&id).copied();
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();

        if conn.phase == Phase::Connecting {
            let Some(rx) = conn.connecting.as_ref() else {
                return Err(StackError::Abort);
            };
            match rx.try_recv() {
                Ok(Ok(sock)) => {
                    conn.connecting = None;
                    let addr = peer.ok_or(StackError::Arg)?;
                    conn.start_session(sock, addr)?;
                }
                Ok(Err(err)) => return Err(stack_error(&err)),
                Err(TryRecvError::Empty) => return Ok(out),
                Err(TryRecvError::Disconnected) => return Err(StackError::Abort),
            }
        }

        let phase = conn.phase;
        let Some(session) = conn.session.as_mut() else {
            return Ok(out);
        };
        if matches!(phase, Phase::Handshaking | Phase::Established) {
            session.flush()?;
            let room = window.saturating_sub(conn.in_flight);
            if phase == Phase::Handshaking || room > 0 {
                session.fill(room.max(1))?;
            }
            let flushed = session.flush()?;

            if phase == Phase::Handshaking {
                if session.tls.is_handshaking() {
                    if session.eof {
                        return Err(StackError::Closed);
                    }
                    return Ok(out);
                }
                conn.phase = Phase::Established;
                out.push(Delivery::Connected);
            }

            if flushed && conn.unflushed > 0 {
                let mut left = mem::take(&mut conn.unflushed);
                while left > 0 {
                    let chunk = left.min(usize::from(u16::MAX));
                    left -= chunk;
                    out.push(Delivery::Sent(chunk as u16));
                }
            }

            let (segments, closed) = session.drain(window.saturating_sub(conn.in_flight))?;
            if !segments.is_empty() {
                let chain = RecvChain::from_segments(segments);
                conn.in_flight += chain.tot_len();
                out.push(Delivery::Recv(chain));
            }
            if closed {
                conn.phase = Phase::PeerClosed;
                out.push(Delivery::Closed);
            }
        }

        if out.is_empty() {
            let idle = IDLE_POLL_TICK * u32::from(conn.idle_poll_shots);
            if conn.phase == Phase::Established
                && conn.idle_poll_shots > 0
                && now.duration_since(conn.last_activity) >= idle
            {
                conn.last_activity = now;
                out.push(Delivery::Poll);
            }
        } else {
            conn.last_activity = now;
        }
        Ok(out)
    }

    fn slots(&self, id: ConnId) -> Option<(Arc<dyn ConnectionEvents>, CallbackArg)> {
        let conn = self.conns.get(&id)?;
        Some((conn.events.clone()?, conn.arg.clone()?))
    }

    fn deliver(&mut self, id: ConnId, deliveries: Vec<Delivery>) {
        if deliveries.is_empty() {
            return;
        }
        let Some((events, arg)) = self.slots(id) else {
            return;
        };
        for delivery in deliveries {
            let outcome = match delivery {
                Delivery::Connected => events.connected(&arg, id),
                Delivery::Sent(len) => events.sent(&arg, id, len),
                Delivery::Recv(chain) => events.recv(&arg, self, id, Some(chain), Ok(())),
                Delivery::Closed => events.recv(&arg, self, id, None, Ok(())),
                Delivery::Poll => events.poll(&arg, id),
            };
            if let Err(err) = outcome {
                debug!(conn = %id, %err, "callback returned an error");
            }
        }
    }

    /// Forget the connection, then report the error.
    fn fail(&mut self, id: ConnId, err: StackError) {
        let Some(conn) = self.conns.remove(&id) else {
            return;
        };
        self.peers.remove(&id);
        warn!(conn = %id, %err, "connection failed");
        if let Some(session) = conn.session {
            let _ = session.sock.shutdown(Shutdown::Both);
        }
        if let (Some(events), Some(arg)) = (conn.events, conn.arg) {
            events.error(arg, self, err);
        }
    }
}

impl EventContext for StdStack {
    fn recved(&mut self, conn: ConnId, len: usize) {
        if let Some(conn) = self.conns.get_mut(&conn) {
            conn.in_flight = conn.in_flight.saturating_sub(len);
        }
    }

    fn tls_free_config(&mut self, config: ConfigId) {
        if self.tls_configs.remove(&config).is_none() {
            warn!(config = config.raw(), "freeing unknown TLS configuration");
        }
    }
}

impl NetStack for StdStack {
    fn gethostbyname(&mut self, host: &str, found: FoundCallback) -> Result<LookupStart, StackError> {
        if let Ok(addr) = host.parse::<IpAddr>() {
            return Ok(LookupStart::Resolved(addr));
        }
        if let Some(addr) = self.dns_cache.get(host) {
            return Ok(LookupStart::Resolved(*addr));
        }

        let (tx, answer) = mpsc::channel();
        let name = host.to_string();
        thread::Builder::new()
            .name("picofetch-dns".to_string())
            .spawn(move || {
                let _ = tx.send(lookup_host(&name));
            })
            .map_err(|_| StackError::Mem)?;
        self.lookups.push(PendingLookup {
            host: host.to_string(),
            answer,
            found,
        });
        Ok(LookupStart::InProgress)
    }

    fn tls_create_config_client(&mut self, trust_anchor: &[u8]) -> Option<ConfigId> {
        let config = match client_config(trust_anchor) {
            Ok(config) => config,
            Err(reason) => {
                warn!(%reason, "rejecting trust anchor");
                return None;
            }
        };
        let id = ConfigId::new(self.next_id());
        self.tls_configs.insert(id, Arc::new(config));
        Some(id)
    }

    fn tls_new(&mut self, config: ConfigId) -> Option<ConnId> {
        let tls_config = Arc::clone(self.tls_configs.get(&config)?);
        let id = ConnId::new(self.next_id());
        self.conns.insert(id, Connection::new(tls_config));
        Some(id)
    }

    fn tls_set_hostname(&mut self, conn: ConnId, host: &str) -> Result<(), StackError> {
        let conn = self.conns.get_mut(&conn).ok_or(StackError::Arg)?;
        let name = ServerName::try_from(host.to_string()).map_err(|_| StackError::Arg)?;
        conn.server_name = Some(name);
        Ok(())
    }

    fn set_arg(&mut self, conn: ConnId, arg: CallbackArg) {
        if let Some(conn) = self.conns.get_mut(&conn) {
            conn.arg = Some(arg);
        }
    }

    fn set_events(&mut self, conn: ConnId, events: Arc<dyn ConnectionEvents>, idle_poll_shots: u8) {
        if let Some(conn) = self.conns.get_mut(&conn) {
            conn.events = Some(events);
            conn.idle_poll_shots = idle_poll_shots;
        }
    }

    fn connect(&mut self, id: ConnId, addr: IpAddr, port: u16) -> Result<(), StackError> {
        let conn = self.conns.get_mut(&id).ok_or(StackError::Arg)?;
        if conn.phase != Phase::Idle {
            return Err(StackError::IsConnected);
        }

        let (tx, rx) = mpsc::channel();
        let target = SocketAddr::new(addr, port);
        thread::Builder::new()
            .name("picofetch-connect".to_string())
            .spawn(move || {
                let _ = tx.send(TcpStream::connect(target));
            })
            .map_err(|_| StackError::Mem)?;
        conn.connecting = Some(rx);
        conn.phase = Phase::Connecting;
        self.peers.insert(id, addr);
        Ok(())
    }

    fn write(&mut self, conn: ConnId, data: &[u8]) -> Result<(), StackError> {
        let conn = self.conns.get_mut(&conn).ok_or(StackError::Conn)?;
        match conn.phase {
            Phase::Handshaking | Phase::Established => {
                conn.queued.extend_from_slice(data);
                Ok(())
            }
            _ => Err(StackError::Conn),
        }
    }

    fn output(&mut self, conn: ConnId) -> Result<(), StackError> {
        let conn = self.conns.get_mut(&conn).ok_or(StackError::Conn)?;
        let session = conn.session.as_mut().ok_or(StackError::Conn)?;
        if conn.queued.is_empty() {
            return Ok(());
        }
        let data = mem::take(&mut conn.queued);
        session.tls.writer().write_all(&data).map_err(|_| StackError::Mem)?;
        conn.unflushed += data.len();
        Ok(())
    }

    fn close(&mut self, id: ConnId) -> Result<(), StackError> {
        let conn = self.conns.remove(&id).ok_or(StackError::Arg)?;
        self.peers.remove(&id);
        if let Some(mut session) = conn.session {
            session.tls.send_close_notify();
            let _ = session.flush();
            let _ = session.sock.shutdown(Shutdown::Both);
        }
        debug!(conn = %id, "closed");
        Ok(())
    }
}

fn lookup_host(host: &str) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = (host, 0).to_socket_addrs().ok()?.map(|a| a.ip()).collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

/// Build a client configuration whose only root is `trust_anchor`.
///
/// The anchor may be PEM or DER; a trailing NUL is ignored.
fn client_config(trust_anchor: &[u8]) -> Result<ClientConfig, String> {
    let anchor = trust_anchor.strip_suffix(&[0]).unwrap_or(trust_anchor);
    if anchor.is_empty() {
        return Err("empty trust anchor".to_string());
    }

    let certs: Vec<CertificateDer<'static>> = if anchor.starts_with(b"-----BEGIN") {
        CertificateDer::pem_slice_iter(anchor)
            .collect::<Result<_, _>>()
            .map_err(|err| format!("invalid PEM: {err}"))?
    } else {
        vec![CertificateDer::from(anchor.to_vec())]
    };
    if certs.is_empty() {
        return Err("no certificate in trust anchor".to_string());
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|err| format!("unusable certificate: {err}"))?;
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| err.to_string())?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

fn stack_error(err: &io::Error) -> StackError {
    match err.kind() {
        io::ErrorKind::WouldBlock => StackError::WouldBlock,
        io::ErrorKind::TimedOut => StackError::Timeout,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => StackError::Reset,
        io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => StackError::Abort,
        io::ErrorKind::AddrInUse => StackError::Use,
        io::ErrorKind::AddrNotAvailable => StackError::Route,
        io::ErrorKind::NotConnected => StackError::Conn,
        io::ErrorKind::UnexpectedEof => StackError::Closed,
        io::ErrorKind::OutOfMemory => StackError::Mem,
        io::ErrorKind::InvalidInput => StackError::Arg,
        _ => StackError::Conn,
    }
}
