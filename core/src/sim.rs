//! Scripted in-memory stack.
//!
//! `SimStack` implements `NetStack` without any network. A `Script` decides
//! how each call behaves and which callbacks fire afterwards; a dispatch
//! thread delivers one batch of callbacks per tick with the stack locked, the
//! same way a real stack's event context would. Every allocation and release
//! is counted in a `Ledger` so callers can check for leaks and double frees.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::stack::{
    ConfigId, ConnId, ConnectionEvents, EventContext, FoundCallback, LookupStart, NetStack,
    RecvChain, StackError, StackGuard,
};
use crate::state::{CallbackArg, ConnectionState};

const TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsBehavior {
    Cached(IpAddr),
    Async(IpAddr),
    Fail,
    /// The lookup never answers.
    Stall,
    StartError(StackError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    Complete,
    /// The handshake never finishes.
    Stall,
    Fatal(StackError),
}

/// How `sent` reports the flushed bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckPattern {
    Exact,
    /// The flushed total, spread over this many callbacks.
    Split(usize),
    /// Like `Split`, but each part arrives on its own tick with
    /// `idle_ticks` empty ticks before the next one.
    Paced { parts: usize, idle_ticks: usize },
    /// A single acknowledgement of this many bytes.
    Short(u16),
    /// The flushed total plus this many bytes.
    Over(u16),
}

#[derive(Debug, Clone)]
pub struct Script {
    pub dns: DnsBehavior,
    pub fail_config: bool,
    pub fail_new: bool,
    pub fail_hostname: Option<StackError>,
    pub fail_connect: Option<StackError>,
    pub handshake: Handshake,
    pub fail_write: Option<StackError>,
    pub fail_output: Option<StackError>,
    pub acks: AckPattern,
    /// Delivered after the acknowledgements, one chain per tick.
    pub response: Vec<Vec<Vec<u8>>>,
    pub close_after_response: bool,
    /// Replaces the response with a fatal error.
    pub fatal_after_send: Option<StackError>,
    /// Number of `close` calls that fail with `close_error` before one
    /// succeeds.
    pub close_failures: u32,
    pub close_error: StackError,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            dns: DnsBehavior::Cached(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            fail_config: false,
            fail_new: false,
            fail_hostname: None,
            fail_connect: None,
            handshake: Handshake::Complete,
            fail_write: None,
            fail_output: None,
            acks: AckPattern::Exact,
            response: Vec::new(),
            close_after_response: true,
            fatal_after_send: None,
            close_failures: 0,
            close_error: StackError::Mem,
        }
    }
}

impl Script {
    /// Respond with `raw` cut into single-segment chains of `chunk` bytes.
    pub fn respond_in_chunks(mut self, raw: &[u8], chunk: usize) -> Self {
        self.response = raw.chunks(chunk.max(1)).map(|c| vec![c.to_vec()]).collect();
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub lookups_started: usize,
    pub configs_created: usize,
    pub configs_freed: usize,
    pub conns_created: usize,
    pub conns_closed: usize,
    pub conns_failed: usize,
    pub close_attempts: usize,
    pub double_frees: usize,
    pub hostnames: Vec<String>,
    pub bytes_written: usize,
    pub recved: usize,
    pub idle_polls: usize,
    pub args: Vec<Weak<ConnectionState>>,
}

impl Ledger {
    pub fn live_configs(&self) -> usize {
        self.configs_created.saturating_sub(self.configs_freed)
    }

    pub fn live_conns(&self) -> usize {
        self.conns_created
            .saturating_sub(self.conns_closed + self.conns_failed)
    }

    /// Callback arguments still referenced by anyone.
    pub fn live_args(&self) -> usize {
        self.args.iter().filter(|arg| arg.strong_count() > 0).count()
    }
}

enum SimEvent {
    Found(Option<IpAddr>),
    Connected(ConnId),
    Poll(ConnId),
    Sent(ConnId, u16),
    Recv(ConnId, RecvChain),
    Closed(ConnId),
    Fatal(ConnId, StackError),
}

#[derive(Default)]
struct SimConn {
    arg: Option<CallbackArg>,
    events: Option<Arc<dyn ConnectionEvents>>,
    written: usize,
}

pub struct SimStack {
    script: Script,
    ledger: Ledger,
    next_id: u32,
    configs: HashSet<ConfigId>,
    conns: HashMap<ConnId, SimConn>,
    found: Option<FoundCallback>,
    stalled: Vec<FoundCallback>,
    queue: VecDeque<Vec<SimEvent>>,
}

impl SimStack {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            ledger: Ledger::default(),
            next_id: 1,
            configs: HashSet::new(),
            conns: HashMap::new(),
            found: None,
            stalled: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    /// Wrap a new stack in a guard and start its dispatch thread.
    ///
    /// # Panics
    /// Panics if the dispatch thread cannot be spawned.
    pub fn spawn(script: Script) -> StackGuard<Self> {
        let guard = StackGuard::new(Self::new(script));
        let weak = guard.downgrade();
        thread::Builder::new()
            .name("sim-dispatch".to_string())
            .spawn(move || {
                while let Some(stack) = weak.upgrade() {
                    stack.lock().dispatch();
                    drop(stack);
                    thread::sleep(TICK);
                }
            })
            .expect("failed to spawn sim dispatch thread");
        guard
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Lookups that will never be answered.
    pub fn stalled_lookups(&self) -> usize {
        self.stalled.len()
    }

    /// Deliver the next batch of callbacks.
    pub fn dispatch(&mut self) {
        if let Some(batch) = self.queue.pop_front() {
            for event in batch {
                self.deliver(event);
            }
        }
    }

    /// Fail `conn` right now, as if the transport had reported a fatal error.
    pub fn inject_fatal(&mut self, conn: ConnId, err: StackError) {
        self.fail(conn, err);
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn slots(&self, conn: ConnId) -> Option<(Arc<dyn ConnectionEvents>, CallbackArg)> {
        let slot = self.conns.get(&conn)?;
        Some((slot.events.clone()?, slot.arg.clone()?))
    }

    fn deliver(&mut self, event: SimEvent) {
        let outcome = match event {
            SimEvent::Found(addr) => {
                if let Some(found) = self.found.take() {
                    found(addr);
                }
                Ok(())
            }
            SimEvent::Fatal(conn, err) => {
                self.fail(conn, err);
                Ok(())
            }
            SimEvent::Connected(conn) => match self.slots(conn) {
                Some((events, arg)) => events.connected(&arg, conn),
                None => Ok(()),
            },
            SimEvent::Poll(conn) => match self.slots(conn) {
                Some((events, arg)) => {
                    self.ledger.idle_polls += 1;
                    events.poll(&arg, conn)
                }
                None => Ok(()),
            },
            SimEvent::Sent(conn, len) => match self.slots(conn) {
                Some((events, arg)) => events.sent(&arg, conn, len),
                None => Ok(()),
            },
            SimEvent::Recv(conn, chain) => match self.slots(conn) {
                Some((events, arg)) => events.recv(&arg, self, conn, Some(chain), Ok(())),
                None => Ok(()),
            },
            SimEvent::Closed(conn) => match self.slots(conn) {
                Some((events, arg)) => events.recv(&arg, self, conn, None, Ok(())),
                None => Ok(()),
            },
        };
        if let Err(err) = outcome {
            debug!(%err, "callback returned an error");
        }
    }

    fn fail(&mut self, conn: ConnId, err: StackError) {
        let Some(slot) = self.conns.remove(&conn) else {
            return;
        };
        self.ledger.conns_failed += 1;
        if let (Some(events), Some(arg)) = (slot.events, slot.arg) {
            events.error(arg, self, err);
        }
    }

    fn queue_acks(&mut self, conn: ConnId, written: usize) {
        let acks = match self.script.acks {
            AckPattern::Exact => u16_chunks(written),
            AckPattern::Split(parts) => split_evenly(written, parts),
            AckPattern::Paced { parts, idle_ticks } => {
                for len in split_evenly(written, parts) {
                    self.queue.push_back(vec![SimEvent::Sent(conn, len)]);
                    self.queue.extend((0..idle_ticks).map(|_| Vec::new()));
                }
                return;
            }
            AckPattern::Short(len) => vec![len],
            AckPattern::Over(extra) => vec![clamp_u16(written + usize::from(extra))],
        };
        self.queue
            .push_back(acks.into_iter().map(|len| SimEvent::Sent(conn, len)).collect());
    }

    fn queue_response(&mut self, conn: ConnId) {
        if let Some(err) = self.script.fatal_after_send {
            self.queue.push_back(vec![SimEvent::Fatal(conn, err)]);
            return;
        }
        for chain in &self.script.response {
            let chain = RecvChain::from_segments(chain.iter().cloned());
            self.queue.push_back(vec![SimEvent::Recv(conn, chain)]);
        }
        if self.script.close_after_response {
            self.queue.push_back(vec![SimEvent::Closed(conn)]);
        }
    }
}

fn clamp_u16(n: usize) -> u16 {
    u16::try_from(n).unwrap_or(u16::MAX)
}

fn split_evenly(n: usize, parts: usize) -> Vec<u16> {
    let parts = parts.max(1);
    (0..parts)
        .map(|i| clamp_u16(n / parts + usize::from(i < n % parts)))
        .collect()
}

fn u16_chunks(mut n: usize) -> Vec<u16> {
    let mut chunks = Vec::new();
    while n > usize::from(u16::MAX) {
        chunks.push(u16::MAX);
        n -= usize::from(u16::MAX);
    }
    chunks.push(clamp_u16(n));
    chunks
}

impl EventContext for SimStack {
    fn recved(&mut self, _conn: ConnId, len: usize) {
        self.ledger.recved += len;
    }

    fn tls_free_config(&mut self, config: ConfigId) {
        if self.configs.remove(&config) {
            self.ledger.configs_freed += 1;
        } else {
            self.ledger.double_frees += 1;
        }
    }
}

impl NetStack for SimStack {
    fn gethostbyname(&mut self, _host: &str, found: FoundCallback) -> Result<LookupStart, StackError> {
        self.ledger.lookups_started += 1;
        match self.script.dns.clone() {
            DnsBehavior::Cached(addr) => Ok(LookupStart::Resolved(addr)),
            DnsBehavior::Async(addr) => {
                self.found = Some(found);
                self.queue.push_back(vec![SimEvent::Found(Some(addr))]);
                Ok(LookupStart::InProgress)
            }
            DnsBehavior::Fail => {
                self.found = Some(found);
                self.queue.push_back(vec![SimEvent::Found(None)]);
                Ok(LookupStart::InProgress)
            }
            DnsBehavior::Stall => {
                self.stalled.push(found);
                Ok(LookupStart::InProgress)
            }
            DnsBehavior::StartError(err) => Err(err),
        }
    }

    fn tls_create_config_client(&mut self, trust_anchor: &[u8]) -> Option<ConfigId> {
        if self.script.fail_config || trust_anchor.is_empty() {
            return None;
        }
        let id = ConfigId::new(self.next_id());
        self.configs.insert(id);
        self.ledger.configs_created += 1;
        Some(id)
    }

    fn tls_new(&mut self, config: ConfigId) -> Option<ConnId> {
        if self.script.fail_new || !self.configs.contains(&config) {
            return None;
        }
        let id = ConnId::new(self.next_id());
        self.conns.insert(id, SimConn::default());
        self.ledger.conns_created += 1;
        Some(id)
    }

    fn tls_set_hostname(&mut self, conn: ConnId, host: &str) -> Result<(), StackError> {
        self.ledger.hostnames.push(host.to_string());
        if let Some(err) = self.script.fail_hostname {
            return Err(err);
        }
        if !self.conns.contains_key(&conn) {
            return Err(StackError::Arg);
        }
        Ok(())
    }

    fn set_arg(&mut self, conn: ConnId, arg: CallbackArg) {
        self.ledger.args.push(Arc::downgrade(&arg));
        if let Some(slot) = self.conns.get_mut(&conn) {
            slot.arg = Some(arg);
        }
    }

    fn set_events(&mut self, conn: ConnId, events: Arc<dyn ConnectionEvents>, _idle_poll_shots: u8) {
        if let Some(slot) = self.conns.get_mut(&conn) {
            slot.events = Some(events);
        }
    }

    fn connect(&mut self, conn: ConnId, _addr: IpAddr, _port: u16) -> Result<(), StackError> {
        if let Some(err) = self.script.fail_connect {
            return Err(err);
        }
        if !self.conns.contains_key(&conn) {
            return Err(StackError::Arg);
        }
        match self.script.handshake {
            Handshake::Complete => self
                .queue
                .push_back(vec![SimEvent::Connected(conn), SimEvent::Poll(conn)]),
            Handshake::Fatal(err) => self.queue.push_back(vec![SimEvent::Fatal(conn, err)]),
            Handshake::Stall => {}
        }
        Ok(())
    }

    fn write(&mut self, conn: ConnId, data: &[u8]) -> Result<(), StackError> {
        if let Some(err) = self.script.fail_write {
            return Err(err);
        }
        let slot = self.conns.get_mut(&conn).ok_or(StackError::Conn)?;
        slot.written += data.len();
        self.ledger.bytes_written += data.len();
        Ok(())
    }

    fn output(&mut self, conn: ConnId) -> Result<(), StackError> {
        if let Some(err) = self.script.fail_output {
            return Err(err);
        }
        let slot = self.conns.get_mut(&conn).ok_or(StackError::Conn)?;
        let written = std::mem::take(&mut slot.written);
        self.queue_acks(conn, written);
        self.queue_response(conn);
        Ok(())
    }

    fn close(&mut self, conn: ConnId) -> Result<(), StackError> {
        self.ledger.close_attempts += 1;
        if self.script.close_failures > 0 {
            self.script.close_failures -= 1;
            return Err(self.script.close_error);
        }
        if self.conns.remove(&conn).is_some() {
            self.ledger.conns_closed += 1;
            Ok(())
        } else {
            self.ledger.double_frees += 1;
            Err(StackError::Arg)
        }
    }
}
