//! Callback-driven network stack abstraction.
//!
//! # Design
//! The pipeline talks to the network through `NetStack`, a small surface shaped
//! after an lwIP-style `altcp_tls` stack: every call is synchronous and cheap,
//! and anything that takes time (name lookup, handshake, acknowledgement,
//! incoming data) is reported later through callbacks fired from the stack's
//! own dispatch context.
//!
//! - `StackGuard` is the stack-wide lock. The main thread takes it for each
//!   individual stack call and releases it before polling.
//! - The dispatch context already holds the lock when it fires a callback, so
//!   callbacks get `&mut dyn EventContext` instead of re-locking.
//! - Configurations and connections are arena handles (`ConfigId`, `ConnId`).
//!   Handles are plain numbers; the stack decides whether one is still live.
//! - The fatal-error callback receives the `CallbackArg` by value. The stack
//!   forgets the connection before firing it.

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::state::CallbackArg;

/// Handle to a TLS client configuration owned by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigId(u32);

impl ConfigId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Handle to one TCP+TLS connection owned by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u32);

impl ConnId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Error codes reported by the stack, modelled on lwIP's `err_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StackError {
    #[error("out of memory")]
    Mem,
    #[error("buffer error")]
    Buf,
    #[error("timeout")]
    Timeout,
    #[error("routing problem")]
    Route,
    #[error("operation in progress")]
    InProgress,
    #[error("illegal value")]
    Value,
    #[error("operation would block")]
    WouldBlock,
    #[error("address in use")]
    Use,
    #[error("already connected")]
    IsConnected,
    #[error("not connected")]
    Conn,
    #[error("connection aborted")]
    Abort,
    #[error("connection reset")]
    Reset,
    #[error("connection closed")]
    Closed,
    #[error("illegal argument")]
    Arg,
    #[error("TLS failure")]
    Tls,
}

impl StackError {
    /// Whether the same call may succeed if simply repeated later.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            StackError::Mem | StackError::Buf | StackError::WouldBlock | StackError::InProgress
        )
    }
}

/// Outcome of starting a name lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStart {
    /// Answered synchronously, e.g. from the stack's cache.
    Resolved(IpAddr),
    /// The `found` callback fires later from the dispatch context.
    InProgress,
}

/// Name lookup completion: `Some(addr)` on success, `None` when the name has
/// no address.
pub type FoundCallback = Box<dyn FnOnce(Option<IpAddr>) + Send>;

/// A chain of received buffer segments, delivered together to `recv`.
///
/// Dropping the chain releases its memory.
#[derive(Debug, Clone, Default)]
pub struct RecvChain {
    segments: Vec<Bytes>,
}

impl RecvChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments<I, B>(segments: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn push(&mut self, segment: impl Into<Bytes>) {
        self.segments.push(segment.into());
    }

    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(|s| s.as_ref())
    }

    /// Number of segments in the chain.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total payload bytes across every segment.
    pub fn tot_len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }
}

/// Stack operations that are legal from inside a callback.
pub trait EventContext {
    /// Tell the stack that `len` received bytes were consumed, advancing the
    /// peer's flow-control window.
    fn recved(&mut self, conn: ConnId, len: usize);

    fn tls_free_config(&mut self, config: ConfigId);
}

/// The five per-connection callback slots.
///
/// All methods run on the stack's dispatch context with the stack locked.
pub trait ConnectionEvents: Send + Sync {
    /// The TCP and TLS handshakes have completed.
    fn connected(&self, arg: &CallbackArg, conn: ConnId) -> Result<(), StackError>;

    /// The connection failed and no longer exists.
    fn error(&self, arg: CallbackArg, ctx: &mut dyn EventContext, err: StackError);

    /// Periodic idle tick.
    fn poll(&self, arg: &CallbackArg, conn: ConnId) -> Result<(), StackError>;

    /// The peer acknowledged `len` more bytes.
    fn sent(&self, arg: &CallbackArg, conn: ConnId, len: u16) -> Result<(), StackError>;

    /// Data arrived, or `chain` is `None` because the peer closed the channel.
    fn recv(
        &self,
        arg: &CallbackArg,
        ctx: &mut dyn EventContext,
        conn: ConnId,
        chain: Option<RecvChain>,
        err: Result<(), StackError>,
    ) -> Result<(), StackError>;
}

/// A callback-driven TCP+TLS stack.
///
/// Only ever called with the `StackGuard` held.
pub trait NetStack: EventContext + Send + 'static {
    fn gethostbyname(&mut self, host: &str, found: FoundCallback) -> Result<LookupStart, StackError>;

    /// Build a client configuration trusting only `trust_anchor` (PEM or DER).
    fn tls_create_config_client(&mut self, trust_anchor: &[u8]) -> Option<ConfigId>;

    fn tls_new(&mut self, config: ConfigId) -> Option<ConnId>;

    /// Bind the expected server identity used for SNI and certificate checks.
    fn tls_set_hostname(&mut self, conn: ConnId, host: &str) -> Result<(), StackError>;

    fn set_arg(&mut self, conn: ConnId, arg: CallbackArg);

    /// Register the callback slots. `idle_poll_shots` counts 500 ms ticks
    /// between idle polls; zero disables them.
    fn set_events(&mut self, conn: ConnId, events: Arc<dyn ConnectionEvents>, idle_poll_shots: u8);

    fn connect(&mut self, conn: ConnId, addr: IpAddr, port: u16) -> Result<(), StackError>;

    /// Queue bytes for sending. Nothing leaves until `output`.
    fn write(&mut self, conn: ConnId, data: &[u8]) -> Result<(), StackError>;

    fn output(&mut self, conn: ConnId) -> Result<(), StackError>;

    /// Close and free the connection. May fail transiently; callers retry.
    fn close(&mut self, conn: ConnId) -> Result<(), StackError>;
}

/// Stack-wide mutual exclusion between the main thread and the dispatch
/// context.
pub struct StackGuard<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for StackGuard<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S> StackGuard<S> {
    pub fn new(stack: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(stack)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock()
    }

    /// Weak handle for dispatch threads, which stop once every guard is gone.
    pub(crate) fn downgrade(&self) -> Weak<Mutex<S>> {
        Arc::downgrade(&self.inner)
    }
}
