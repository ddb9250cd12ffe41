//! Per-connection state shared between the caller and the callbacks.
//!
//! # Design
//! One `ConnectionState` lives behind an `Arc` for the lifetime of a
//! connection. The stack holds one clone as the callback argument and the
//! caller holds another to poll the flags. Every flag is atomic so writes
//! made on the dispatch context are visible to the polling thread.
//!
//! The channel configuration is owned by the state and released through
//! `release`, which takes it out of its slot. Whichever of the fatal-error
//! callback or the caller's cleanup gets there first frees it; the other
//! finds the slot empty.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::stack::{ConfigId, EventContext};

/// The opaque handle handed to every callback of one connection.
pub type CallbackArg = Arc<ConnectionState>;

const NOT_YET: u32 = u32::MAX;

#[derive(Debug)]
pub struct ConnectionState {
    connected: AtomicBool,
    errored: AtomicBool,
    acknowledged: AtomicU32,
    config: Mutex<Option<ConfigId>>,
}

impl ConnectionState {
    pub fn new(config: ConfigId) -> CallbackArg {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            acknowledged: AtomicU32::new(NOT_YET),
            config: Mutex::new(Some(config)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self) {
        self.connected.store(true, Ordering::Release);
    }

    /// Set once the fatal-error callback has run; the connection handle must
    /// not be used afterwards.
    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }

    pub fn set_errored(&self) {
        self.errored.store(true, Ordering::Release);
    }

    /// Cumulative acknowledged bytes, or `None` before the first
    /// acknowledgement since the last reset.
    pub fn acknowledged(&self) -> Option<u32> {
        match self.acknowledged.load(Ordering::Acquire) {
            NOT_YET => None,
            n => Some(n),
        }
    }

    pub fn reset_acknowledged(&self) {
        self.acknowledged.store(NOT_YET, Ordering::Release);
    }

    /// Add `len` to the running total and return the new total.
    pub fn record_acknowledged(&self, len: u16) -> u32 {
        let add = |current: u32| -> u32 {
            let base = if current == NOT_YET { 0 } else { current };
            base.saturating_add(u32::from(len)).min(NOT_YET - 1)
        };
        let previous = self
            .acknowledged
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| Some(add(current)))
            .unwrap_or_else(|current| current);
        add(previous)
    }

    /// The configuration this connection still owns, if any.
    pub fn config(&self) -> Option<ConfigId> {
        *self.config.lock()
    }

    /// Free the owned configuration. Returns `false` when it was already
    /// released.
    pub fn release(&self, ctx: &mut dyn EventContext) -> bool {
        let taken = self.config.lock().take();
        match taken {
            Some(config) => {
                ctx.tls_free_config(config);
                true
            }
            None => false,
        }
    }
}
