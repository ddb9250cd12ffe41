//! Secure channel establishment and teardown.
//!
//! # Design
//! `SecureChannel::open` walks six steps (configuration, connection, identity
//! binding, callback argument, callback registration, connect). A failing
//! step frees only what the earlier steps allocated, newest first, and leaves
//! nothing behind.
//!
//! Once the callback argument exists, the channel configuration is owned by the
//! `ConnectionState` and freed through `ConnectionState::release`, so either
//! the fatal-error callback or the caller releases it, never both.
//!
//! Waiting for the handshake has no deadline. A fatal error during the
//! handshake releases the connection's resources but does not wake the wait.

use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::poll::wait_until;
use crate::stack::{ConfigId, ConnId, ConnectionEvents, NetStack, StackGuard};
use crate::state::{CallbackArg, ConnectionState};

/// A connected, handshaken TLS channel.
#[derive(Debug)]
pub struct SecureChannel {
    conn: ConnId,
    state: CallbackArg,
}

impl SecureChannel {
    pub fn open<S: NetStack>(
        stack: &StackGuard<S>,
        addr: IpAddr,
        config: &FetchConfig,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<Self, FetchError> {
        let interval = config.connect_interval();
        let trust_anchor = config.trust_anchor()?;

        let tls_config = stack
            .lock()
            .tls_create_config_client(&trust_anchor)
            .ok_or(FetchError::Config)?;

        let Some(conn) = stack.lock().tls_new(tls_config) else {
            free_config(stack, tls_config);
            return Err(FetchError::Allocate);
        };

        let bound = stack.lock().tls_set_hostname(conn, &config.hostname);
        if let Err(source) = bound {
            close_until_ok(stack, conn, interval);
            free_config(stack, tls_config);
            return Err(FetchError::Identity {
                host: config.hostname.clone(),
                source,
            });
        }

        let state = ConnectionState::new(tls_config);
        stack.lock().set_arg(conn, Arc::clone(&state));
        stack.lock().set_events(conn, events, config.idle_poll_shots);

        let started = stack.lock().connect(conn, addr, config.port);
        if let Err(source) = started {
            close_until_ok(stack, conn, interval);
            state.release(&mut *stack.lock());
            return Err(FetchError::Connect {
                addr,
                port: config.port,
                source,
            });
        }

        debug!(%conn, %addr, port = config.port, "waiting for handshake");
        wait_until(interval, || state.is_connected());
        Ok(Self { conn, state })
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn state(&self) -> &CallbackArg {
        &self.state
    }

    /// Close the connection and release the configuration, unless the
    /// fatal-error callback already disposed of both.
    ///
    /// A close that fails with a non-retryable error is not repeated. The
    /// configuration is still released, but the connection stays with the
    /// stack.
    pub fn teardown<S: NetStack>(self, stack: &StackGuard<S>, interval: Duration) {
        loop {
            let mut guard = stack.lock();
            if self.state.is_errored() {
                debug!(conn = %self.conn, "connection already gone after fatal error");
                return;
            }
            match guard.close(self.conn) {
                Ok(()) => {
                    self.state.release(&mut *guard);
                    return;
                }
                Err(err) if err.is_retryable() => {
                    drop(guard);
                    warn!(conn = %self.conn, %err, "close deferred, retrying");
                    thread::sleep(interval);
                }
                Err(err) => {
                    error!(conn = %self.conn, %err, "close failed, connection left to the stack");
                    self.state.release(&mut *guard);
                    return;
                }
            }
        }
    }
}

/// Close `conn`, retrying while the stack reports a transient failure.
pub fn close_until_ok<S: NetStack>(stack: &StackGuard<S>, conn: ConnId, interval: Duration) {
    loop {
        let closed = stack.lock().close(conn);
        match closed {
            Ok(()) => return,
            Err(err) if err.is_retryable() => {
                warn!(%conn, %err, "close deferred, retrying");
                thread::sleep(interval);
            }
            Err(err) => {
                error!(%conn, %err, "close failed, connection left to the stack");
                return;
            }
        }
    }
}

fn free_config<S: NetStack>(stack: &StackGuard<S>, config: ConfigId) {
    stack.lock().tls_free_config(config);
}
