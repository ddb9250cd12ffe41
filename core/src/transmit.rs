//! Request transmission.
//!
//! The payload is queued and flushed in one go, then the caller polls the
//! cumulative acknowledgement count until it reaches the payload length.
//! Overshooting it is a failure. A peer that never acknowledges everything
//! keeps the caller waiting. Partial writes are never retried.

use std::time::Duration;

use tracing::debug;

use crate::channel::SecureChannel;
use crate::error::FetchError;
use crate::poll::wait_for;
use crate::stack::{NetStack, StackGuard};

pub fn send_request<S: NetStack>(
    stack: &StackGuard<S>,
    channel: &SecureChannel,
    payload: &[u8],
    interval: Duration,
) -> Result<(), FetchError> {
    let conn = channel.conn();
    let state = channel.state();
    let expected = payload.len();

    state.reset_acknowledged();
    stack.lock().write(conn, payload).map_err(FetchError::Write)?;
    stack.lock().output(conn).map_err(FetchError::Output)?;
    debug!(%conn, bytes = expected, "request flushed");

    let acknowledged = wait_for(interval, || {
        state
            .acknowledged()
            .filter(|&seen| seen as usize >= expected)
    });

    if acknowledged as usize != expected {
        return Err(FetchError::SendMismatch {
            acknowledged,
            expected,
        });
    }
    Ok(())
}
