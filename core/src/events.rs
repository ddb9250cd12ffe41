//! Connection event handlers for one fetch.
//!
//! These run on the stack's dispatch context. They only touch the
//! `ConnectionState` passed as the callback argument and the session's
//! `ResponseBuffer`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::accumulator::ResponseBuffer;
use crate::stack::{ConnId, ConnectionEvents, EventContext, RecvChain, StackError};
use crate::state::CallbackArg;

pub struct FetchEvents {
    response: Arc<ResponseBuffer>,
}

impl FetchEvents {
    pub fn new(response: Arc<ResponseBuffer>) -> Self {
        Self { response }
    }
}

impl ConnectionEvents for FetchEvents {
    fn connected(&self, arg: &CallbackArg, conn: ConnId) -> Result<(), StackError> {
        debug!(%conn, "handshake complete");
        arg.set_connected();
        Ok(())
    }

    fn error(&self, arg: CallbackArg, ctx: &mut dyn EventContext, err: StackError) {
        warn!(%err, "connection error");
        arg.set_errored();
        arg.release(ctx);
    }

    fn poll(&self, _arg: &CallbackArg, _conn: ConnId) -> Result<(), StackError> {
        Ok(())
    }

    fn sent(&self, arg: &CallbackArg, conn: ConnId, len: u16) -> Result<(), StackError> {
        let total = arg.record_acknowledged(len);
        debug!(%conn, len, total, "request bytes acknowledged");
        Ok(())
    }

    fn recv(
        &self,
        _arg: &CallbackArg,
        ctx: &mut dyn EventContext,
        conn: ConnId,
        chain: Option<RecvChain>,
        err: Result<(), StackError>,
    ) -> Result<(), StackError> {
        let chain = match chain {
            Some(chain) if chain.tot_len() > 0 => chain,
            _ => {
                info!(%conn, "connection closed by peer, response complete");
                self.response.mark_complete();
                return Ok(());
            }
        };
        if let Err(err) = err {
            warn!(%conn, %err, bytes = chain.tot_len(), "discarding data received with error");
            return Ok(());
        }

        let total = chain.tot_len();
        let kept = self.response.append_chain(&chain);
        debug!(%conn, segments = chain.len(), total, kept, "received");
        if kept < total {
            warn!(%conn, dropped = total - kept, "response buffer full, dropping data");
        }
        ctx.recved(conn, total);
        Ok(())
    }
}
