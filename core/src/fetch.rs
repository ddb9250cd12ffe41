//! Fetch orchestration: resolve, open the channel, send, wait for the close.
//!
//! # Design
//! `Fetcher` owns the stack handle and the configuration. `FetchSession` owns
//! the response buffer, so each fetch gets a fresh buffer, offset and
//! completion flag. A failed stage cleans up whatever it allocated and aborts
//! the fetch. Nothing is retried here; the caller decides whether to restart.

use std::sync::Arc;

use parking_lot::MappedMutexGuard;
use tracing::{error, info};

use crate::accumulator::ResponseBuffer;
use crate::channel::SecureChannel;
use crate::config::FetchConfig;
use crate::error::{FetchError, ResponseError};
use crate::events::FetchEvents;
use crate::http::HttpResponse;
use crate::poll::wait_until;
use crate::resolver;
use crate::stack::{NetStack, StackGuard};
use crate::transmit;

/// Response storage for one fetch.
#[derive(Debug, Default)]
pub struct FetchSession {
    response: Arc<ResponseBuffer>,
}

impl FetchSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> &ResponseBuffer {
        &self.response
    }

    pub fn is_complete(&self) -> bool {
        self.response.is_complete()
    }

    /// Raw response bytes received so far.
    pub fn raw(&self) -> MappedMutexGuard<'_, [u8]> {
        self.response.contents()
    }

    /// Split the raw response into status, headers and body.
    pub fn http_response(&self) -> Result<HttpResponse, ResponseError> {
        HttpResponse::parse(&self.response.contents())
    }
}

pub struct Fetcher<S> {
    stack: StackGuard<S>,
    config: FetchConfig,
}

impl<S: NetStack> Fetcher<S> {
    pub fn new(stack: StackGuard<S>, config: FetchConfig) -> Self {
        Self { stack, config }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn stack(&self) -> &StackGuard<S> {
        &self.stack
    }

    /// Run the whole pipeline and return the response length.
    ///
    /// Blocks until the peer closes the connection. None of the waits has a
    /// deadline.
    pub fn fetch(&self, session: &FetchSession) -> Result<usize, FetchError> {
        let config = &self.config;

        info!(host = %config.hostname, "resolving");
        let addr = resolver::resolve(&self.stack, &config.hostname, config.resolve_interval())?;
        info!(host = %config.hostname, %addr, "resolved");

        info!(%addr, port = config.port, "connecting");
        let events = Arc::new(FetchEvents::new(Arc::clone(&session.response)));
        let channel = SecureChannel::open(&self.stack, addr, config, events)?;
        info!(%addr, port = config.port, "connected");

        let request = config.request().to_bytes();
        info!(bytes = request.len(), "sending request");
        if let Err(err) = transmit::send_request(
            &self.stack,
            &channel,
            &request,
            config.response_interval(),
        ) {
            channel.teardown(&self.stack, config.connect_interval());
            return Err(err);
        }

        info!("request sent, waiting for response");
        wait_until(config.response_interval(), || session.response.is_complete());
        let len = session.response.finish();
        info!(bytes = len, "response received");

        channel.teardown(&self.stack, config.connect_interval());
        Ok(len)
    }

    /// `fetch` reduced to success or failure; the error is only logged.
    pub fn fetch_ok(&self, session: &FetchSession) -> bool {
        match self.fetch(session) {
            Ok(_) => true,
            Err(err) => {
                error!(%err, stage = ?err.stage(), "fetch failed");
                false
            }
        }
    }
}
