//! Opaque handle behind the C ABI.
//!
//! # Design
//! A session owns one `Fetcher` over a host `StdStack` and the buffer of the
//! most recent fetch. Pointers handed to C point into that buffer, so they
//! stay valid until the next fetch on the same session or until it is freed.

use std::os::raw::c_char;

use picofetch_core::http::body_offset;
use picofetch_core::{FetchConfig, FetchSession, Fetcher, StdStack, StdStackConfig};

/// Opaque handle to a fetch session. C callers receive a pointer to this
/// and pass it back into every FFI function.
pub struct FfiSession {
    fetcher: Fetcher<StdStack>,
    last: FetchSession,
    succeeded: bool,
}

impl FfiSession {
    pub(crate) fn new(config: FetchConfig) -> std::io::Result<Self> {
        let stack = StdStack::spawn(StdStackConfig::default())?;
        Ok(Self {
            fetcher: Fetcher::new(stack, config),
            last: FetchSession::new(),
            succeeded: false,
        })
    }

    /// Run one fetch into a fresh buffer.
    pub(crate) fn fetch(&mut self) -> bool {
        self.last = FetchSession::new();
        self.succeeded = self.fetcher.fetch_ok(&self.last);
        self.succeeded
    }

    pub(crate) fn response_len(&self) -> usize {
        if self.succeeded {
            self.last.buffer().offset()
        } else {
            0
        }
    }

    /// Start of the terminated response, or null unless the last fetch
    /// succeeded.
    pub(crate) fn response_ptr(&self) -> *const c_char {
        if !self.succeeded {
            return std::ptr::null();
        }
        self.last.buffer().terminated().as_ptr() as *const c_char
    }

    /// First body byte, or null if there is no blank line after the headers.
    pub(crate) fn body_ptr(&self) -> *const c_char {
        if !self.succeeded {
            return std::ptr::null();
        }
        let offset = match body_offset(&self.last.raw()) {
            Some(offset) => offset,
            None => return std::ptr::null(),
        };
        let start = self.response_ptr();
        // `offset` is at most the response length, which is where the
        // terminator sits.
        unsafe { start.add(offset) }
    }
}
