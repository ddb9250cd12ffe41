//! Single-shot HTTPS fetch over a callback-driven TCP/TLS stack.
//!
//! # Overview
//! Resolves a host, opens a TLS channel that trusts one pinned root
//! certificate, sends a fixed `GET` with `Connection: close` and collects the
//! raw response into a 16 KiB buffer until the server closes the connection.
//!
//! # Design
//! - The network stack is a trait (`NetStack`) shaped like an lwIP
//!   `altcp_tls` stack. `StdStack` runs it over `std::net` and rustls;
//!   `SimStack` is a scripted stand-in for tests.
//! - Callbacks run on the stack's dispatch context and only touch the shared
//!   `ConnectionState` and the session's `ResponseBuffer`. The calling thread
//!   busy-polls those between short sleeps, never holding the stack lock.
//! - Every stage either succeeds or cleans up what it allocated and fails.
//!   `Fetcher::fetch_ok` reduces the outcome to a boolean; restarting is the
//!   caller's business.

pub mod accumulator;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod http;
pub mod poll;
pub mod resolver;
pub mod sim;
pub mod stack;
pub mod state;
pub mod std_stack;
pub mod transmit;

pub use accumulator::{ResponseBuffer, RESPONSE_CAPACITY};
pub use config::FetchConfig;
pub use error::{FetchError, ResponseError, Stage};
pub use fetch::{FetchSession, Fetcher};
pub use http::{HttpRequest, HttpResponse};
pub use stack::{NetStack, StackError, StackGuard};
pub use std_stack::{StdStack, StdStackConfig};
