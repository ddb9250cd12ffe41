//! C-ABI wrapper around `picofetch-core`.
//!
//! # Overview
//! Lets firmware-style C code run the whole fetch pipeline through a handful
//! of `extern "C"` functions and read the raw response as a null-terminated
//! string.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - `picofetch_fetch` returns only success or failure. Details go to the
//!   log, which `picofetch_log_init` switches on.
//! - Response pointers are borrowed from the session. The caller frees only
//!   the session, with `picofetch_session_free`.

pub mod types;

use std::ffi::CStr;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};

use picofetch_core::FetchConfig;
use tracing_subscriber::EnvFilter;

use types::FfiSession;

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

/// Create a fetch session.
///
/// `config_json` is a JSON `FetchConfig`; missing fields take their defaults
/// and null means all defaults. Returns null if the JSON is invalid, the
/// network stack cannot start, or an internal panic occurs.
/// The caller must free the returned pointer with `picofetch_session_free`.
#[unsafe(no_mangle)]
pub extern "C" fn picofetch_session_new(config_json: *const c_char) -> *mut FfiSession {
    catch_unwind(|| {
        let config = if config_json.is_null() {
            FetchConfig::default()
        } else {
            let json = match unsafe { CStr::from_ptr(config_json) }.to_str() {
                Ok(json) => json,
                Err(_) => return std::ptr::null_mut(),
            };
            match FetchConfig::from_json(json) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(%err, "rejecting session configuration");
                    return std::ptr::null_mut();
                }
            }
        };
        match FfiSession::new(config) {
            Ok(session) => Box::into_raw(Box::new(session)),
            Err(err) => {
                tracing::error!(%err, "failed to start network stack");
                std::ptr::null_mut()
            }
        }
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Free a session created by `picofetch_session_new`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn picofetch_session_free(session: *mut FfiSession) {
    if !session.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(session) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Resolve, connect, send the request and wait until the server closes.
///
/// Blocks without any timeout. Returns false on any failure, including a
/// null `session`. Invalidates pointers returned for the previous fetch.
#[unsafe(no_mangle)]
pub extern "C" fn picofetch_fetch(session: *mut FfiSession) -> bool {
    if session.is_null() {
        return false;
    }
    catch_unwind(AssertUnwindSafe(|| {
        let session = unsafe { &mut *session };
        session.fetch()
    }))
    .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Response access
// ---------------------------------------------------------------------------

/// The raw response (status line, headers, body) as a null-terminated
/// string. Null unless the last fetch succeeded.
#[unsafe(no_mangle)]
pub extern "C" fn picofetch_response(session: *const FfiSession) -> *const c_char {
    if session.is_null() {
        return std::ptr::null();
    }
    catch_unwind(AssertUnwindSafe(|| unsafe { &*session }.response_ptr()))
        .unwrap_or(std::ptr::null())
}

/// Length of the raw response, terminator excluded. Zero unless the last
/// fetch succeeded.
#[unsafe(no_mangle)]
pub extern "C" fn picofetch_response_len(session: *const FfiSession) -> usize {
    if session.is_null() {
        return 0;
    }
    catch_unwind(AssertUnwindSafe(|| unsafe { &*session }.response_len()))
        .unwrap_or(0)
}

/// Pointer into the response just past the blank line that ends the
/// headers. Null if there is no such line or the last fetch failed.
#[unsafe(no_mangle)]
pub extern "C" fn picofetch_body(session: *const FfiSession) -> *const c_char {
    if session.is_null() {
        return std::ptr::null();
    }
    catch_unwind(AssertUnwindSafe(|| unsafe { &*session }.body_ptr()))
        .unwrap_or(std::ptr::null())
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Install a stderr log subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns false if a subscriber was already installed.
#[unsafe(no_mangle)]
pub extern "C" fn picofetch_log_init() -> bool {
    catch_unwind(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok()
    })
    .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn start_server(deck: String) -> (u16, String) {
        let identity = mock_server::self_signed(&["localhost"]).unwrap();
        let acceptor = identity.acceptor().unwrap();
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = std_listener.local_addr().unwrap().port();
        std_listener.set_nonblocking(true).unwrap();

        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
                mock_server::run(listener, mock_server::app(deck), acceptor).await
            })
            .unwrap();
        });
        (port, identity.cert_pem)
    }

    fn session_for(json: serde_json::Value) -> *mut FfiSession {
        let json = CString::new(json.to_string()).unwrap();
        picofetch_session_new(json.as_ptr())
    }

    #[test]
    fn session_new_and_free() {
        let session = picofetch_session_new(std::ptr::null());
        assert!(!session.is_null());
        picofetch_session_free(session);
    }

    #[test]
    fn session_new_accepts_partial_config() {
        let session = session_for(serde_json::json!({ "hostname": "localhost" }));
        assert!(!session.is_null());
        picofetch_session_free(session);
    }

    #[test]
    fn session_new_invalid_json_returns_null() {
        let json = CString::new("{not json").unwrap();
        assert!(picofetch_session_new(json.as_ptr()).is_null());
    }

    #[test]
    fn session_free_null_is_safe() {
        picofetch_session_free(std::ptr::null_mut());
    }

    #[test]
    fn null_session_is_tolerated_everywhere() {
        assert!(!picofetch_fetch(std::ptr::null_mut()));
        assert!(picofetch_response(std::ptr::null()).is_null());
        assert_eq!(picofetch_response_len(std::ptr::null()), 0);
        assert!(picofetch_body(std::ptr::null()).is_null());
    }

    #[test]
    fn nothing_to_read_before_a_fetch() {
        let session = picofetch_session_new(std::ptr::null());
        assert!(picofetch_response(session).is_null());
        assert_eq!(picofetch_response_len(session), 0);
        assert!(picofetch_body(session).is_null());
        picofetch_session_free(session);
    }

    #[test]
    fn log_init_only_installs_once() {
        let first = picofetch_log_init();
        let second = picofetch_log_init();
        assert!(!second || !first);
    }

    #[test]
    fn bad_trust_anchor_fails_the_fetch() {
        let session = session_for(serde_json::json!({
            "hostname": "localhost",
            "port": 9,
            "trust_anchor_pem": "not a certificate",
        }));
        assert!(!picofetch_fetch(session));
        assert!(picofetch_response(session).is_null());
        picofetch_session_free(session);
    }

    #[test]
    fn fetch_through_the_c_abi() {
        let deck = mock_server::sample_deck();
        let (port, cert_pem) = start_server(deck.clone());
        let session = session_for(serde_json::json!({
            "hostname": "localhost",
            "port": port,
            "path": mock_server::DECK_PATH,
            "resolve_poll_ms": 5,
            "connect_poll_ms": 5,
            "response_poll_ms": 5,
            "trust_anchor_pem": cert_pem,
        }));
        assert!(!session.is_null());

        assert!(picofetch_fetch(session));

        let response = unsafe { CStr::from_ptr(picofetch_response(session)) };
        let response = response.to_str().unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(picofetch_response_len(session), response.len());

        let body = unsafe { CStr::from_ptr(picofetch_body(session)) };
        assert_eq!(body.to_str().unwrap(), deck);

        picofetch_session_free(session);
    }
}
