//! Real TLS fetches against the live mock server.
//!
//! # Design
//! Starts the mock server on a random port with a fresh self-signed
//! certificate, pins that certificate as the only trust anchor, then runs
//! the whole pipeline over `StdStack`. Each fetch runs on a helper thread so
//! a stall fails the test instead of hanging it.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use picofetch_core::{
    FetchConfig, FetchError, FetchSession, Fetcher, StdStack, StdStackConfig, RESPONSE_CAPACITY,
};

const FETCH_BOUND: Duration = Duration::from_secs(10);

struct Server {
    addr: SocketAddr,
    cert_pem: String,
}

fn start_server(deck: String) -> Server {
    let identity = mock_server::self_signed(&["localhost"]).unwrap();
    let acceptor = identity.acceptor().unwrap();

    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    thread::spawn(move || {
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

    Server {
        addr,
        cert_pem: identity.cert_pem,
    }
}

fn config(server: &Server, path: &str) -> FetchConfig {
    FetchConfig {
        hostname: "localhost".to_string(),
        port: server.addr.port(),
        path: path.to_string(),
        resolve_poll_ms: 5,
        connect_poll_ms: 5,
        response_poll_ms: 5,
        trust_anchor_pem: Some(server.cert_pem.clone()),
        ..FetchConfig::default()
    }
}

/// Fetch on a helper thread; `None` if it did not return within `bound`.
fn fetch_within(
    config: FetchConfig,
    bound: Duration,
) -> Option<(FetchSession, Result<usize, FetchError>)> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let stack = StdStack::spawn(StdStackConfig::default()).unwrap();
        let fetcher = Fetcher::new(stack, config);
        let session = FetchSession::new();
        let result = fetcher.fetch(&session);
        let _ = tx.send((session, result));
    });
    rx.recv_timeout(bound).ok()
}

fn fetch(config: FetchConfig) -> (FetchSession, Result<usize, FetchError>) {
    fetch_within(config, FETCH_BOUND).expect("fetch did not finish")
}

#[test]
fn fetches_the_deck_over_tls() {
    let deck = mock_server::sample_deck();
    let server = start_server(deck.clone());

    let (session, result) = fetch(config(&server, mock_server::DECK_PATH));

    let len = result.unwrap();
    assert!(session.is_complete());
    assert_eq!(session.buffer().terminated()[len], 0);

    let response = session.http_response().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/csv; charset=utf-8"));
    assert_eq!(response.body, deck.as_bytes());
}

#[test]
fn oversized_deck_is_truncated_silently() {
    let server = start_server(mock_server::large_deck(40_000));

    let (session, result) = fetch(config(&server, mock_server::DECK_PATH));

    let len = result.unwrap();
    assert!(len > 0);
    assert!(len <= RESPONSE_CAPACITY - 1);
    assert!(session.buffer().dropped() > 0);
    assert_eq!(session.buffer().terminated()[len], 0);
    assert_eq!(session.http_response().unwrap().status, 200);
}

#[test]
fn missing_path_still_completes() {
    let server = start_server(mock_server::sample_deck());

    let (session, result) = fetch(config(&server, "/anki-csv-decks/missing.csv"));

    result.unwrap();
    assert_eq!(session.http_response().unwrap().status, 404);
}

#[test]
fn unusable_trust_anchor_fails_configuration() {
    let server = start_server(mock_server::sample_deck());
    let config = FetchConfig {
        trust_anchor_pem: Some("not a certificate".to_string()),
        ..config(&server, mock_server::DECK_PATH)
    };

    let (session, result) = fetch(config);

    assert!(matches!(result, Err(FetchError::Config)));
    assert_eq!(session.buffer().offset(), 0);
}

#[test]
fn untrusted_server_stalls_the_handshake_wait() {
    let server = start_server(mock_server::sample_deck());
    let other = mock_server::self_signed(&["localhost"]).unwrap();
    let config = FetchConfig {
        trust_anchor_pem: Some(other.cert_pem),
        ..config(&server, mock_server::DECK_PATH)
    };

    assert!(fetch_within(config, Duration::from_millis(1500)).is_none());
}
