//! End-to-end pipeline properties over the scripted stack.
//!
//! # Design
//! Every test drives `Fetcher::fetch` against a `SimStack` and then inspects
//! the stack's ledger, so each success and failure path is checked for leaks
//! and double frees. Waits that are designed never to finish run on a helper
//! thread, bounded by a channel timeout in the test itself.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use picofetch_core::sim::{AckPattern, DnsBehavior, Handshake, Ledger, Script, SimStack};
use picofetch_core::state::ConnectionState;
use picofetch_core::{
    FetchConfig, FetchError, FetchSession, Fetcher, NetStack, Stage, StackError, StackGuard,
    RESPONSE_CAPACITY,
};

const HARNESS_BOUND: Duration = Duration::from_millis(300);

fn config() -> FetchConfig {
    FetchConfig {
        hostname: "cards.example".to_string(),
        path: "/deck.csv".to_string(),
        resolve_poll_ms: 1,
        connect_poll_ms: 1,
        response_poll_ms: 1,
        ..FetchConfig::default()
    }
}

fn http_ok(body: &[u8]) -> Vec<u8> {
    let mut raw = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/csv\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(body);
    raw
}

fn fetch(script: Script) -> (StackGuard<SimStack>, FetchSession, Result<usize, FetchError>) {
    let stack = SimStack::spawn(script);
    let fetcher = Fetcher::new(stack.clone(), config());
    let session = FetchSession::new();
    let result = fetcher.fetch(&session);
    (stack, session, result)
}

fn ledger(stack: &StackGuard<SimStack>) -> Ledger {
    stack.lock().ledger().clone()
}

fn assert_clean(ledger: &Ledger) {
    assert_eq!(ledger.live_configs(), 0, "configuration leaked");
    assert_eq!(ledger.live_conns(), 0, "connection leaked");
    assert_eq!(ledger.live_args(), 0, "callback argument leaked");
    assert_eq!(ledger.double_frees, 0, "double free");
}

/// Run a fetch on a helper thread; true if it returned within the bound.
fn returns_within_bound(script: Script) -> (StackGuard<SimStack>, bool) {
    let stack = SimStack::spawn(script);
    let fetcher = Fetcher::new(stack.clone(), config());
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let session = FetchSession::new();
        let _ = tx.send(fetcher.fetch(&session).is_ok());
    });
    let returned = rx.recv_timeout(HARNESS_BOUND).is_ok();
    (stack, returned)
}

// --- success ---

#[test]
fn successful_fetch_is_terminated_at_the_offset() {
    let raw = http_ok(b"front,back\nhola,hello\n");
    let (stack, session, result) = fetch(Script::default().respond_in_chunks(&raw, 16));

    let len = result.unwrap();
    assert_eq!(len, raw.len());
    assert!(len <= RESPONSE_CAPACITY - 1);
    assert!(session.is_complete());

    let terminated = session.buffer().terminated();
    assert_eq!(terminated.len(), len + 1);
    assert_eq!(terminated[len], 0);
    assert_eq!(&terminated[..len], &raw[..]);
    drop(terminated);

    let response = session.http_response().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.header("content-type"), Some("text/csv"));
    assert_eq!(response.body, b"front,back\nhola,hello\n");

    let ledger = ledger(&stack);
    assert_clean(&ledger);
    assert_eq!(ledger.hostnames, vec!["cards.example".to_string()]);
    assert_eq!(ledger.recved, raw.len());
}

#[test]
fn request_is_the_fixed_get() {
    let (stack, _, result) = fetch(Script::default());
    result.unwrap();
    let expected = "GET /deck.csv HTTP/1.1\r\nHost: cards.example\r\nConnection: close\r\n\r\n";
    assert_eq!(ledger(&stack).bytes_written, expected.len());
}

#[test]
fn asynchronous_resolution_feeds_the_channel() {
    let (stack, _, result) = fetch(Script {
        dns: DnsBehavior::Async(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))),
        ..Script::default().respond_in_chunks(&http_ok(b"x"), 64)
    });
    result.unwrap();
    assert_clean(&ledger(&stack));
}

#[test]
fn fetcher_can_run_again_with_a_fresh_session() {
    let raw = http_ok(b"deck");
    let stack = SimStack::spawn(Script::default().respond_in_chunks(&raw, 64));
    let fetcher = Fetcher::new(stack.clone(), config());

    for _ in 0..2 {
        let session = FetchSession::new();
        assert_eq!(fetcher.fetch(&session).unwrap(), raw.len());
    }
    let ledger = ledger(&stack);
    assert_eq!(ledger.conns_created, 2);
    assert_clean(&ledger);
}

#[test]
fn deferred_close_is_retried_until_it_succeeds() {
    let (stack, _, result) = fetch(Script {
        close_failures: 3,
        ..Script::default()
    });
    result.unwrap();
    let ledger = ledger(&stack);
    assert_eq!(ledger.close_attempts, 4);
    assert_clean(&ledger);
}

#[test]
fn boolean_contract_reports_success_and_failure() {
    let ok = Fetcher::new(SimStack::spawn(Script::default()), config());
    assert!(ok.fetch_ok(&FetchSession::new()));

    let failing = Fetcher::new(
        SimStack::spawn(Script {
            dns: DnsBehavior::Fail,
            ..Script::default()
        }),
        config(),
    );
    assert!(!failing.fetch_ok(&FetchSession::new()));
}

// --- accumulator scenarios ---

#[test]
fn two_identical_chunks_add_up() {
    let chunk = vec![b'a'; 500];
    let (stack, session, result) = fetch(Script {
        response: vec![vec![chunk.clone()], vec![chunk]],
        ..Script::default()
    });
    assert_eq!(result.unwrap(), 1000);
    assert_eq!(session.buffer().offset(), 1000);
    assert_clean(&ledger(&stack));
}

#[test]
fn exactly_capacity_bytes_loses_the_last_one() {
    let (stack, session, result) = fetch(Script {
        response: vec![vec![vec![b'z'; RESPONSE_CAPACITY - 1], vec![b'!']]],
        ..Script::default()
    });

    assert_eq!(result.unwrap(), RESPONSE_CAPACITY - 1);
    assert!(session.is_complete());
    assert_eq!(session.buffer().dropped(), 1);
    let terminated = session.buffer().terminated();
    assert_eq!(terminated.len(), RESPONSE_CAPACITY);
    assert_eq!(terminated[RESPONSE_CAPACITY - 1], 0);
    drop(terminated);
    assert_eq!(ledger(&stack).recved, RESPONSE_CAPACITY);
}

#[test]
fn oversized_segment_is_skipped_but_later_ones_fit() {
    let (_, session, result) = fetch(Script {
        response: vec![
            vec![b"HTTP/1.1 200 OK\r\n\r\n".to_vec()],
            vec![vec![0u8; RESPONSE_CAPACITY]],
            vec![b"tail".to_vec()],
        ],
        ..Script::default()
    });
    let len = result.unwrap();
    assert_eq!(&session.raw()[..], b"HTTP/1.1 200 OK\r\n\r\ntail");
    assert_eq!(len, 23);
    assert_eq!(session.buffer().dropped(), RESPONSE_CAPACITY);
}

#[test]
fn empty_chain_ends_the_response() {
    let raw = http_ok(b"deck");
    let mut response = Script::default().respond_in_chunks(&raw, 8).response;
    response.push(Vec::new());
    response.push(vec![Vec::new()]);
    let (stack, session, result) = fetch(Script {
        response,
        close_after_response: false,
        ..Script::default()
    });
    assert_eq!(result.unwrap(), raw.len());
    assert!(session.is_complete());
    assert_eq!(&session.raw()[..], &raw[..]);
    assert_clean(&ledger(&stack));
}

#[test]
fn empty_response_is_an_empty_terminated_string() {
    let (stack, session, result) = fetch(Script::default());
    assert_eq!(result.unwrap(), 0);
    assert!(session.is_complete());
    assert_eq!(&session.buffer().terminated()[..], &[0u8]);
    assert_clean(&ledger(&stack));
}

// --- resolution ---

#[test]
fn resolution_failure_allocates_nothing() {
    let (stack, _, result) = fetch(Script {
        dns: DnsBehavior::Fail,
        ..Script::default()
    });
    let err = result.unwrap_err();
    assert!(matches!(err, FetchError::Resolve { ref host } if host == "cards.example"));
    assert_eq!(err.stage(), Stage::Resolve);

    let ledger = ledger(&stack);
    assert_eq!(ledger.configs_created, 0);
    assert_eq!(ledger.conns_created, 0);
}

#[test]
fn refused_lookup_allocates_nothing() {
    let (stack, _, result) = fetch(Script {
        dns: DnsBehavior::StartError(StackError::Mem),
        ..Script::default()
    });
    assert!(matches!(
        result,
        Err(FetchError::ResolveStart { source: StackError::Mem, .. })
    ));
    assert_eq!(ledger(&stack).configs_created, 0);
}

#[test]
fn stalled_resolution_never_returns() {
    let (stack, returned) = returns_within_bound(Script {
        dns: DnsBehavior::Stall,
        ..Script::default()
    });
    assert!(!returned);
    let guard = stack.lock();
    assert_eq!(guard.stalled_lookups(), 1);
    assert_eq!(guard.ledger().configs_created, 0);
}

// --- channel establishment ---

#[test]
fn configuration_failure_frees_nothing() {
    let (stack, _, result) = fetch(Script {
        fail_config: true,
        ..Script::default()
    });
    assert!(matches!(result, Err(FetchError::Config)));
    let ledger = ledger(&stack);
    assert_eq!(ledger.configs_created, 0);
    assert_eq!(ledger.configs_freed, 0);
    assert_eq!(ledger.close_attempts, 0);
}

#[test]
fn connection_allocation_failure_frees_the_configuration() {
    let (stack, _, result) = fetch(Script {
        fail_new: true,
        ..Script::default()
    });
    assert!(matches!(result, Err(FetchError::Allocate)));
    let ledger = ledger(&stack);
    assert_eq!(ledger.configs_freed, 1);
    assert_eq!(ledger.close_attempts, 0);
    assert!(ledger.args.is_empty());
    assert_clean(&ledger);
}

#[test]
fn identity_failure_frees_connection_and_configuration() {
    let (stack, _, result) = fetch(Script {
        fail_hostname: Some(StackError::Value),
        ..Script::default()
    });
    let err = result.unwrap_err();
    assert!(matches!(err, FetchError::Identity { .. }));
    assert_eq!(err.stage(), Stage::Channel);
    let ledger = ledger(&stack);
    assert_eq!(ledger.close_attempts, 1);
    assert!(ledger.args.is_empty());
    assert_clean(&ledger);
}

#[test]
fn connect_failure_frees_connection_configuration_and_state() {
    let (stack, _, result) = fetch(Script {
        fail_connect: Some(StackError::Route),
        ..Script::default()
    });
    assert!(matches!(result, Err(FetchError::Connect { .. })));
    let ledger = ledger(&stack);
    assert_eq!(ledger.args.len(), 1);
    assert_clean(&ledger);
}

#[test]
fn releasing_state_twice_frees_once() {
    let stack = SimStack::spawn(Script::default());
    let mut guard = stack.lock();
    let config = guard.tls_create_config_client(b"anchor").unwrap();
    let state = ConnectionState::new(config);

    assert!(state.release(&mut *guard));
    assert!(!state.release(&mut *guard));
    assert_eq!(guard.ledger().configs_freed, 1);
    assert_eq!(guard.ledger().double_frees, 0);
}

#[test]
fn fatal_handshake_error_releases_resources_but_stalls() {
    let (stack, returned) = returns_within_bound(Script {
        handshake: Handshake::Fatal(StackError::Reset),
        ..Script::default()
    });
    assert!(!returned);
    let ledger = ledger(&stack);
    assert_eq!(ledger.configs_freed, 1);
    assert_eq!(ledger.live_conns(), 0);
    assert_eq!(ledger.close_attempts, 0);
    assert_eq!(ledger.double_frees, 0);
}

// --- transmission ---

#[test]
fn short_acknowledgement_keeps_the_send_waiting() {
    let (stack, returned) = returns_within_bound(Script {
        acks: AckPattern::Short(12),
        ..Script::default().respond_in_chunks(&http_ok(b"x"), 64)
    });
    assert!(!returned);
    let ledger = ledger(&stack);
    assert_eq!(ledger.close_attempts, 0);
    assert_eq!(ledger.live_conns(), 1);
}

#[test]
fn over_acknowledgement_fails_and_cleans_up() {
    let (stack, session, result) = fetch(Script {
        acks: AckPattern::Over(1),
        ..Script::default()
    });
    let err = result.unwrap_err();
    assert!(matches!(
        err,
        FetchError::SendMismatch { acknowledged, expected } if acknowledged as usize == expected + 1
    ));
    assert_eq!(err.stage(), Stage::Transmit);
    assert_eq!(session.buffer().offset(), 0);
    assert_clean(&ledger(&stack));
}

#[test]
fn slow_acknowledgements_are_waited_for() {
    let raw = http_ok(b"ok");
    let (stack, _, result) = fetch(Script {
        acks: AckPattern::Paced {
            parts: 2,
            idle_ticks: 50,
        },
        ..Script::default().respond_in_chunks(&raw, 8)
    });
    assert_eq!(result.unwrap(), raw.len());
    assert_clean(&ledger(&stack));
}

#[test]
fn acknowledgement_in_pieces_succeeds() {
    let (stack, _, result) = fetch(Script {
        acks: AckPattern::Split(4),
        ..Script::default().respond_in_chunks(&http_ok(b"ok"), 8)
    });
    result.unwrap();
    assert_clean(&ledger(&stack));
}

#[test]
fn flush_failure_fails_the_fetch() {
    let (stack, _, result) = fetch(Script {
        fail_output: Some(StackError::Mem),
        ..Script::default()
    });
    assert!(matches!(result, Err(FetchError::Output(StackError::Mem))));
    assert_clean(&ledger(&stack));
}

#[test]
fn fatal_error_after_send_stalls_the_response_wait() {
    let (stack, returned) = returns_within_bound(Script {
        fatal_after_send: Some(StackError::Abort),
        ..Script::default()
    });
    assert!(!returned);
    let ledger = ledger(&stack);
    assert_eq!(ledger.configs_freed, 1);
    assert_eq!(ledger.double_frees, 0);
}
