//! HTTPS server that hands out a flashcard deck as CSV.
//!
//! # Design
//! `app` is a plain axum `Router` so it can be tested with `oneshot`. `run`
//! terminates TLS with tokio-rustls and serves each connection with hyper's
//! HTTP/1 server, which honours `Connection: close` by closing once the
//! response is written. `self_signed` mints a throwaway certificate that a
//! client can pin as its only trust anchor.

use std::sync::Arc;

use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use bytes::Bytes;
use hyper::{body::Incoming, server::conn::http1, Request};
use hyper_util::rt::TokioIo;
use rcgen::CertifiedKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::{debug, info, warn};

pub const DECK_PATH: &str = "/anki-csv-decks/cards.csv";

#[derive(Clone)]
struct Deck(Bytes);

pub fn app(deck: impl Into<Bytes>) -> Router {
    Router::new()
        .route(DECK_PATH, get(serve_deck))
        .route("/health", get(|| async { "ok" }))
        .with_state(Deck(deck.into()))
}

async fn serve_deck(State(Deck(deck)): State<Deck>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], deck)
}

/// A small Spanish-English deck.
pub fn sample_deck() -> String {
    let cards = [
        ("hola", "hello"),
        ("gracias", "thank you"),
        ("perro", "dog"),
        ("gato", "cat"),
        ("casa", "house"),
        ("agua", "water"),
    ];
    let mut csv = String::from("front,back\n");
    for (front, back) in cards {
        csv.push_str(front);
        csv.push(',');
        csv.push_str(back);
        csv.push('\n');
    }
    csv
}

/// A deck of at least `min_len` bytes, made of numbered cards.
pub fn large_deck(min_len: usize) -> String {
    let mut csv = String::from("front,back\n");
    let mut n = 0;
    while csv.len() < min_len {
        csv.push_str(&format!("word {n},meaning {n}\n"));
        n += 1;
    }
    csv
}

/// Certificate and key for the server side of the TLS session.
pub struct TlsIdentity {
    pub cert_pem: String,
    pub cert_der: Vec<u8>,
    key_der: Vec<u8>,
}

impl TlsIdentity {
    pub fn acceptor(&self) -> Result<TlsAcceptor, rustls::Error> {
        let cert = CertificateDer::from(self.cert_der.clone());
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Self-signed certificate valid for `hosts`.
pub fn self_signed(hosts: &[&str]) -> Result<TlsIdentity, rcgen::Error> {
    let names: Vec<String> = hosts.iter().map(|host| host.to_string()).collect();
    let CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)?;
    Ok(TlsIdentity {
        cert_pem: cert.pem(),
        cert_der: cert.der().to_vec(),
        key_der: key_pair.serialize_der(),
    })
}

/// Accept TLS connections on `listener` forever.
pub async fn run(listener: TcpListener, app: Router, acceptor: TlsAcceptor) -> Result<(), std::io::Error> {
    info!(addr = %listener.local_addr()?, "serving");
    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(err) => {
                    warn!(%peer, %err, "TLS handshake failed");
                    return;
                }
            };
            let service = hyper::service::service_fn(move |request: Request<Incoming>| {
                app.clone().oneshot(request)
            });
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!(%peer, %err, "connection ended with error");
            }
        });
    }
}
