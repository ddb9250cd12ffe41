use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "8443".to_string());
    let cert_out = std::env::var("CERT_OUT").unwrap_or_else(|_| "mock-server-cert.pem".to_string());

    let identity = mock_server::self_signed(&["localhost"])?;
    std::fs::write(&cert_out, &identity.cert_pem)?;
    info!(path = %cert_out, "wrote trust anchor");

    let addr = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&addr).await?;
    println!("listening on https://localhost:{port}{}", mock_server::DECK_PATH);
    mock_server::run(listener, mock_server::app(mock_server::sample_deck()), identity.acceptor()?).await?;
    Ok(())
}
