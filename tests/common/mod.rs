//! Common utilities for integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tproxy_tunnel::config::RelayConfig;
use tproxy_tunnel::tls;

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

    let cert_path = temp_dir.join(format!("relay-test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("relay-test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert(
        "localhost",
        &["127.0.0.1".to_string(), "localhost".to_string()],
        &cert_path,
        &key_path,
    )
    .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Start a TLS echo server on an ephemeral port
pub async fn start_tls_echo_server(
    cert: &PathBuf,
    key: &PathBuf,
) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let server_config = tls::load_server_config(cert, key).expect("Failed to load server config");
    let acceptor = TlsAcceptor::from(server_config);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind echo server");
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut stream) = acceptor.accept(socket).await else {
                    return;
                };
                let mut buf = vec![0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, handle)
}

/// Start a TLS server that completes handshakes, then never reads or closes
pub async fn start_silent_tls_server(
    cert: &PathBuf,
    key: &PathBuf,
) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let server_config = tls::load_server_config(cert, key).expect("Failed to load server config");
    let acceptor = TlsAcceptor::from(server_config);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind silent server");
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            if let Ok(stream) = acceptor.accept(socket).await {
                held.push(stream);
            }
        }
    });

    (addr, handle)
}

/// Relay configuration pointing at `remote`, trusting `ca`
pub fn relay_config(remote: SocketAddr, ca: &PathBuf) -> RelayConfig {
    RelayConfig::from_toml(&format!(
        r#"
        local_addr = "127.0.0.1"
        local_port = 1080
        remote_addr = "127.0.0.1"
        remote_port = {}

        [tcp]
        connect_time_out = 5

        [ssl]
        sni = "localhost"
        cert = "{}"
        "#,
        remote.port(),
        ca.display()
    ))
    .expect("Failed to build relay config")
}

/// A connected (client, accepted) TCP pair on loopback
pub async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap())
        .await
        .unwrap();
    let (accepted, _) = listener.accept().await.unwrap();
    (client, accepted)
}

/// Read until `len` bytes arrived or the peer closed
pub async fn read_at_least<R>(reader: &mut R, len: usize, timeout_duration: Duration) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut response = Vec::new();
    let mut buf = vec![0u8; 8192];
    timeout(timeout_duration, async {
        while response.len() < len {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => response.extend_from_slice(&buf[..n]),
            }
        }
    })
    .await
    .expect("Timeout waiting for response");
    response
}

/// Remove generated certificate files
pub fn cleanup_certs(cert: &PathBuf, key: &PathBuf) {
    let _ = std::fs::remove_file(cert);
    let _ = std::fs::remove_file(key);
}
