//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use secure_tcp_server::config::{
    ClientTlsConfig, InvalidCertificatePolicy, ListenerConfig, PoolConfig, ServerConfig,
    TimeoutConfig, TlsConfig, TlsVersion,
};
use secure_tcp_server::net::Listener;
use secure_tcp_server::{
    ClientTlsContext, ConnectionHandler, EchoHandler, PoolStats, ServerTlsContext, TcpServer,
};

/// How long counters get to converge after a socket closes.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

pub fn pool_config(max_threads: usize, max_queued: usize) -> PoolConfig {
    PoolConfig {
        max_threads,
        max_queued,
        thread_idle_time_ms: 10_000,
    }
}

/// Server TLS settings using the test certificate, with caching enabled.
pub fn server_tls(protocols: &[TlsVersion], session_timeout_secs: u64) -> TlsConfig {
    let mut tls = TlsConfig::new(
        fixture("server.pem").to_string_lossy(),
        fixture("server.key").to_string_lossy(),
    );
    tls.protocols = protocols.to_vec();
    tls.session_cache.enable_cache = true;
    tls.session_cache.cache_name = "integration".into();
    tls.session_cache.session_timeout_secs = session_timeout_secs;
    tls
}

/// Client settings trusting the test CA.
pub fn client_tls(policy: InvalidCertificatePolicy) -> ClientTlsConfig {
    ClientTlsConfig {
        ca_path: Some(fixture("ca.pem").to_string_lossy().into_owned()),
        server_name: "localhost".into(),
        invalid_certificate_handler: policy,
        ..ClientTlsConfig::default()
    }
}

pub fn client(config: &ClientTlsConfig) -> ClientTlsContext {
    ClientTlsContext::from_config(config).expect("client TLS context")
}

/// Start an echo server on an ephemeral loopback port.
pub async fn start_server(pool: PoolConfig, tls: Option<TlsConfig>) -> TcpServer {
    start_server_with(pool, tls, Arc::new(EchoHandler)).await
}

/// Start a server running `handler` on an ephemeral loopback port.
pub async fn start_server_with(
    pool: PoolConfig,
    tls: Option<TlsConfig>,
    handler: Arc<dyn ConnectionHandler>,
) -> TcpServer {
    let config = ServerConfig {
        listener: ListenerConfig {
            bind_address: "127.0.0.1:0".into(),
        },
        pool,
        tls,
        timeouts: TimeoutConfig {
            handshake_secs: 5,
            shutdown_grace_secs: 1,
        },
        ..ServerConfig::default()
    };

    let tls = config
        .tls
        .as_ref()
        .map(|tls| ServerTlsContext::from_config(tls).expect("server TLS context"));
    let listener = Listener::bind(&config.listener).await.expect("bind");
    let server = TcpServer::new(listener, handler, &config, tls);
    server.start().expect("start");
    server
}

/// Wait until the server's counters satisfy `check`.
pub async fn settle(server: &TcpServer, check: impl Fn(&PoolStats) -> bool) -> PoolStats {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let stats = server.stats();
        if check(&stats) {
            return stats;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "counters did not settle: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect")
}

/// Send `message` and expect it echoed back within the settle timeout.
pub async fn echo(stream: &mut TcpStream, message: &[u8]) {
    stream.write_all(message).await.expect("write");
    let mut echoed = vec![0u8; message.len()];
    tokio::time::timeout(SETTLE_TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .expect("read");
    assert_eq!(echoed, message);
}

/// Whether the server closed `stream` without sending anything.
pub async fn closed_by_server(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    match tokio::time::timeout(SETTLE_TIMEOUT, stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

/// Whether `stream` stays silent for `wait`.
pub async fn stays_silent(stream: &mut TcpStream, wait: Duration) -> bool {
    let mut buf = [0u8; 1];
    tokio::time::timeout(wait, stream.read(&mut buf)).await.is_err()
}
