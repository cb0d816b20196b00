//! Test utilities and fixtures shared across the test suite.

use rustls::pki_types::PrivatePkcs8KeyDer;
use smq::server::{ServerConfig, ServerInstance};
use smq::smp::SmpServer;
use smq::transport::tls::TlsIdentity;
use std::path::Path;

/// A throwaway self-signed TLS identity for a test server.
pub fn test_identity() -> TlsIdentity {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generating test certificate");
    let cert_der = cert.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    TlsIdentity::from_der(vec![cert_der], key.into()).expect("building test identity")
}

/// A loopback config on an ephemeral port over a tempdir database.
pub fn test_config(dir: &Path, quota: usize) -> ServerConfig {
    ServerConfig {
        tcp_port: 0,
        ws_port: None,
        bind_host: "127.0.0.1".to_string(),
        tls_private_key_file: dir.join("unused-key.pem"),
        tls_certificate_file: dir.join("unused-cert.pem"),
        sqlite_database: dir.join("queues.db"),
        message_quota_per_queue: quota,
        max_active_queues: 1000,
        log_level: "debug".to_string(),
        idle_timeout_secs: 30,
    }
}

/// Starts a server and returns it with its pinned address.
pub async fn start_server(dir: &Path, quota: usize) -> (ServerInstance, SmpServer) {
    let server = ServerInstance::start_with_identity(test_config(dir, quota), test_identity())
        .await
        .expect("starting test server");
    let address = SmpServer::new(
        "localhost",
        Some(server.tcp_addr().port()),
        Some(server.key_hash()),
    );
    (server, address)
}
