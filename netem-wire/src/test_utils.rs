//! Traffic generators for tests of crates built on top of this one.

use std::sync::Arc;

/// Produces the first flight of a real rustls client connecting to `server_name`.
///
/// # Panics
///
/// If `server_name` is not a valid DNS name or IP address.
pub fn client_hello(server_name: &str) -> Vec<u8> {
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();

    let server_name = server_name.try_into().expect("invalid server name");
    let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
        .expect("client config without roots is always usable");

    let mut out = Vec::new();
    while conn.wants_write() {
        conn.write_tls(&mut out).expect("writing to a Vec cannot fail");
    }
    out
}
