//! HTTP/1.1 client: sessions, requests, responses and the machinery underneath.
//!
//! Most programs only need a [`Session`]. The lower layers ([`pool::Pool`],
//! [`conn::Connector`], [`codec`]) are public so they can be driven directly.

pub mod auth;
pub mod batch;
pub mod body;
pub mod builder;
pub mod codec;
pub mod config;
pub mod conn;
pub mod cookies;
pub mod error;
pub mod executor;
pub mod pool;
pub mod request;
pub mod response;
pub mod session;

pub use self::auth::{Auth, Authenticate};
pub use self::body::Body;
pub use self::builder::SessionBuilder;
pub use self::config::SessionConfig;
pub use self::cookies::CookieJar;
pub use self::error::{ConnectionError, Error, HttpStatusError, StatusClass, TimeoutPhase};
pub use self::executor::Executor;
pub use self::pool::Config as PoolConfig;
pub use self::pool::{Pool, PoolStats};
pub use self::request::{Data, Request, RequestOptions};
pub use self::response::Response;
pub use self::session::Session;

#[cfg(feature = "tls")]
/// Get a default TLS client configuration by loading the platform's native certificates.
///
/// Only `http/1.1` is offered through ALPN.
pub fn default_tls_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        tracing::warn!(%error, "could not load platform certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::trace!(added, ignored, "loaded platform certificates");

    let mut cfg = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .expect("built-in crypto providers support the default protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();

    cfg.alpn_protocols.push(b"http/1.1".to_vec());
    cfg
}

#[cfg(feature = "tls")]
fn crypto_provider() -> std::sync::Arc<rustls::crypto::CryptoProvider> {
    if let Some(provider) = rustls::crypto::CryptoProvider::get_default() {
        return provider.clone();
    }

    #[cfg(feature = "tls-ring")]
    {
        std::sync::Arc::new(rustls::crypto::ring::default_provider())
    }

    #[cfg(all(feature = "tls-aws-lc", not(feature = "tls-ring")))]
    {
        std::sync::Arc::new(rustls::crypto::aws_lc_rs::default_provider())
    }

    #[cfg(not(any(feature = "tls-aws-lc", feature = "tls-ring")))]
    {
        unreachable!("a TLS backend feature is required")
    }
}
