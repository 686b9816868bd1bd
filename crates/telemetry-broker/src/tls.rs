//! mTLS transport and peer-CN extraction (§4.F step 1, §6 "TLS").
//!
//! gRPC is the wire protocol this workspace's documentation describes, but
//! generating the protobuf codec requires a `protoc` toolchain this build
//! environment does not have; `axum` + `axum-server`'s rustls acceptor with
//! client-certificate authentication gives the same mutual-TLS guarantee
//! (both sides present an X.509 certificate signed by the shared CA, peer
//! identity = certificate CN) over HTTP instead.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower_http::add_extension::AddExtension;

use crate::error::{BrokerError, Result};

/// Certificate-CN identity of the peer that completed the mTLS handshake
/// for this connection, inserted as a request extension by
/// [`PeerCnAcceptor`].
#[derive(Debug, Clone)]
pub struct PeerCn(pub String);

/// Build a `rustls::ServerConfig` that requires the client to present a
/// certificate signed by `ca_cert_path`, and presents `cert_path`/`key_path`
/// as the broker's own identity.
pub fn server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    ca_pem: &[u8],
) -> Result<Arc<rustls::ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| BrokerError::Tls(format!("invalid server cert: {e}")))?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| BrokerError::Tls(format!("invalid server key: {e}")))?
        .ok_or_else(|| BrokerError::Tls("no private key found".into()))?;

    let mut roots = RootCertStore::empty();
    for ca in rustls_pemfile::certs(&mut &ca_pem[..]) {
        let ca = ca.map_err(|e| BrokerError::Tls(format!("invalid ca cert: {e}")))?;
        roots
            .add(ca)
            .map_err(|e| BrokerError::Tls(format!("failed to add ca cert: {e}")))?;
    }

    let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| BrokerError::Tls(format!("failed to build client verifier: {e}")))?;

    let mut config = rustls::ServerConfig::builder()
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(certs, key)
        .map_err(|e| BrokerError::Tls(format!("failed to build server config: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

pub async fn load_server_config(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
    ca_path: &std::path::Path,
) -> Result<RustlsConfig> {
    let cert_pem = tokio::fs::read(cert_path).await?;
    let key_pem = tokio::fs::read(key_path).await?;
    let ca_pem = tokio::fs::read(ca_path).await?;
    let config = server_config(&cert_pem, &key_pem, &ca_pem)?;
    Ok(RustlsConfig::from_config(config))
}

/// Extract the certificate-chain leaf's subject CN from a completed TLS
/// connection. Requires client auth to have been enforced by the
/// `ServerConfig` — a connection without a client certificate never reaches
/// this point.
pub fn extract_peer_cn<T>(tls_stream: &TlsStream<T>) -> Result<String> {
    let (_, conn) = tls_stream.get_ref();
    let certs = conn
        .peer_certificates()
        .ok_or_else(|| BrokerError::Tls("no client certificate presented".into()))?;
    let leaf = certs
        .first()
        .ok_or_else(|| BrokerError::Tls("empty client certificate chain".into()))?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| BrokerError::Tls(format!("failed to parse client certificate: {e}")))?;
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or_else(|| BrokerError::Tls("client certificate missing CN".into()))?;
    Ok(cn.to_string())
}

/// Wraps [`RustlsAcceptor`] to additionally extract the peer's certificate
/// CN and attach it to the accepted connection's service as a [`PeerCn`]
/// request extension, via `tower_http`'s `AddExtension`.
#[derive(Clone)]
pub struct PeerCnAcceptor<A = axum_server::accept::DefaultAcceptor> {
    inner: RustlsAcceptor<A>,
}

impl PeerCnAcceptor {
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<A, I, S> Accept<I, S> for PeerCnAcceptor<A>
where
    A: Accept<I, S> + Clone + Send + Sync + 'static,
    A::Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    A::Service: Send + 'static,
    A::Future: Send + 'static,
    I: Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<A::Stream>;
    type Service = AddExtension<A::Service, PeerCn>;
    type Future =
        Pin<Box<dyn Future<Output = io::Result<(Self::Stream, Self::Service)>> + Send>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move {
            let (tls_stream, service) = inner.accept(stream, service).await?;
            let peer_cn = extract_peer_cn(&tls_stream)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            let service = AddExtension::new(service, PeerCn(peer_cn));
            Ok((tls_stream, service))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use rustls::RootCertStore;
    use std::sync::Arc;
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    fn generate_leaf_signed_by(_ca: &rcgen::Certificate, cn: &str) -> rcgen::Certificate {
        let mut params = rcgen::CertificateParams::new(vec![cn.to_string()]);
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        rcgen::Certificate::from_params(params).unwrap()
    }

    #[tokio::test]
    async fn extracts_peer_cn_from_client_certificate() {
        let ca_params = {
            let mut p = rcgen::CertificateParams::new(vec![]);
            p.distinguished_name = rcgen::DistinguishedName::new();
            p.distinguished_name
                .push(rcgen::DnType::CommonName, "test-ca");
            p.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
            p
        };
        let ca_cert = rcgen::Certificate::from_params(ca_params).unwrap();

        let client_cert = generate_leaf_signed_by(&ca_cert, "agent-1");
        let client_der = client_cert.serialize_der_with_signer(&ca_cert).unwrap();
        let client_key = PrivateKeyDer::try_from(client_cert.serialize_private_key_der()).unwrap();

        let server_params = {
            let mut p = rcgen::CertificateParams::new(vec!["localhost".to_string()]);
            p.distinguished_name = rcgen::DistinguishedName::new();
            p.distinguished_name
                .push(rcgen::DnType::CommonName, "broker");
            p
        };
        let server_cert = rcgen::Certificate::from_params(server_params).unwrap();
        let server_der = server_cert.serialize_der_with_signer(&ca_cert).unwrap();
        let server_key = PrivateKeyDer::try_from(server_cert.serialize_private_key_der()).unwrap();

        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::from(ca_cert.serialize_der().unwrap()))
            .unwrap();

        let client_verifier = WebPkiClientVerifier::builder(Arc::new(roots.clone()))
            .build()
            .unwrap();
        let server_config = Arc::new(
            rustls::ServerConfig::builder()
                .with_client_cert_verifier(client_verifier)
                .with_single_cert(vec![CertificateDer::from(server_der)], server_key)
                .unwrap(),
        );

        let mut client_roots = RootCertStore::empty();
        client_roots
            .add(CertificateDer::from(ca_cert.serialize_der().unwrap()))
            .unwrap();
        let client_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(client_roots)
                .with_client_auth_cert(vec![CertificateDer::from(client_der)], client_key)
                .unwrap(),
        );

        let (client_io, server_io) = tokio::io::duplex(8192);

        let server_acceptor = TlsAcceptor::from(server_config);
        let client_connector = TlsConnector::from(client_config);

        let server_task = tokio::spawn(async move { server_acceptor.accept(server_io).await });
        let client_task = tokio::spawn(async move {
            client_connector
                .connect(rustls::pki_types::ServerName::try_from("localhost").unwrap(), client_io)
                .await
        });

        let server_tls = server_task.await.unwrap().unwrap();
        client_task.await.unwrap().unwrap();

        let cn = extract_peer_cn(&server_tls).unwrap();
        assert_eq!(cn, "agent-1");
    }
}
