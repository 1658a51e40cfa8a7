//! Stream wrapper that is either plaintext or TLS, in either the server
//! or client direction, with in-place upgrades.

use std::{fs::File, io::BufReader, path::PathBuf, sync::Arc};

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{
    TlsAcceptor, TlsConnector,
    rustls::{
        ClientConfig, RootCertStore, ServerConfig,
        pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    },
};

use crate::error::{TlsError, TlsResult};

/// Server-side TLS settings: certificate chain and private key paths.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsServerContext {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

impl TlsServerContext {
    fn load_certs(&self) -> TlsResult<Vec<CertificateDer<'static>>> {
        let path = self.certificate.display().to_string();
        let mut reader =
            BufReader::new(File::open(&self.certificate).map_err(|e| TlsError::CertificateLoad {
                path: path.clone(),
                reason: e.to_string(),
            })?);
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::CertificateLoad {
                path,
                reason: e.to_string(),
            })
    }

    fn load_key(&self) -> TlsResult<PrivateKeyDer<'static>> {
        let path = self.key.display().to_string();
        let mut reader = BufReader::new(File::open(&self.key).map_err(|e| TlsError::KeyLoad {
            path: path.clone(),
            reason: e.to_string(),
        })?);

        match rustls_pemfile::read_one(&mut reader).map_err(|e| TlsError::KeyLoad {
            path: path.clone(),
            reason: e.to_string(),
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
            _ => Err(TlsError::KeyLoad {
                path,
                reason: "Unable to determine key file format (expected PKCS1, PKCS8, or SEC1)"
                    .to_string(),
            }),
        }
    }

    pub(crate) fn acceptor(&self) -> TlsResult<TlsAcceptor> {
        let certs = self.load_certs()?;
        let key = self.load_key()?;
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Client-side TLS settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsClientContext {
    /// Override for the name presented during the handshake; defaults to
    /// the host being connected to.
    pub server_name: Option<String>,
    /// Accept self-signed or otherwise unverifiable certificates. Only
    /// intended for testing.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl TlsClientContext {
    pub(crate) fn connector(&self) -> TlsResult<TlsConnector> {
        let mut root_store = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            root_store
                .add(cert)
                .map_err(|e| TlsError::Rustls(e.to_string()))?;
        }
        if !certs.errors.is_empty() {
            tracing::warn!(?certs.errors, "Some root certificates could not be loaded");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if self.accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        Ok(TlsConnector::from(Arc::new(config)))
    }

    pub(crate) fn server_name(&self, host: &str) -> TlsResult<ServerName<'static>> {
        let name = self.server_name.as_deref().unwrap_or(host);
        ServerName::try_from(name.to_string()).map_err(|e| TlsError::ServerName(e.to_string()))
    }
}

/// A certificate verifier that accepts all certificates (testing only).
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// The transport under an SMTP session.
pub enum Connection<S: AsyncRead + AsyncWrite + Unpin + Send> {
    Plain(S),
    ServerTls(Box<tokio_rustls::server::TlsStream<S>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<S>>),
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Self::Plain(_))
    }

    pub(crate) async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::ServerTls(stream) => stream.read(buf).await,
            Self::ClientTls(stream) => stream.read(buf).await,
        }
    }

    pub(crate) async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await,
            Self::ServerTls(stream) => stream.write_all(data).await,
            Self::ClientTls(stream) => stream.write_all(data).await,
        }
    }

    /// Perform a server-side TLS handshake in place. Returns the upgraded
    /// connection, or the error alongside nothing when the handshake
    /// itself failed (the stream is consumed either way).
    pub(crate) async fn accept_tls(self, context: &TlsServerContext) -> TlsResult<Self> {
        let acceptor = context.acceptor()?;
        match self {
            Self::Plain(stream) => {
                let stream = acceptor.accept(stream).await?;
                Ok(Self::ServerTls(Box::new(stream)))
            }
            other => Ok(other),
        }
    }

    /// Perform a client-side TLS handshake in place.
    pub(crate) async fn connect_tls(self, context: &TlsClientContext, host: &str) -> TlsResult<Self> {
        let connector = context.connector()?;
        let server_name = context.server_name(host)?;
        match self {
            Self::Plain(stream) => {
                let stream = connector.connect(server_name, stream).await?;
                Ok(Self::ClientTls(Box::new(stream)))
            }
            other => Ok(other),
        }
    }

    /// Shut the stream down, ignoring errors from an already-gone peer.
    pub(crate) async fn close(&mut self) {
        let _ = match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::ServerTls(stream) => stream.shutdown().await,
            Self::ClientTls(stream) => stream.shutdown().await,
        };
    }
}
