use crate::config::TlsClientConfig;
use crate::error::ProxyError;
use log::{debug, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::Resumption;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// Accepts any server certificate. Installed only for `insecureSkipVerify`.
#[derive(Debug)]
struct NoVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Client-side TLS shared by every outbound connection. Sessions are resumed
/// from a bounded in-memory cache.
#[derive(Clone)]
pub struct TlsClient {
    config: Arc<ClientConfig>,
    connector: TlsConnector,
    handshake_timeout: Duration,
}

impl TlsClient {
    pub fn from_config(settings: &TlsClientConfig, handshake_timeout: Duration) -> Result<Self, ProxyError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| ProxyError::Tls(format!("Failed to select protocol versions: {}", e)))?;

        let mut config = if settings.insecure_skip_verify {
            warn!("TLS certificate verification is disabled for outbound connections");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier { provider }))
                .with_no_client_auth()
        } else {
            let roots = RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            };
            builder.with_root_certificates(roots).with_no_client_auth()
        };

        config.resumption = Resumption::in_memory_sessions(settings.session_cache_capacity());
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        debug!(
            "TLS client ready: verify={}, session cache={}, handshake timeout={:?}",
            !settings.insecure_skip_verify,
            settings.session_cache_capacity(),
            handshake_timeout
        );

        let config = Arc::new(config);
        Ok(Self {
            connector: TlsConnector::from(config.clone()),
            config,
            handshake_timeout,
        })
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.config.clone()
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Run the client handshake for `host` over an established stream.
    pub async fn connect<IO>(&self, host: &str, io: IO) -> Result<TlsStream<IO>, ProxyError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let name = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let server_name = ServerName::try_from(name)
            .map_err(|e| ProxyError::Tls(format!("Invalid server name {}: {}", host, e)))?;

        match tokio::time::timeout(self.handshake_timeout, self.connector.connect(server_name, io)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::Tls(format!("Handshake with {} failed: {}", host, e))),
            Err(_) => Err(ProxyError::Tls(format!(
                "Handshake with {} timed out after {:?}",
                host, self.handshake_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_client_config_settings() {
        let settings = TlsClientConfig {
            insecure_skip_verify: false,
            session_cache_size: 0,
        };
        let client = TlsClient::from_config(&settings, Duration::from_secs(3)).unwrap();
        let config = client.client_config();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        assert_eq!(client.handshake_timeout(), Duration::from_secs(3));

        let insecure = TlsClientConfig {
            insecure_skip_verify: true,
            session_cache_size: 4,
        };
        assert!(TlsClient::from_config(&insecure, Duration::from_secs(3)).is_ok());
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and stay silent
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(socket);
        });

        let client = TlsClient::from_config(&TlsClientConfig::default(), Duration::from_millis(100)).unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let err = client.connect("localhost", stream).await.unwrap_err();
        assert!(matches!(err, ProxyError::Tls(ref m) if m.contains("timed out")));
        server.abort();
    }

    #[tokio::test]
    async fn test_handshake_with_plaintext_server_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });

        let client = TlsClient::from_config(&TlsClientConfig::default(), Duration::from_secs(2)).unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let err = client.connect("127.0.0.1", stream).await.unwrap_err();
        assert!(matches!(err, ProxyError::Tls(ref m) if m.contains("failed")));
    }
}
