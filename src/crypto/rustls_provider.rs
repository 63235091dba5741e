//! TLS over stream transports, backed by rustls with the ring provider.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, Connection, DigitallySignedStruct, ServerConfig,
    ServerConnection, SignatureScheme, SupportedCipherSuite,
};

use super::{
    ClientParams, CryptoProvider, CryptoSession, EngineError, Progress, Role, ServerSetup, Want,
};
use crate::alpn::AlpnProto;
use crate::bio::FifoIo;
use crate::config::Config;
use crate::listen::ListenParams;
use crate::offload::AsyncNotifier;
use crate::session::TransportProto;
use crate::trust::TrustStore;
use crate::Error;

/// Provider name, also the engine tag of contexts it serves.
pub const RUSTLS_ENGINE: &str = "rustls";

#[derive(Debug, Default)]
pub struct RustlsProvider;

impl RustlsProvider {
    pub fn new() -> Self {
        RustlsProvider
    }

    /// Ring provider restricted to the configured cipher list.
    fn crypto(&self, config: &Config) -> Result<Arc<rustls::crypto::CryptoProvider>, Error> {
        let mut provider = ring::default_provider();
        let allowed = config.ciphers();
        if !allowed.is_empty() {
            provider
                .cipher_suites
                .retain(|s| allowed.iter().any(|a| a.eq_ignore_ascii_case(&suite_name(s))));
            if provider.cipher_suites.is_empty() {
                return Err(Error::Config(format!(
                    "no supported cipher in list {:?}",
                    allowed
                )));
            }
        }
        if config.record_split_size().is_some() || config.max_pipelines().is_some() {
            debug!("Record split size and pipelines are not used by {}", RUSTLS_ENGINE);
        }
        Ok(Arc::new(provider))
    }
}

/// Bytes of TLS record header in front of each fragment.
const RECORD_HEADER_LEN: usize = 5;

/// rustls counts the record header in `max_fragment_size`, the configured
/// record size is plaintext only.
fn max_fragment_size(config: &Config) -> Option<usize> {
    config.record_size().map(|n| n + RECORD_HEADER_LEN)
}

fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite())
}

fn config_err(e: rustls::Error) -> Error {
    Error::Config(e.to_string())
}

impl CryptoProvider for RustlsProvider {
    fn name(&self) -> &'static str {
        RUSTLS_ENGINE
    }

    fn server_setup(
        &self,
        config: &Config,
        params: &ListenParams,
    ) -> Result<Arc<dyn ServerSetup>, Error> {
        if params.proto == TransportProto::Datagram {
            return Err(Error::Unsupported("datagram transport with rustls"));
        }
        let certs = params.cert_key.certificates()?;
        let key = params.cert_key.private_key()?;

        let mut server = ServerConfig::builder_with_provider(self.crypto(config)?)
            .with_safe_default_protocol_versions()
            .map_err(config_err)?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::Certificate(e.to_string()))?;
        server.alpn_protocols = AlpnProto::wire_list(&params.alpn);
        server.max_fragment_size = max_fragment_size(config);

        Ok(Arc::new(RustlsServerSetup {
            config: Arc::new(server),
        }))
    }

    fn client_session(
        &self,
        config: &Config,
        trust: Option<&TrustStore>,
        params: &ClientParams,
        _notifier: Option<AsyncNotifier>,
    ) -> Result<Box<dyn CryptoSession>, Error> {
        if params.proto == TransportProto::Datagram {
            return Err(Error::Unsupported("datagram transport with rustls"));
        }
        let provider = self.crypto(config)?;
        let verifier = Arc::new(RecordingVerifier::new(trust, provider.clone()));

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(config_err)?
            .dangerous()
            .with_custom_certificate_verifier(verifier.clone());
        let mut client = match &params.cert_key {
            Some(ck) => builder
                .with_client_auth_cert(ck.certificates()?, ck.private_key()?)
                .map_err(|e| Error::Certificate(e.to_string()))?,
            None => builder.with_no_client_auth(),
        };
        client.alpn_protocols = AlpnProto::wire_list(&params.alpn);
        client.max_fragment_size = max_fragment_size(config);

        let name = match &params.hostname {
            Some(host) => ServerName::try_from(host.clone())
                .map_err(|e| Error::Config(format!("invalid hostname {}: {}", host, e)))?,
            // Placeholder: verification outcome is ignored without a hostname.
            None => ServerName::IpAddress(IpAddr::V4(Ipv4Addr::UNSPECIFIED).into()),
        };
        let conn = ClientConnection::new(Arc::new(client), name).map_err(config_err)?;

        Ok(Box::new(RustlsSession::new(
            Connection::Client(conn),
            Role::Client,
            Some(verifier),
        )))
    }
}

struct RustlsServerSetup {
    config: Arc<ServerConfig>,
}

impl ServerSetup for RustlsServerSetup {
    fn new_session(
        &self,
        _notifier: Option<AsyncNotifier>,
    ) -> Result<Box<dyn CryptoSession>, Error> {
        let conn = ServerConnection::new(self.config.clone()).map_err(config_err)?;
        Ok(Box::new(RustlsSession::new(
            Connection::Server(conn),
            Role::Server,
            None,
        )))
    }
}

/// Server certificate verifier that records the outcome instead of aborting.
///
/// Whether a failed verification is fatal depends on the connection's
/// hostname, which the handshake driver checks once the handshake is done.
/// Handshake signatures are always checked.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<rustls::crypto::CryptoProvider>,
    outcome: OnceCell<Result<(), String>>,
}

impl RecordingVerifier {
    fn new(trust: Option<&TrustStore>, provider: Arc<rustls::crypto::CryptoProvider>) -> Self {
        let inner = trust.and_then(|t| {
            WebPkiServerVerifier::builder_with_provider(t.roots(), provider.clone())
                .build()
                .map_err(|e| debug!("No webpki verifier: {}", e))
                .ok()
        });
        RecordingVerifier {
            inner,
            provider,
            outcome: OnceCell::new(),
        }
    }

    fn outcome(&self) -> Result<(), String> {
        self.outcome.get().cloned().unwrap_or(Ok(()))
    }
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let result = match &self.inner {
            Some(inner) => inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            None => Err("no trusted roots".to_string()),
        };
        trace!("Server certificate verification: {:?}", result);
        let _ = self.outcome.set(result);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

struct RustlsSession {
    conn: Connection,
    role: Role,
    verifier: Option<Arc<RecordingVerifier>>,
    plaintext: usize,
}

impl RustlsSession {
    fn new(conn: Connection, role: Role, verifier: Option<Arc<RecordingVerifier>>) -> Self {
        RustlsSession {
            conn,
            role,
            verifier,
            plaintext: 0,
        }
    }

    /// Push queued ciphertext to the transport. Returns false if some is left.
    fn flush(&mut self, io: &mut FifoIo) -> Result<bool, EngineError> {
        while self.conn.wants_write() {
            match self.conn.write_tls(io) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(EngineError::Io(e.to_string())),
            }
        }
        Ok(true)
    }

    /// Feed one chunk of ciphertext to the state machine. Returns false if
    /// the transport had nothing.
    fn ingest(&mut self, io: &mut FifoIo) -> Result<bool, EngineError> {
        match self.conn.read_tls(io) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(EngineError::Io(e.to_string())),
        }
        match self.conn.process_new_packets() {
            Ok(state) => {
                self.plaintext = state.plaintext_bytes_to_read();
                Ok(true)
            }
            Err(e) => {
                // Get the alert out before reporting.
                let _ = self.flush(io);
                Err(EngineError::Protocol(e.to_string()))
            }
        }
    }
}

impl CryptoSession for RustlsSession {
    fn role(&self) -> Role {
        self.role
    }

    fn in_init(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn handshake(&mut self, io: &mut FifoIo) -> Result<Progress<()>, EngineError> {
        self.flush(io)?;
        while self.conn.is_handshaking() && self.ingest(io)? {
            self.flush(io)?;
        }
        if self.conn.wants_write() {
            return Ok(Progress::Blocked(Want::Write));
        }
        if self.conn.is_handshaking() {
            return Ok(Progress::Blocked(Want::Read));
        }
        Ok(Progress::Ready(()))
    }

    fn read(&mut self, io: &mut FifoIo, buf: &mut [u8]) -> Result<Progress<usize>, EngineError> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) => {
                    self.plaintext = self.plaintext.saturating_sub(n);
                    return Ok(Progress::Ready(n));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(EngineError::Protocol(e.to_string())),
            }
            let got = self.ingest(io)?;
            // Key updates and alerts produced while reading.
            self.flush(io)?;
            if !got {
                return Ok(Progress::Blocked(Want::Read));
            }
        }
    }

    fn write(&mut self, io: &mut FifoIo, data: &[u8]) -> Result<Progress<usize>, EngineError> {
        if !self.flush(io)? {
            return Ok(Progress::Blocked(Want::Write));
        }
        let n = self
            .conn
            .writer()
            .write(data)
            .map_err(|e| EngineError::Io(e.to_string()))?;
        self.flush(io)?;
        if n == 0 && !data.is_empty() {
            return Ok(Progress::Blocked(Want::Write));
        }
        Ok(Progress::Ready(n))
    }

    fn shutdown(&mut self, io: &mut FifoIo) -> Result<(), EngineError> {
        self.conn.send_close_notify();
        self.flush(io)?;
        Ok(())
    }

    fn pending(&self) -> usize {
        self.plaintext
    }

    fn has_pending_output(&self) -> bool {
        self.conn.wants_write()
    }

    fn alpn_selected(&self) -> Option<Vec<u8>> {
        self.conn.alpn_protocol().map(|p| p.to_vec())
    }

    fn verify_result(&self) -> Result<(), String> {
        match &self.verifier {
            Some(v) => v.outcome(),
            None => Ok(()),
        }
    }

    fn cipher_name(&self) -> Option<String> {
        self.conn.negotiated_cipher_suite().map(|s| suite_name(&s))
    }

    fn set_async_notifier(&mut self, notifier: Option<AsyncNotifier>) {
        if notifier.is_some() {
            trace!("{} runs synchronously, ignoring async notifier", RUSTLS_ENGINE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::test_cert_key;

    #[test]
    fn cipher_filter_keeps_named_suites() {
        let config = Config::builder()
            .ciphers("TLS13_AES_128_GCM_SHA256")
            .build()
            .unwrap();
        let provider = RustlsProvider::new().crypto(&config).unwrap();
        assert_eq!(provider.cipher_suites.len(), 1);
        assert_eq!(suite_name(&provider.cipher_suites[0]), "TLS13_AES_128_GCM_SHA256");
    }

    #[test]
    fn unknown_ciphers_are_a_config_error() {
        let config = Config::builder().ciphers("NOT_A_SUITE").build().unwrap();
        assert!(matches!(
            RustlsProvider::new().crypto(&config),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn record_size_is_plaintext_per_record() {
        assert_eq!(max_fragment_size(&Config::default()), None);
        let config = Config::builder().record_size(4096).build().unwrap();
        assert_eq!(max_fragment_size(&config), Some(4096 + 5));
        let config = Config::builder().record_size(16384).build().unwrap();
        assert_eq!(max_fragment_size(&config), Some(16389));
    }

    #[test]
    fn datagram_listeners_are_unsupported() {
        let params = ListenParams::new(TransportProto::Datagram, test_cert_key().unwrap());
        let res = RustlsProvider::new().server_setup(&Config::default(), &params);
        assert!(matches!(res, Err(Error::Unsupported(_))));
    }
}
