use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::WebPkiSupportedAlgorithms;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConnection, DigitallySignedStruct, SignatureScheme, StreamOwned};
use sha2::{Digest, Sha256};
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::SecurityError;
use crate::stream::{SharedTlsStream, StreamReader, StreamWriter, TlsReadHalf, TlsWriteHalf};

/// Facts about the negotiated TLS session, computed once at establishment
/// and immutable for the connection lifetime.
#[derive(Debug, Clone)]
pub struct TlsSessionFacts {
    /// SHA-256 of the leaf certificate's SubjectPublicKeyInfo, rendered as
    /// colon-separated upper-case hex. Key-based rather than cert-based so
    /// it survives certificate renewal with the same key.
    pub fingerprint: String,
    /// Leaf validity window start, seconds since the unix epoch.
    pub not_before: i64,
    /// Leaf validity window end, seconds since the unix epoch.
    pub not_after: i64,
    /// The full DER chain as presented, leaf first.
    pub chain: Vec<Vec<u8>>,
}

/// Trust-on-first-use certificate verifier.
///
/// Accepts any chain at the TLS layer; the trust decision belongs to the
/// caller, who compares [`TlsSessionFacts::fingerprint`] against its trust
/// store. Handshake signatures are still verified against the presented key.
#[derive(Debug)]
struct TofuVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Negotiate TLS over an already-connected socket.
///
/// Drives the blocking handshake to completion, inspects the peer chain,
/// and returns the two stream halves plus the session facts. Fails if the
/// server presents no certificate or the leaf is outside its validity
/// window.
pub fn negotiate(
    mut socket: TcpStream,
    host: &str,
) -> std::result::Result<(StreamReader, StreamWriter, TlsSessionFacts), SecurityError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let algorithms = provider.signature_verification_algorithms;

    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(SecurityError::Config)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TofuVerifier { algorithms }))
        .with_no_client_auth();

    let server_name =
        ServerName::try_from(host.to_string()).map_err(|source| SecurityError::InvalidServerName {
            host: host.to_string(),
            source,
        })?;

    let mut conn = ClientConnection::new(Arc::new(config), server_name)?;
    while conn.is_handshaking() {
        conn.complete_io(&mut socket)
            .map_err(SecurityError::HandshakeIo)?;
    }

    let chain: Vec<Vec<u8>> = conn
        .peer_certificates()
        .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
        .unwrap_or_default();

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let facts = session_facts(&chain, now)?;
    debug!(fingerprint = %facts.fingerprint, "tls session established");

    let shared: SharedTlsStream = Arc::new(Mutex::new(StreamOwned::new(conn, socket)));
    let reader: StreamReader = Box::new(TlsReadHalf(Arc::clone(&shared)));
    let writer: StreamWriter = Box::new(TlsWriteHalf(shared));
    Ok((reader, writer, facts))
}

/// Compute the session facts for a presented chain, leaf first.
pub fn session_facts(
    chain: &[Vec<u8>],
    now: i64,
) -> std::result::Result<TlsSessionFacts, SecurityError> {
    let leaf_der = chain.first().ok_or(SecurityError::NoPeerCertificate)?;
    let (_, leaf) = X509Certificate::from_der(leaf_der)
        .map_err(|e| SecurityError::CertificateParse(e.to_string()))?;

    let not_before = leaf.validity().not_before.timestamp();
    let not_after = leaf.validity().not_after.timestamp();
    check_validity(not_before, not_after, now)?;

    let fingerprint = fingerprint_of(leaf.public_key().raw);

    Ok(TlsSessionFacts {
        fingerprint,
        not_before,
        not_after,
        chain: chain.to_vec(),
    })
}

/// Check a validity window against the current time.
pub fn check_validity(
    not_before: i64,
    not_after: i64,
    now: i64,
) -> std::result::Result<(), SecurityError> {
    if now < not_before {
        return Err(SecurityError::CertificateNotYetValid { not_before });
    }
    if now > not_after {
        return Err(SecurityError::CertificateExpired { not_after });
    }
    Ok(())
}

fn fingerprint_of(spki_der: &[u8]) -> String {
    let digest = Sha256::digest(spki_der);
    let hex: Vec<String> = digest.iter().map(|b| format!("{b:02X}")).collect();
    hex.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use rustls::pki_types::PrivateKeyDer;

    fn test_cert(
        not_before: (i32, u8, u8),
        not_after: (i32, u8, u8),
    ) -> (rcgen::Certificate, rcgen::KeyPair) {
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(not_before.0, not_before.1, not_before.2);
        params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert, key)
    }

    fn current_cert() -> (rcgen::Certificate, rcgen::KeyPair) {
        test_cert((2024, 1, 1), (2099, 1, 1))
    }

    #[test]
    fn check_validity_window() {
        assert!(check_validity(100, 200, 150).is_ok());
        assert!(check_validity(100, 200, 100).is_ok());
        assert!(check_validity(100, 200, 200).is_ok());
        assert!(matches!(
            check_validity(100, 200, 99),
            Err(SecurityError::CertificateNotYetValid { not_before: 100 })
        ));
        assert!(matches!(
            check_validity(100, 200, 201),
            Err(SecurityError::CertificateExpired { not_after: 200 })
        ));
    }

    #[test]
    fn empty_chain_is_rejected() {
        assert!(matches!(
            session_facts(&[], 0),
            Err(SecurityError::NoPeerCertificate)
        ));
    }

    #[test]
    fn expired_certificate_is_rejected() {
        let (cert, _key) = test_cert((2020, 1, 1), (2021, 1, 1));
        let chain = vec![cert.der().as_ref().to_vec()];
        let now = rcgen::date_time_ymd(2025, 1, 1).unix_timestamp();
        assert!(matches!(
            session_facts(&chain, now),
            Err(SecurityError::CertificateExpired { .. })
        ));
    }

    #[test]
    fn not_yet_valid_certificate_is_rejected() {
        let (cert, _key) = test_cert((2090, 1, 1), (2099, 1, 1));
        let chain = vec![cert.der().as_ref().to_vec()];
        let now = rcgen::date_time_ymd(2025, 1, 1).unix_timestamp();
        assert!(matches!(
            session_facts(&chain, now),
            Err(SecurityError::CertificateNotYetValid { .. })
        ));
    }

    #[test]
    fn fingerprint_is_sha256_of_public_key() {
        let (cert, key) = current_cert();
        let chain = vec![cert.der().as_ref().to_vec()];
        let now = rcgen::date_time_ymd(2025, 1, 1).unix_timestamp();

        let facts = session_facts(&chain, now).unwrap();
        let expected = fingerprint_of(&key.public_key_der());
        assert_eq!(facts.fingerprint, expected);

        // 32 bytes, colon-separated upper-case hex.
        assert_eq!(facts.fingerprint.len(), 32 * 3 - 1);
        assert!(facts
            .fingerprint
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == ':'));
    }

    #[test]
    fn loopback_handshake_yields_session_facts() {
        let (cert, key) = current_cert();
        let cert_der = cert.der().clone().into_owned();
        let key_der = PrivateKeyDer::try_from(key.serialize_der()).unwrap();
        let expected_fingerprint = fingerprint_of(&key.public_key_der());

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .unwrap();

            let (mut sock, _) = listener.accept().unwrap();
            let mut conn = rustls::ServerConnection::new(Arc::new(server_config)).unwrap();
            while conn.is_handshaking() {
                conn.complete_io(&mut sock).unwrap();
            }

            let mut stream = StreamOwned::new(conn, sock);
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let socket = TcpStream::connect(addr).unwrap();
        let (mut reader, mut writer, facts) = negotiate(socket, "localhost").unwrap();
        assert_eq!(facts.fingerprint, expected_fingerprint);
        assert!(!facts.chain.is_empty());

        writer.write_all(b"ping").unwrap();
        writer.flush().unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        server.join().unwrap();
    }
}
