// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Trust-on-first-use certificate pinning for self-signed Electrum peers.
//!
//! First contact probes with a CA-enforcing context; if that handshake
//! fails with a certificate-verification error, the peer is assumed to be
//! self-signed and its certificate is fetched and pinned to
//! `<data_dir>/certs/<host>`. Every later connection to that host trusts
//! only the byte-identical certificate.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use tokio::io::{AsyncWriteExt, BufWriter};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::CertificateError;

/// Resolved TLS posture for one connection attempt.
pub enum CertPolicy {
    /// Protocol is plaintext; no TLS context at all.
    NoTls,
    /// Cert file is present and empty: trust the system CA roots.
    CaSigned(Arc<ClientConfig>),
    /// Cert file pins a self-signed certificate: trust only this byte string.
    Pinned(Arc<ClientConfig>),
}

/// A `ServerCertVerifier` that accepts exactly one DER-encoded certificate
/// and rejects everything else, including a re-issued cert for the same
/// host. Generalizes the "trust nothing" `NoVerifier` pattern used for test
/// transports: instead of always asserting trust, it asserts trust only
/// when the presented leaf certificate matches the pinned bytes exactly.
#[derive(Debug)]
struct PinnedCertVerifier {
    pinned: CertificateDer<'static>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "presented certificate does not match pinned certificate".to_string(),
            ))
        }
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
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// A verifier that trusts anything, used only for the throwaway probe
/// connection that tells us whether a host is CA-signed. We never use this
/// for the session itself: `is_ca_signed` only needs to know whether a
/// *CA-enforcing* context can complete the handshake, not this one.
#[derive(Debug)]
struct AcceptAnyVerifier;

impl ServerCertVerifier for AcceptAnyVerifier {
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
        PinnedCertVerifier {
            pinned: CertificateDer::from(Vec::new()),
        }
        .supported_verify_schemes()
    }
}

fn ca_root_config() -> Arc<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

fn accept_any_config() -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyVerifier))
            .with_no_client_auth(),
    )
}

fn pinned_config(der: CertificateDer<'static>) -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier { pinned: der }))
            .with_no_client_auth(),
    )
}

/// Workaround for peers (observed historically on Android builds) that emit
/// a PEM blob whose `-----END CERTIFICATE-----` footer is not preceded by a
/// newline. Inserts one whenever missing.
fn fix_pem_footer_newline(pem: &str) -> String {
    const FOOTER: &str = "-----END CERTIFICATE-----";
    match pem.find(FOOTER) {
        Some(idx) if idx > 0 && pem.as_bytes()[idx - 1] != b'\n' => {
            format!("{}\n{}", &pem[..idx], &pem[idx..])
        }
        _ => pem.to_string(),
    }
}

fn der_to_pem(der: &[u8]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut body = String::new();
    for chunk in encoded.as_bytes().chunks(64) {
        body.push_str(std::str::from_utf8(chunk).unwrap());
        body.push('\n');
    }
    let pem = format!("-----BEGIN CERTIFICATE-----\n{body}-----END CERTIFICATE-----\n");
    fix_pem_footer_newline(&pem)
}

/// Reads the pin file at `path` and classifies it.
enum PinState {
    Missing,
    EmptyCaSigned,
    Pinned(Vec<u8>),
}

fn read_pin_state(path: &Path) -> io::Result<PinState> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(PinState::EmptyCaSigned),
        Ok(bytes) => Ok(PinState::Pinned(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PinState::Missing),
        Err(e) => Err(e),
    }
}

/// Parses a stored pin file's PEM bytes and checks the certificate's
/// validity window against `now`. Returns `Ok(der)` if still valid.
fn validate_pinned_pem(pem_bytes: &[u8], now: SystemTime) -> Result<Vec<u8>, CertificateError> {
    let der = CertificateDer::from_pem_slice(pem_bytes)
        .map_err(|e| CertificateError::ErrorParsingSslCert(e.to_string()))?;
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| CertificateError::ErrorParsingSslCert(e.to_string()))?;
    let now_secs = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let validity = cert.validity();
    if now_secs < validity.not_before.timestamp() || now_secs > validity.not_after.timestamp() {
        return Err(CertificateError::ErrorParsingSslCert(
            "certificate has expired".to_string(),
        ));
    }
    Ok(der.as_ref().to_vec())
}

/// Opens a throwaway CA-enforcing connection; returns `Ok(true)` if the
/// handshake completes (host is CA-signed), `Ok(false)` if it fails with a
/// certificate-verification error (host is self-signed), or propagates any
/// other I/O error.
pub async fn probe_is_ca_signed(host: &str, port: u16) -> Result<bool, CertificateError> {
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;

    let connector = TlsConnector::from(ca_root_config());
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| CertificateError::ErrorGettingSslCert(e.to_string()))?;
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| CertificateError::ErrorGettingSslCert(e.to_string()))?;
    match connector.connect(server_name, stream).await {
        Ok(_) => Ok(true),
        Err(e) => {
            let msg = e.to_string();
            if msg.contains("CertificateUnknown")
                || msg.contains("UnknownIssuer")
                || msg.contains("InvalidCertificate")
                || msg.contains("certificate")
            {
                Ok(false)
            } else {
                Err(CertificateError::ErrorGettingSslCert(msg))
            }
        }
    }
}

/// Fetches the peer's DER certificate using a trust-anything context,
/// retrying up to 10 times at 1 second intervals (the handshake may not
/// have completed by the first attempt on a slow peer).
pub async fn fetch_peer_certificate(
    host: &str,
    port: u16,
) -> Result<Vec<u8>, CertificateError> {
    use tokio::net::TcpStream;
    use tokio_rustls::TlsConnector;

    let connector = TlsConnector::from(accept_any_config());
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| CertificateError::ErrorGettingSslCert(e.to_string()))?;

    for attempt in 0..10 {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| CertificateError::ErrorGettingSslCert(e.to_string()))?;
        match connector.connect(server_name.clone(), stream).await {
            Ok(tls) => {
                let (_, conn) = tls.get_ref();
                if let Some(chain) = conn.peer_certificates() {
                    if let Some(leaf) = chain.first() {
                        return Ok(leaf.as_ref().to_vec());
                    }
                }
            }
            Err(e) => {
                if attempt == 9 {
                    return Err(CertificateError::ErrorGettingSslCert(e.to_string()));
                }
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Err(CertificateError::ErrorGettingSslCert(
        "could not get certificate".to_string(),
    ))
}

/// Writes `der` PEM-encoded to `path`, flushing and fsyncing before
/// returning so a concurrent reader never observes a partial write.
async fn save_certificate(path: &Path, der: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let pem = der_to_pem(der);
    let file = tokio::fs::File::create(path).await?;
    let mut writer = BufWriter::new(file);
    writer.write_all(pem.as_bytes()).await?;
    writer.flush().await?;
    writer.get_ref().sync_all().await?;
    Ok(())
}

async fn mark_ca_signed(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, b"").await
}

/// Resolves the TLS posture for `host:port`, performing first-contact
/// pinning if necessary. Mirrors `_get_ssl_context` in the reference
/// client: missing file triggers the CA-vs-self-signed probe; present
/// empty file means CA-signed; present non-empty file is parsed, checked
/// for expiry (deleting and re-probing is left to the *next* call, per the
/// single-attempt-per-call contract), and turned into a pinned verifier.
pub async fn acquire_tls_context(
    host: &str,
    port: u16,
    protocol: crate::address::Protocol,
    cert_path: &Path,
) -> Result<CertPolicy, CertificateError> {
    if protocol == crate::address::Protocol::Plain {
        return Ok(CertPolicy::NoTls);
    }

    let state = read_pin_state(cert_path)
        .map_err(|e| CertificateError::ErrorGettingSslCert(e.to_string()))?;

    match state {
        PinState::Missing => {
            let ca_signed = probe_is_ca_signed(host, port).await?;
            if ca_signed {
                mark_ca_signed(cert_path)
                    .await
                    .map_err(|e| CertificateError::ErrorGettingSslCert(e.to_string()))?;
                Ok(CertPolicy::CaSigned(ca_root_config()))
            } else {
                let der = fetch_peer_certificate(host, port).await?;
                save_certificate(cert_path, &der)
                    .await
                    .map_err(|e| CertificateError::ErrorGettingSslCert(e.to_string()))?;
                Ok(CertPolicy::Pinned(pinned_config(CertificateDer::from(der))))
            }
        }
        PinState::EmptyCaSigned => Ok(CertPolicy::CaSigned(ca_root_config())),
        PinState::Pinned(pem_bytes) => {
            match validate_pinned_pem(&pem_bytes, SystemTime::now()) {
                Ok(der) => Ok(CertPolicy::Pinned(pinned_config(CertificateDer::from(der)))),
                Err(CertificateError::ErrorParsingSslCert(msg)) if msg.contains("expired") => {
                    let _ = std::fs::remove_file(cert_path);
                    Err(CertificateError::ErrorParsingSslCert(msg))
                }
                Err(e) => Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixes_missing_newline_before_footer() {
        let broken = "-----BEGIN CERTIFICATE-----\nAAAA-----END CERTIFICATE-----\n";
        let fixed = fix_pem_footer_newline(broken);
        assert!(fixed.contains("AAAA\n-----END CERTIFICATE-----"));
    }

    #[test]
    fn leaves_correct_newline_alone() {
        let ok = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert_eq!(fix_pem_footer_newline(ok), ok);
    }

    #[test]
    fn der_round_trips_through_pem_parser() {
        // A minimal self-signed cert DER isn't practical to hand-construct
        // here; instead verify PEM framing invariants directly.
        let der = vec![1u8, 2, 3, 4, 5];
        let pem = der_to_pem(&der);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.trim_end().ends_with("-----END CERTIFICATE-----"));
    }

    #[test]
    fn read_pin_state_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nonexistent");
        assert!(matches!(read_pin_state(&path).unwrap(), PinState::Missing));
    }

    #[test]
    fn read_pin_state_empty_file_is_ca_signed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certs/host");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"").unwrap();
        assert!(matches!(
            read_pin_state(&path).unwrap(),
            PinState::EmptyCaSigned
        ));
    }
}
