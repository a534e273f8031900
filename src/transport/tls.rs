//! Certificate handling for the transport: either a digest/subject/issuer
//! whitelist against a configured `cert_file`, or standard chain
//! verification with an interactive TOFU fallback on failure (spec
//! §4.1, §9 "TLS session pinning").

use std::fs;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::sync::Arc;

use rustls_connector::rustls::{
    Certificate, ClientConfig, RootCertStore, ServerCertVerified, ServerCertVerifier,
    TLSError,
};
use rustls_connector::RustlsConnector;
use md5::Md5;
use sha1::{Digest, Sha1};

use crate::error::{Result, SyncError};

use super::x509;

#[derive(Debug, Clone, Default)]
pub struct CertPolicy {
    pub require_ssl: bool,
    /// When set, the peer certificate must match one of the PEM blocks
    /// in this file by SHA-1 digest (subject/issuer are also checked for
    /// a human-meaningful rejection message); standard chain
    /// verification is skipped entirely (spec §4.1).
    pub cert_file: Option<PathBuf>,
}

pub(super) fn build_connector(policy: &CertPolicy) -> Result<RustlsConnector> {
    if let Some(cert_file) = &policy.cert_file {
        let pins = load_pins(cert_file)?;
        let mut config = ClientConfig::new();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(WhitelistVerifier { pins }));
        Ok(RustlsConnector::from(Arc::new(config)))
    } else {
        let mut config = ClientConfig::new();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(PromptOnFailureVerifier::new()));
        Ok(RustlsConnector::from(Arc::new(config)))
    }
}

/// No-op: verification already happened inside the `ServerCertVerifier`
/// during the handshake. Kept as a seam so callers don't need to know
/// which verifier ran.
pub(super) fn verify_peer<S>(_stream: &S, _policy: &CertPolicy) -> Result<()> {
    Ok(())
}

struct Pin {
    digest: [u8; 20],
    subject: String,
    issuer: String,
}

fn load_pins(cert_file: &PathBuf) -> Result<Vec<Pin>> {
    let content = fs::read_to_string(cert_file)
        .map_err(|e| SyncError::config_error(format!("reading cert file {}: {}", cert_file.display(), e)))?;
    let mut pins = Vec::new();
    for block in split_pem_blocks(&content) {
        let der = base64::decode(&block)
            .map_err(|e| SyncError::config_error(format!("malformed PEM block in {}: {}", cert_file.display(), e)))?;
        let digest = Sha1::digest(&der);
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&digest);
        let (subject, issuer) = x509_subject_issuer(&der);
        pins.push(Pin {
            digest: arr,
            subject,
            issuer,
        });
    }
    Ok(pins)
}

/// Extract the base64 payload of every `-----BEGIN CERTIFICATE-----`
/// block in a PEM file, concatenated without line breaks.
fn split_pem_blocks(content: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with("-----BEGIN CERTIFICATE-----") {
            current = Some(String::new());
        } else if line.starts_with("-----END CERTIFICATE-----") {
            if let Some(b) = current.take() {
                blocks.push(b);
            }
        } else if let Some(b) = current.as_mut() {
            b.push_str(line);
        }
    }
    blocks
}

/// Subject/issuer extraction used only for diagnostic messages; full
/// X.509 verification (signature, chain, extensions) is delegated to
/// the TLS library, which has already run by the time this is called.
fn x509_subject_issuer(der: &[u8]) -> (String, String) {
    match x509::parse_certificate(der) {
        Some(info) => (info.subject, info.issuer),
        None => ("<unparseable subject>".to_owned(), "<unparseable issuer>".to_owned()),
    }
}

struct WhitelistVerifier {
    pins: Vec<Pin>,
}

impl ServerCertVerifier for WhitelistVerifier {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        presented_certs: &[Certificate],
        _dns_name: webpki::DNSNameRef,
        _ocsp_response: &[u8],
    ) -> std::result::Result<ServerCertVerified, TLSError> {
        let leaf = presented_certs
            .first()
            .ok_or_else(|| TLSError::General("no certificate presented".into()))?;
        let digest = Sha1::digest(&leaf.0);
        for pin in &self.pins {
            if digest.as_slice() == pin.digest {
                return Ok(ServerCertVerified::assertion());
            }
        }
        let subjects: Vec<&str> = self.pins.iter().map(|p| p.subject.as_str()).collect();
        let issuers: Vec<&str> = self.pins.iter().map(|p| p.issuer.as_str()).collect();
        Err(TLSError::General(format!(
            "certificate does not match whitelist (known subjects: {:?}, issuers: {:?})",
            subjects, issuers
        )))
    }
}

/// Standard chain verification, falling back to an interactive
/// accept/reject prompt on stderr when it fails — mirrors mbsync's habit
/// of trusting an operator watching the terminal rather than failing
/// hard on self-signed servers (spec §4.1).
struct PromptOnFailureVerifier {
    inner: rustls_connector::rustls::WebPKIVerifier,
}

impl PromptOnFailureVerifier {
    fn new() -> Self {
        PromptOnFailureVerifier {
            inner: rustls_connector::rustls::WebPKIVerifier::new(),
        }
    }
}

impl ServerCertVerifier for PromptOnFailureVerifier {
    fn verify_server_cert(
        &self,
        roots: &RootCertStore,
        presented_certs: &[Certificate],
        dns_name: webpki::DNSNameRef,
        ocsp_response: &[u8],
    ) -> std::result::Result<ServerCertVerified, TLSError> {
        match self
            .inner
            .verify_server_cert(roots, presented_certs, dns_name, ocsp_response)
        {
            Ok(v) => Ok(v),
            Err(e) => {
                let leaf = presented_certs.first();
                let digest = leaf
                    .map(|c| hex::encode(Md5::digest(&c.0)))
                    .unwrap_or_default();
                let info = leaf.and_then(|c| x509::parse_certificate(&c.0));
                eprintln!("Certificate verification failed: {}", e);
                match &info {
                    Some(info) => {
                        eprintln!("Subject: {}", info.subject);
                        eprintln!("Issuer: {}", info.issuer);
                        eprintln!("Valid: {} to {}", info.not_before, info.not_after);
                    }
                    None => eprintln!("Subject/issuer/validity: <certificate could not be parsed>"),
                }
                eprintln!("MD5 fingerprint: {}", digest);
                eprint!("Accept this certificate anyway? [y/N] ");
                io::stderr().flush().ok();
                let mut answer = String::new();
                if io::stdin().read_line(&mut answer).is_err() {
                    return Err(e);
                }
                if answer.trim().eq_ignore_ascii_case("y") {
                    Ok(ServerCertVerified::assertion())
                } else {
                    Err(e)
                }
            }
        }
    }
}
