//! Peer-certificate introspection for HTTPS measurements.
//!
//! The probe connects with verification disabled (an unauthorized
//! certificate is a finding, not a failure) and reports what it saw:
//! validity window, issuer/subject, key parameters, serial, fingerprint,
//! and whether the chain validates against the bundled web-PKI roots.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use common::{TlsDetail, TlsIssuer, TlsSubject};

/// Certificate verifier that records nothing and accepts everything; the
/// separate [`chain_is_authorized`] pass computes the `authorized` flag.
#[derive(Debug)]
pub struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client config with verification disabled and the given ALPN list.
pub fn permissive_client_config(alpn: Vec<Vec<u8>>) -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_no_client_auth();
    config.alpn_protocols = alpn;
    config
}

/// Re-validate the presented chain against the bundled web-PKI roots.
pub fn chain_is_authorized(certs: &[CertificateDer<'_>], server_name: &ServerName<'_>) -> bool {
    let Some((end_entity, intermediates)) = certs.split_first() else {
        return false;
    };
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let Ok(verifier) = rustls::client::WebPkiServerVerifier::builder(Arc::new(roots)).build() else {
        return false;
    };
    verifier
        .verify_server_cert(end_entity, intermediates, server_name, &[], UnixTime::now())
        .is_ok()
}

/// Build the result-record TLS detail from the leaf certificate.
pub fn extract_detail(
    leaf_der: &[u8],
    authorized: bool,
    protocol: String,
    cipher_name: String,
) -> Option<TlsDetail> {
    let (_, cert) = X509Certificate::from_der(leaf_der).ok()?;

    let created_at = iso8601(cert.validity().not_before.timestamp());
    let expires_at = iso8601(cert.validity().not_after.timestamp());

    let issuer = TlsIssuer {
        country: first_attr(cert.issuer().iter_country()),
        organization: first_attr(cert.issuer().iter_organization()),
        common_name: first_attr(cert.issuer().iter_common_name()),
    };
    let subject = TlsSubject {
        common_name: first_attr(cert.subject().iter_common_name()),
        alt: subject_alt(&cert),
    };

    let (key_type, key_bits) = match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => {
            // modulus carries a sign-padding zero byte
            let significant = rsa
                .modulus
                .iter()
                .skip_while(|byte| **byte == 0)
                .count() as u64;
            (Some("RSA".to_string()), Some(significant * 8))
        }
        Ok(PublicKey::EC(point)) => {
            // uncompressed point: 0x04 || X || Y
            let data = point.data();
            let bits = if !data.is_empty() {
                ((data.len() as u64 - 1) / 2) * 8
            } else {
                0
            };
            (Some("EC".to_string()), Some(bits))
        }
        _ => (None, None),
    };

    let serial_number = colon_pairs(&hex::encode_upper(cert.raw_serial()));
    let fingerprint256 = colon_pairs(&hex::encode_upper(Sha256::digest(leaf_der)));
    let public_key = Some(colon_pairs(&hex::encode(
        cert.public_key().subject_public_key.data.as_ref(),
    )));

    Some(TlsDetail {
        authorized,
        protocol,
        cipher_name,
        created_at,
        expires_at,
        issuer,
        subject,
        key_type,
        key_bits,
        serial_number,
        fingerprint256,
        public_key,
    })
}

/// Human protocol name for the negotiated version.
pub fn protocol_name(version: Option<rustls::ProtocolVersion>) -> String {
    match version {
        Some(rustls::ProtocolVersion::TLSv1_2) => "TLSv1.2".to_string(),
        Some(rustls::ProtocolVersion::TLSv1_3) => "TLSv1.3".to_string(),
        Some(other) => format!("{:?}", other),
        None => String::new(),
    }
}

/// OpenSSL-style cipher name for the negotiated suite.
pub fn cipher_name(suite: Option<rustls::SupportedCipherSuite>) -> String {
    match suite {
        Some(suite) => format!("{:?}", suite.suite()).replace("TLS13_", "TLS_"),
        None => String::new(),
    }
}

fn iso8601(unix_seconds: i64) -> String {
    DateTime::from_timestamp(unix_seconds, 0)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

fn first_attr<'a>(
    mut iter: impl Iterator<Item = &'a x509_parser::x509::AttributeTypeAndValue<'a>>,
) -> Option<String> {
    iter.next()
        .and_then(|attr| attr.as_str().ok())
        .map(|s| s.to_string())
}

fn subject_alt(cert: &X509Certificate<'_>) -> Option<String> {
    let san = cert.subject_alternative_name().ok()??;
    let mut names = Vec::new();
    for name in &san.value.general_names {
        match name {
            GeneralName::DNSName(dns) => names.push(format!("DNS:{}", dns)),
            GeneralName::IPAddress(bytes) => {
                let rendered = match bytes.len() {
                    4 => std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string(),
                    16 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(bytes);
                        std::net::Ipv6Addr::from(octets).to_string()
                    }
                    _ => continue,
                };
                names.push(format!("IP Address:{}", rendered));
            }
            _ => {}
        }
    }
    if names.is_empty() {
        None
    } else {
        Some(names.join(", "))
    }
}

/// "AABBCC" -> "AA:BB:CC"
fn colon_pairs(hex_str: &str) -> String {
    hex_str
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_string())
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colon_pairs_format() {
        assert_eq!(colon_pairs("AABBCC"), "AA:BB:CC");
        assert_eq!(colon_pairs(""), "");
        assert_eq!(colon_pairs("AB"), "AB");
    }

    #[test]
    fn iso8601_is_utc_with_seconds() {
        assert_eq!(iso8601(0), "1970-01-01T00:00:00Z");
        assert_eq!(iso8601(1_700_000_000), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn protocol_names_match_node_convention() {
        assert_eq!(
            protocol_name(Some(rustls::ProtocolVersion::TLSv1_3)),
            "TLSv1.3"
        );
        assert_eq!(
            protocol_name(Some(rustls::ProtocolVersion::TLSv1_2)),
            "TLSv1.2"
        );
        assert_eq!(protocol_name(None), "");
    }

    #[test]
    fn empty_chain_is_unauthorized() {
        let name = ServerName::try_from("example.com".to_string()).unwrap();
        assert!(!chain_is_authorized(&[], &name));
    }
}
