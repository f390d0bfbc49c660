// ABOUTME: Mutual-TLS client certificate validation with OCSP-then-CRL revocation checking
// ABOUTME: Revocation results cache for five minutes; network errors fail closed
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! mTLS certificate verification
//!
//! The TLS terminator (or reverse proxy) forwards the peer certificate;
//! this module validates the chain against the configured trust store and
//! applies revocation checking: OCSP when the certificate lists a
//! responder, otherwise CRL when distribution points are listed. Either
//! result is cached per serial for the configured TTL. Any network error
//! during checking fails closed.

use crate::errors::{AppError, AppResult, ErrorCode};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sha1::{Digest as _, Sha1};
use sha2::{Digest as _, Sha256};
use std::time::{Duration, Instant};
use x509_parser::prelude::*;

/// Fetches revocation data over the network; faked in tests
#[async_trait]
pub trait RevocationFetcher: Send + Sync {
    /// POST a DER OCSP request, returning the DER response
    async fn ocsp(&self, responder_url: &str, request_der: &[u8]) -> AppResult<Vec<u8>>;
    /// Download a CRL from a distribution point
    async fn fetch_crl(&self, url: &str) -> AppResult<Vec<u8>>;
}

/// HTTP fetcher used in production
pub struct HttpRevocationFetcher {
    http: reqwest::Client,
}

impl HttpRevocationFetcher {
    /// Create a fetcher with a bounded request timeout
    #[must_use]
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpRevocationFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RevocationFetcher for HttpRevocationFetcher {
    async fn ocsp(&self, responder_url: &str, request_der: &[u8]) -> AppResult<Vec<u8>> {
        let response = self
            .http
            .post(responder_url)
            .header("content-type", "application/ocsp-request")
            .body(request_der.to_vec())
            .send()
            .await
            .map_err(|e| AppError::new(ErrorCode::TemporarilyUnavailable, format!("OCSP request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::new(
                ErrorCode::TemporarilyUnavailable,
                format!("OCSP responder returned {}", response.status()),
            ));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| AppError::new(ErrorCode::TemporarilyUnavailable, format!("OCSP body read failed: {e}")))
    }

    async fn fetch_crl(&self, url: &str) -> AppResult<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::new(ErrorCode::TemporarilyUnavailable, format!("CRL download failed: {e}")))?;
        if !response.status().is_success() {
            return Err(AppError::new(
                ErrorCode::TemporarilyUnavailable,
                format!("CRL distribution point returned {}", response.status()),
            ));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| AppError::new(ErrorCode::TemporarilyUnavailable, format!("CRL body read failed: {e}")))
    }
}

#[derive(Clone, Copy)]
struct CachedVerdict {
    checked_at: Instant,
    revoked: bool,
}

/// Certificate chain and revocation verifier
pub struct MtlsVerifier {
    /// DER-encoded trust anchor certificates
    trust_anchors: Vec<Vec<u8>>,
    fetcher: Box<dyn RevocationFetcher>,
    cache: DashMap<String, CachedVerdict>,
    cache_ttl: Duration,
}

impl MtlsVerifier {
    /// Create a verifier over the given trust anchors (DER)
    #[must_use]
    pub fn new(
        trust_anchors: Vec<Vec<u8>>,
        fetcher: Box<dyn RevocationFetcher>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            trust_anchors,
            fetcher,
            cache: DashMap::new(),
            cache_ttl,
        }
    }

    /// SHA-256 fingerprint of a DER certificate, lowercase hex
    #[must_use]
    pub fn fingerprint(cert_der: &[u8]) -> String {
        hex::encode(Sha256::digest(cert_der))
    }

    /// Validate a CA-issued client certificate: validity window, chain to a
    /// trust anchor, then revocation
    ///
    /// # Errors
    /// `InvalidClient` for chain failures, revoked certificates, or (fail
    /// closed) revocation-check network errors.
    pub async fn verify_ca_issued(&self, cert_der: &[u8]) -> AppResult<()> {
        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|_| AppError::invalid_client())?;

        let now = Utc::now().timestamp();
        if !cert.validity().is_valid_at(
            ASN1Time::from_timestamp(now).map_err(|_| AppError::invalid_client())?,
        ) {
            tracing::warn!("client certificate outside validity window");
            return Err(AppError::invalid_client());
        }

        let issuer = self.find_issuer(&cert)?;
        self.check_revocation(&cert, &issuer).await
    }

    /// Validate a pinned self-signed certificate by exact fingerprint match
    ///
    /// # Errors
    /// `InvalidClient` on any mismatch.
    pub fn verify_self_signed(&self, cert_der: &[u8], pinned_fingerprint: &str) -> AppResult<()> {
        let (_, cert) = X509Certificate::from_der(cert_der)
            .map_err(|_| AppError::invalid_client())?;

        let now = Utc::now().timestamp();
        if !cert.validity().is_valid_at(
            ASN1Time::from_timestamp(now).map_err(|_| AppError::invalid_client())?,
        ) {
            return Err(AppError::invalid_client());
        }

        let actual = Self::fingerprint(cert_der);
        if !actual.eq_ignore_ascii_case(pinned_fingerprint) {
            tracing::warn!("self-signed client certificate fingerprint mismatch");
            return Err(AppError::invalid_client());
        }
        Ok(())
    }

    /// Find the trust anchor that signed `cert` and prove the signature
    fn find_issuer<'a>(&'a self, cert: &X509Certificate<'_>) -> AppResult<X509Certificate<'a>> {
        for anchor_der in &self.trust_anchors {
            if let Ok((_, anchor)) = X509Certificate::from_der(anchor_der) {
                if anchor.subject() == cert.issuer()
                    && cert.verify_signature(Some(anchor.public_key())).is_ok()
                {
                    return Ok(anchor);
                }
            }
        }
        tracing::warn!("client certificate does not chain to a configured trust anchor");
        Err(AppError::invalid_client())
    }

    async fn check_revocation(
        &self,
        cert: &X509Certificate<'_>,
        issuer: &X509Certificate<'_>,
    ) -> AppResult<()> {
        let serial_hex = cert.raw_serial_as_string();
        let cache_key = format!("{}:{serial_hex}", Self::fingerprint(issuer.public_key().raw));

        if let Some(cached) = self.cache.get(&cache_key) {
            if cached.checked_at.elapsed() < self.cache_ttl {
                return if cached.revoked {
                    Err(AppError::invalid_client())
                } else {
                    Ok(())
                };
            }
        }

        // OCSP first when the certificate names a responder, CRL otherwise.
        // Network errors propagate: fail closed, never fail open.
        let revoked = if let Some(responder) = ocsp_responder_url(cert) {
            self.ocsp_status(cert, issuer, &responder).await?
        } else if let Some(crl_url) = crl_distribution_url(cert) {
            self.crl_status(cert, &crl_url).await?
        } else {
            // No revocation source configured on the certificate
            false
        };

        self.cache.insert(
            cache_key,
            CachedVerdict {
                checked_at: Instant::now(),
                revoked,
            },
        );

        if revoked {
            tracing::warn!(serial = %serial_hex, "client certificate is revoked");
            Err(AppError::invalid_client())
        } else {
            Ok(())
        }
    }

    async fn ocsp_status(
        &self,
        cert: &X509Certificate<'_>,
        issuer: &X509Certificate<'_>,
        responder: &str,
    ) -> AppResult<bool> {
        let request = build_ocsp_request(cert, issuer);
        let response = self.fetcher.ocsp(responder, &request).await?;
        parse_ocsp_revoked(&response)
    }

    async fn crl_status(&self, cert: &X509Certificate<'_>, crl_url: &str) -> AppResult<bool> {
        let crl_der = self.fetcher.fetch_crl(crl_url).await?;
        let (_, crl) = CertificateRevocationList::from_der(&crl_der)
            .map_err(|_| AppError::new(ErrorCode::TemporarilyUnavailable, "malformed CRL"))?;

        let serial = cert.raw_serial();
        let revoked = crl
            .iter_revoked_certificates()
            .any(|revoked| revoked.raw_serial() == serial);
        Ok(revoked)
    }
}

/// Extract the OCSP responder URL from Authority Information Access
fn ocsp_responder_url(cert: &X509Certificate<'_>) -> Option<String> {
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityInfoAccess(aia) = ext.parsed_extension() {
            for desc in &aia.accessdescs {
                if desc.access_method == x509_parser::oid_registry::OID_PKIX_ACCESS_DESCRIPTOR_OCSP {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        return Some((*uri).to_owned());
                    }
                }
            }
        }
    }
    None
}

/// Extract the first HTTP CRL distribution point
fn crl_distribution_url(cert: &X509Certificate<'_>) -> Option<String> {
    for ext in cert.extensions() {
        if let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() {
            for point in points.iter() {
                if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            return Some((*uri).to_owned());
                        }
                    }
                }
            }
        }
    }
    None
}

// -- minimal DER helpers for the OCSP request ------------------------------

fn der_len(len: usize) -> Vec<u8> {
    if len < 0x80 {
        vec![len as u8]
    } else if len <= 0xff {
        vec![0x81, len as u8]
    } else {
        vec![0x82, (len >> 8) as u8, (len & 0xff) as u8]
    }
}

fn der_wrap(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend(der_len(content.len()));
    out.extend_from_slice(content);
    out
}

/// Build a single-certificate OCSPRequest (RFC 6960) with SHA-1 CertID
fn build_ocsp_request(cert: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> Vec<u8> {
    // hashAlgorithm: sha1, parameters NULL
    let sha1_oid = der_wrap(0x06, &[0x2b, 0x0e, 0x03, 0x02, 0x1a]);
    let mut algorithm = sha1_oid;
    algorithm.extend(der_wrap(0x05, &[]));
    let algorithm = der_wrap(0x30, &algorithm);

    let issuer_name_hash = Sha1::digest(issuer.subject().as_raw());
    let issuer_key_hash = Sha1::digest(&issuer.public_key().subject_public_key.data);

    let mut cert_id = algorithm;
    cert_id.extend(der_wrap(0x04, &issuer_name_hash));
    cert_id.extend(der_wrap(0x04, &issuer_key_hash));
    cert_id.extend(der_wrap(0x02, cert.raw_serial()));
    let cert_id = der_wrap(0x30, &cert_id);

    let request = der_wrap(0x30, &cert_id);
    let request_list = der_wrap(0x30, &request);
    let tbs_request = der_wrap(0x30, &request_list);
    der_wrap(0x30, &tbs_request)
}

/// Read the OCSPResponse status and scan the basic response for a revoked
/// certStatus
///
/// A non-successful response status is a checking failure (fail closed); a
/// successful response is searched for the `revoked [1]` CHOICE tag in its
/// SingleResponse entries.
fn parse_ocsp_revoked(response_der: &[u8]) -> AppResult<bool> {
    // OCSPResponse ::= SEQUENCE { responseStatus ENUMERATED, responseBytes [0] EXPLICIT ... }
    if response_der.len() < 6 || response_der[0] != 0x30 {
        return Err(AppError::new(
            ErrorCode::TemporarilyUnavailable,
            "malformed OCSP response",
        ));
    }

    // Locate the ENUMERATED (tag 0x0a) responseStatus right after the outer header
    let header_len = if response_der[1] < 0x80 {
        2
    } else {
        2 + usize::from(response_der[1] & 0x7f)
    };
    let body = &response_der[header_len..];
    if body.len() < 3 || body[0] != 0x0a || body[1] != 0x01 {
        return Err(AppError::new(
            ErrorCode::TemporarilyUnavailable,
            "malformed OCSP response status",
        ));
    }
    if body[2] != 0 {
        return Err(AppError::new(
            ErrorCode::TemporarilyUnavailable,
            format!("OCSP responder error status {}", body[2]),
        ));
    }

    // certStatus CHOICE inside the SingleResponse:
    //   good    [0] IMPLICIT NULL        -> bytes 0x80 0x00
    //   revoked [1] IMPLICIT RevokedInfo -> 0xa1 <len> 0x18 (GeneralizedTime)
    let good = body.windows(2).any(|w| w == [0x80, 0x00]);
    let revoked = body
        .windows(3)
        .any(|w| w[0] == 0xa1 && w[2] == 0x18);

    if good {
        Ok(false)
    } else if revoked {
        Ok(true)
    } else {
        Err(AppError::new(
            ErrorCode::TemporarilyUnavailable,
            "OCSP response carried no certificate status",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn der_length_encodings() {
        assert_eq!(der_len(5), vec![5]);
        assert_eq!(der_len(200), vec![0x81, 200]);
        assert_eq!(der_len(1000), vec![0x82, 0x03, 0xe8]);
    }

    #[test]
    fn garbage_certificate_is_rejected() {
        let verifier = MtlsVerifier::new(
            Vec::new(),
            Box::new(HttpRevocationFetcher::new()),
            Duration::from_secs(300),
        );
        assert!(verifier.verify_self_signed(b"not a cert", "00").is_err());
    }

    #[test]
    fn malformed_ocsp_response_fails_closed() {
        assert!(parse_ocsp_revoked(b"nonsense").is_err());
    }
}
