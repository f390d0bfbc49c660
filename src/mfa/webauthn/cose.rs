// ABOUTME: COSE public key parsing and WebAuthn signature verification
// ABOUTME: Supports ES256 (EC2/P-256) and RS256 (RSA) credential keys from CBOR
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

use crate::errors::{AppError, AppResult};
use p256::ecdsa::signature::Verifier as _;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use serde_cbor::Value;
use sha2::{Digest, Sha256};

// COSE key common parameters (RFC 9052 / RFC 9053)
const KTY: i128 = 1;
const ALG: i128 = 3;
const EC2_CRV: i128 = -1;
const EC2_X: i128 = -2;
const EC2_Y: i128 = -3;
const RSA_N: i128 = -1;
const RSA_E: i128 = -2;

const KTY_EC2: i128 = 2;
const KTY_RSA: i128 = 3;
const ALG_ES256: i128 = -7;
const ALG_RS256: i128 = -257;
const CRV_P256: i128 = 1;

/// A parsed WebAuthn credential public key
pub enum CosePublicKey {
    /// ECDSA P-256 with SHA-256
    Es256(p256::ecdsa::VerifyingKey),
    /// RSASSA-PKCS1-v1_5 with SHA-256
    Rs256(RsaPublicKey),
}

fn map_get(map: &[(Value, Value)], key: i128) -> Option<&Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if *i == key => Some(v),
        _ => None,
    })
}

fn as_bytes(value: Option<&Value>) -> AppResult<&[u8]> {
    match value {
        Some(Value::Bytes(bytes)) => Ok(bytes),
        _ => Err(AppError::crypto("COSE key field is not a byte string")),
    }
}

fn as_int(value: Option<&Value>) -> AppResult<i128> {
    match value {
        Some(Value::Integer(i)) => Ok(*i),
        _ => Err(AppError::crypto("COSE key field is not an integer")),
    }
}

impl CosePublicKey {
    /// Parse a CBOR-encoded COSE key
    ///
    /// # Errors
    /// Returns an error for malformed CBOR, unsupported key types, or
    /// unsupported algorithms.
    pub fn parse(cose_bytes: &[u8]) -> AppResult<Self> {
        let value: Value = serde_cbor::from_slice(cose_bytes)
            .map_err(|_| AppError::crypto("COSE key is not valid CBOR"))?;
        let Value::Map(map) = value else {
            return Err(AppError::crypto("COSE key is not a CBOR map"));
        };
        let map: Vec<(Value, Value)> = map.into_iter().collect();

        let kty = as_int(map_get(&map, KTY))?;
        let alg = as_int(map_get(&map, ALG))?;

        match (kty, alg) {
            (KTY_EC2, ALG_ES256) => {
                if as_int(map_get(&map, EC2_CRV))? != CRV_P256 {
                    return Err(AppError::crypto("unsupported EC curve"));
                }
                let x = as_bytes(map_get(&map, EC2_X))?;
                let y = as_bytes(map_get(&map, EC2_Y))?;
                if x.len() != 32 || y.len() != 32 {
                    return Err(AppError::crypto("malformed P-256 coordinates"));
                }

                // Uncompressed SEC1 point: 0x04 || x || y
                let mut sec1 = Vec::with_capacity(65);
                sec1.push(0x04);
                sec1.extend_from_slice(x);
                sec1.extend_from_slice(y);

                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
                    .map_err(|_| AppError::crypto("invalid P-256 public key"))?;
                Ok(Self::Es256(key))
            }
            (KTY_RSA, ALG_RS256) => {
                let n = as_bytes(map_get(&map, RSA_N))?;
                let e = as_bytes(map_get(&map, RSA_E))?;
                let key = RsaPublicKey::new(
                    BigUint::from_bytes_be(n),
                    BigUint::from_bytes_be(e),
                )
                .map_err(|_| AppError::crypto("invalid RSA public key"))?;
                Ok(Self::Rs256(key))
            }
            _ => Err(AppError::crypto(format!(
                "unsupported COSE key (kty {kty}, alg {alg})"
            ))),
        }
    }

    /// Verify a WebAuthn signature over `message`
    ///
    /// ES256 signatures arrive DER-encoded per the WebAuthn spec; RS256 is
    /// PKCS#1 v1.5 over the SHA-256 of the message.
    ///
    /// # Errors
    /// Returns an error for malformed signatures; a mismatch is `Ok(false)`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> AppResult<bool> {
        match self {
            Self::Es256(key) => {
                let signature = p256::ecdsa::Signature::from_der(signature)
                    .map_err(|_| AppError::crypto("malformed ECDSA signature"))?;
                Ok(key.verify(message, &signature).is_ok())
            }
            Self::Rs256(key) => {
                let digest = Sha256::digest(message);
                Ok(key
                    .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
                    .is_ok())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Signer as _;
    use serde_cbor::Value;
    use std::collections::BTreeMap;

    fn es256_cose_key(key: &p256::ecdsa::VerifyingKey) -> Vec<u8> {
        use p256::elliptic_curve::sec1::ToEncodedPoint;
        let point = key.as_affine().to_encoded_point(false);
        let mut map = BTreeMap::new();
        map.insert(Value::Integer(1), Value::Integer(2));
        map.insert(Value::Integer(3), Value::Integer(-7));
        map.insert(Value::Integer(-1), Value::Integer(1));
        map.insert(
            Value::Integer(-2),
            Value::Bytes(point.x().unwrap().to_vec()),
        );
        map.insert(
            Value::Integer(-3),
            Value::Bytes(point.y().unwrap().to_vec()),
        );
        serde_cbor::to_vec(&Value::Map(map)).unwrap()
    }

    #[test]
    fn es256_round_trip() {
        let signing = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let verifying = signing.verifying_key();
        let cose = es256_cose_key(verifying);

        let parsed = CosePublicKey::parse(&cose).unwrap();
        let message = b"authenticator data || client data hash";
        let signature: p256::ecdsa::Signature = signing.sign(message);
        let der = signature.to_der();

        assert!(parsed.verify(message, der.as_bytes()).unwrap());
        assert!(!parsed.verify(b"tampered message", der.as_bytes()).unwrap());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(CosePublicKey::parse(b"not cbor at all").is_err());
    }
}
