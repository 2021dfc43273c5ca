//! Shared-secret checks for the relay channel and the HTTP bridge.
//!
//! Both the backend `register` frame and the client `gateway_auth` frame carry
//! the gateway secret in-band. Bridge calls carry a compound bearer value
//! `Authorization: Bearer <gateway_secret>:<api_key>`; the gateway checks only
//! the secret half and hands the api key to the backend untouched.

use thiserror::Error;

/// Why a bridge `Authorization` header was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("missing Authorization header")]
    Missing,
    #[error("Authorization header is not a Bearer token")]
    NotBearer,
    #[error("expected Bearer <gateway_secret>:<api_key>")]
    Malformed,
}

/// The two halves of a bridge credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCredential {
    pub gateway_secret: String,
    pub api_key: String,
}

impl BridgeCredential {
    /// Parse `Bearer <secret>:<api_key>`. The split happens at the first `:`,
    /// so the api key may itself contain colons; the secret may not.
    pub fn from_header(header: Option<&str>) -> Result<Self, CredentialError> {
        let token = parse_bearer(header)?;
        let (secret, api_key) = token.split_once(':').ok_or(CredentialError::Malformed)?;
        if secret.is_empty() || api_key.is_empty() {
            return Err(CredentialError::Malformed);
        }
        Ok(Self {
            gateway_secret: secret.to_string(),
            api_key: api_key.to_string(),
        })
    }
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn parse_bearer(header: Option<&str>) -> Result<&str, CredentialError> {
    match header {
        None => Err(CredentialError::Missing),
        Some(h) => match h.strip_prefix("Bearer ") {
            Some(token) if !token.trim().is_empty() => Ok(token.trim()),
            Some(_) => Err(CredentialError::Malformed),
            None => Err(CredentialError::NotBearer),
        },
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

/// Check a presented secret against the configured one. An empty configured
/// secret never matches.
pub fn secret_matches(configured: &str, presented: &str) -> bool {
    !configured.is_empty() && constant_time_eq(configured.as_bytes(), presented.as_bytes())
}
