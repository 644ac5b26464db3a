//! Group authentication and the signed HMAC request envelope.
//!
//! In HMAC mode a request body is the envelope
//! `{"data": base64url(inner), "signature": base64url(hex(HMAC-SHA512(inner)))}`
//! where the inner document is `{"timestamp": "<unix seconds>", "message": ...}`.
//! Decoding verifies the signature in constant time, then checks the
//! timestamp against the configured verify window.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use bolt_contracts::SecurityGroup;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha512;
use subtle::ConstantTimeEq;

type HmacSha512 = Hmac<Sha512>;

/// How the password half of basic auth is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Hmac,
    Simple,
}

impl AuthMode {
    pub fn parse(mode: &str) -> Result<Self, AuthError> {
        match mode {
            "hmac" => Ok(AuthMode::Hmac),
            "simple" => Ok(AuthMode::Simple),
            _ => Err(AuthError {
                code: "ERR_INVALID_AUTH_MODE",
                message: format!("authMode must be hmac or simple, got {mode}"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Looks up the shared key for a group name.
pub fn key_for_group<'a>(
    group: &str,
    groups: &'a [SecurityGroup],
) -> Result<&'a str, AuthError> {
    groups
        .iter()
        .find(|g| g.name == group)
        .map(|g| g.hmackey.as_str())
        .ok_or_else(|| AuthError {
            code: "ERR_UNKNOWN_GROUP",
            message: format!("no security group named {group}"),
        })
}

/// True when the supplied group/key pair matches a configured group.
pub fn authenticate_group(group: &str, key: &str, groups: &[SecurityGroup]) -> bool {
    groups.iter().any(|g| g.name == group && g.hmackey == key)
}

/// Builds a signed envelope around `message` with the given timestamp
/// (decimal unix seconds).
pub fn encode_hmac(key: &str, message: &str, timestamp: &str) -> Result<String, AuthError> {
    let inner = serde_json::json!({
        "timestamp": timestamp,
        "message": message,
    });
    let inner_bytes = serde_json::to_vec(&inner).map_err(|err| AuthError {
        code: "ERR_ENVELOPE_ENCODE",
        message: err.to_string(),
    })?;

    let signature = sign(&inner_bytes, key.as_bytes());
    let envelope = serde_json::json!({
        "data": URL_SAFE.encode(&inner_bytes),
        "signature": URL_SAFE.encode(hex::encode(signature).as_bytes()),
    });
    serde_json::to_string(&envelope).map_err(|err| AuthError {
        code: "ERR_ENVELOPE_ENCODE",
        message: err.to_string(),
    })
}

/// Verifies and opens a signed envelope, returning the inner message.
pub fn decode_hmac(key: &str, body: &[u8], verify_timeout: i64) -> Result<String, AuthError> {
    decode_hmac_at(key, body, verify_timeout, unix_now())
}

/// As [`decode_hmac`], with the clock supplied by the caller.
pub fn decode_hmac_at(
    key: &str,
    body: &[u8],
    verify_timeout: i64,
    now_unix: i64,
) -> Result<String, AuthError> {
    #[derive(Deserialize)]
    struct Envelope {
        #[serde(default)]
        data: String,
        #[serde(default)]
        signature: String,
    }

    let envelope: Envelope = serde_json::from_slice(body).map_err(|_| AuthError {
        code: "ERR_ENVELOPE_MALFORMED",
        message: "request body is not a signed envelope".to_string(),
    })?;

    // Older clients sign with the standard alphabet; accept both for data.
    let inner_bytes = URL_SAFE
        .decode(&envelope.data)
        .or_else(|_| STANDARD.decode(&envelope.data))
        .map_err(|_| AuthError {
            code: "ERR_ENVELOPE_MALFORMED",
            message: "envelope data is not valid base64".to_string(),
        })?;

    let signature_hex = URL_SAFE.decode(&envelope.signature).map_err(|_| AuthError {
        code: "ERR_ENVELOPE_MALFORMED",
        message: "envelope signature is not valid base64".to_string(),
    })?;

    let expected_hex = hex::encode(sign(&inner_bytes, key.as_bytes()));
    if signature_hex.ct_eq(expected_hex.as_bytes()).unwrap_u8() != 1 {
        return Err(AuthError {
            code: "ERR_INVALID_SIGNATURE",
            message: "envelope signature does not verify".to_string(),
        });
    }

    let inner: HashMap<String, String> =
        serde_json::from_slice(&inner_bytes).map_err(|_| AuthError {
            code: "ERR_ENVELOPE_MALFORMED",
            message: "envelope data is not a JSON object of strings".to_string(),
        })?;

    let timestamp: i64 = inner
        .get("timestamp")
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| AuthError {
            code: "ERR_INVALID_TIMESTAMP",
            message: "envelope timestamp is missing or not an integer".to_string(),
        })?;

    let skew = now_unix - timestamp;
    if skew > verify_timeout || skew < -verify_timeout {
        return Err(AuthError {
            code: "ERR_INVALID_TIMESTAMP",
            message: format!(
                "envelope timestamp skew ({skew}) outside of verify window (+/- {verify_timeout})"
            ),
        });
    }

    Ok(inner.get("message").cloned().unwrap_or_default())
}

fn sign(message: &[u8], key: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha512::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(i64::MAX as u64) as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> Vec<SecurityGroup> {
        vec![
            SecurityGroup {
                name: "readonly".to_string(),
                hmackey: "N9d*22UuzdA443Nur2eL23:a2fvTqe".to_string(),
                requests_per_second: 0,
            },
            SecurityGroup {
                name: "partner".to_string(),
                hmackey: "partner-key".to_string(),
                requests_per_second: 5,
            },
        ]
    }

    #[test]
    fn key_lookup_finds_configured_group() {
        let groups = groups();
        assert_eq!(key_for_group("partner", &groups).unwrap(), "partner-key");
        assert_eq!(
            key_for_group("nobody", &groups).unwrap_err().code,
            "ERR_UNKNOWN_GROUP",
        );
    }

    #[test]
    fn authenticate_group_requires_both_halves() {
        let groups = groups();
        assert!(authenticate_group("partner", "partner-key", &groups));
        assert!(!authenticate_group("partner", "wrong", &groups));
        assert!(!authenticate_group("nobody", "partner-key", &groups));
    }

    #[test]
    fn auth_mode_parses_known_variants() {
        assert_eq!(AuthMode::parse("hmac").unwrap(), AuthMode::Hmac);
        assert_eq!(AuthMode::parse("simple").unwrap(), AuthMode::Simple);
        assert!(AuthMode::parse("basic").is_err());
    }
}
