//! SCRAM-SHA-256 handshake utilities for the V1_0 protocol.
//!
//! The handshake exchanges NUL-terminated JSON messages. The client opens
//! with a 4-byte version preamble followed by its SCRAM client-first
//! message; the server answers with a version acknowledgement, then a
//! challenge (salt, iteration count, combined nonce), and finally its
//! signature, which must match the one derived from the salted password.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{DriverError, Result};
use crate::proto::{NULL_BYTE, VERSION_V1_0};

type HmacSha256 = Hmac<Sha256>;

const PROTOCOL_VERSION: i64 = 0;
const NONCE_BYTES: usize = 18;

/// One NUL-terminated handshake message from the server.
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeMessage {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<u64>,
    #[serde(default)]
    pub min_protocol_version: Option<i64>,
    #[serde(default)]
    pub max_protocol_version: Option<i64>,
    #[serde(default)]
    pub server_version: Option<String>,
    #[serde(default)]
    pub authentication: Option<String>,
}

impl HandshakeMessage {
    /// Parses a server message; a failed message becomes an AuthError
    /// carrying the server's error code.
    pub fn parse(raw: &str) -> Result<Self> {
        let msg: HandshakeMessage = serde_json::from_str(raw)
            .map_err(|_| DriverError::auth(raw.trim().to_string()))?;
        if msg.success {
            Ok(msg)
        } else {
            Err(DriverError::Auth {
                message: msg
                    .error
                    .unwrap_or_else(|| "handshake rejected by server".to_string()),
                error_code: msg.error_code,
            })
        }
    }
}

/// The client-first handshake write and the nonce it committed to.
#[derive(Debug, Clone)]
pub struct AuthBuffer {
    pub nonce: String,
    pub buffer: Vec<u8>,
}

/// Builds the version preamble plus the SCRAM client-first message.
pub fn build_auth_buffer(user: &str) -> AuthBuffer {
    let mut raw = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut raw);
    let nonce = BASE64.encode(raw);

    let message = serde_json::json!({
        "protocol_version": PROTOCOL_VERSION,
        "authentication_method": "SCRAM-SHA-256",
        "authentication": format!("n,,{}", client_first_bare(user, &nonce)),
    });

    let mut buffer = Vec::new();
    buffer.extend_from_slice(&VERSION_V1_0.to_le_bytes());
    buffer.extend_from_slice(message.to_string().as_bytes());
    buffer.push(NULL_BYTE);
    AuthBuffer { nonce, buffer }
}

/// Fails unless the server supports protocol version 0.
pub fn validate_version(msg: &HandshakeMessage) -> Result<()> {
    let min = msg.min_protocol_version.unwrap_or(PROTOCOL_VERSION);
    let max = msg.max_protocol_version.unwrap_or(PROTOCOL_VERSION);
    if PROTOCOL_VERSION < min || PROTOCOL_VERSION > max {
        return Err(DriverError::auth(format!(
            "unsupported protocol version {}, server supports {}..={}",
            PROTOCOL_VERSION, min, max
        )));
    }
    Ok(())
}

/// The derived proof write and the signature the server must echo.
#[derive(Debug, Clone)]
pub struct SaltedPassword {
    pub server_signature: String,
    pub proof: Vec<u8>,
}

/// Answers the server challenge: PBKDF2 salted password, client proof,
/// and the expected server signature.
pub fn compute_salted_password(
    challenge: &str,
    nonce: &str,
    user: &str,
    password: &str,
) -> Result<SaltedPassword> {
    let mut combined_nonce = None;
    let mut salt = None;
    let mut iterations = None;
    for field in challenge.split(',') {
        match field.split_once('=') {
            Some(("r", value)) => combined_nonce = Some(value.to_string()),
            Some(("s", value)) => {
                salt = Some(BASE64.decode(value).map_err(|e| {
                    DriverError::auth(format!("invalid challenge salt: {}", e))
                })?)
            }
            Some(("i", value)) => {
                iterations = Some(value.parse::<u32>().map_err(|e| {
                    DriverError::auth(format!("invalid iteration count: {}", e))
                })?)
            }
            _ => {}
        }
    }
    let combined_nonce =
        combined_nonce.ok_or_else(|| DriverError::auth("challenge is missing a nonce"))?;
    let salt = salt.ok_or_else(|| DriverError::auth("challenge is missing a salt"))?;
    let iterations =
        iterations.ok_or_else(|| DriverError::auth("challenge is missing an iteration count"))?;

    // The server must echo the client nonce as a prefix of its own.
    if !combined_nonce.starts_with(nonce) {
        return Err(DriverError::auth("invalid nonce from server"));
    }

    let mut salted = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut salted);

    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key = Sha256::digest(&client_key);

    let client_final_without_proof = format!("c=biws,r={}", combined_nonce);
    let auth_message = format!(
        "{},{},{}",
        client_first_bare(user, nonce),
        challenge,
        client_final_without_proof
    );

    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let client_proof: Vec<u8> = client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(k, s)| k ^ s)
        .collect();

    let server_key = hmac_sha256(&salted, b"Server Key");
    let server_signature = BASE64.encode(hmac_sha256(&server_key, auth_message.as_bytes()));

    let message = serde_json::json!({
        "authentication": format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(&client_proof)
        ),
    });
    let mut proof = message.to_string().into_bytes();
    proof.push(NULL_BYTE);

    Ok(SaltedPassword {
        server_signature,
        proof,
    })
}

/// Constant-time comparison of the server's final `v=` signature against
/// the expected one.
pub fn compare_digest(authentication: &str, server_signature: &str) -> Result<()> {
    let returned = authentication
        .strip_prefix("v=")
        .unwrap_or(authentication)
        .as_bytes();
    if returned.ct_eq(server_signature.as_bytes()).into() {
        Ok(())
    } else {
        Err(DriverError::auth("invalid server signature"))
    }
}

fn client_first_bare(user: &str, nonce: &str) -> String {
    format!("n={},r={}", user, nonce)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so new_from_slice cannot fail.
    let mut mac = HmacSha256::new_from_slice(key).unwrap_or_else(|_| unreachable!());
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 SCRAM-SHA-256 test vector.
    const USER: &str = "user";
    const PASSWORD: &str = "pencil";
    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const CHALLENGE: &str = "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,\
                             s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    #[test]
    fn auth_buffer_carries_preamble_and_client_first() {
        let auth = build_auth_buffer("admin");
        assert_eq!(&auth.buffer[..4], &VERSION_V1_0.to_le_bytes());
        assert_eq!(*auth.buffer.last().unwrap(), NULL_BYTE);

        let json: serde_json::Value =
            serde_json::from_slice(&auth.buffer[4..auth.buffer.len() - 1]).unwrap();
        assert_eq!(json["protocol_version"], 0);
        assert_eq!(json["authentication_method"], "SCRAM-SHA-256");
        let auth_field = json["authentication"].as_str().unwrap();
        assert_eq!(
            auth_field,
            format!("n,,n=admin,r={}", auth.nonce)
        );
    }

    #[test]
    fn scram_vector_produces_known_proof_and_signature() {
        let salted = compute_salted_password(CHALLENGE, CLIENT_NONCE, USER, PASSWORD).unwrap();
        assert_eq!(
            salted.server_signature,
            "6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4="
        );

        let proof_json: serde_json::Value =
            serde_json::from_slice(&salted.proof[..salted.proof.len() - 1]).unwrap();
        let authentication = proof_json["authentication"].as_str().unwrap();
        assert!(authentication.ends_with(",p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="));
        assert!(authentication.starts_with("c=biws,r=rOprNGfwEbeRWgbNEkqO%"));
    }

    #[test]
    fn nonce_mismatch_is_rejected() {
        let err = compute_salted_password(CHALLENGE, "differentnonce", USER, PASSWORD).unwrap_err();
        assert!(matches!(err, DriverError::Auth { .. }));
    }

    #[test]
    fn version_window_is_enforced() {
        let ok = HandshakeMessage::parse(
            r#"{"success":true,"min_protocol_version":0,"max_protocol_version":0}"#,
        )
        .unwrap();
        assert!(validate_version(&ok).is_ok());

        let future = HandshakeMessage::parse(
            r#"{"success":true,"min_protocol_version":1,"max_protocol_version":2}"#,
        )
        .unwrap();
        assert!(validate_version(&future).is_err());
    }

    #[test]
    fn failed_message_carries_error_code() {
        let err = HandshakeMessage::parse(
            r#"{"success":false,"error":"Wrong password","error_code":12}"#,
        )
        .unwrap_err();
        match err {
            DriverError::Auth {
                message,
                error_code,
            } => {
                assert_eq!(message, "Wrong password");
                assert_eq!(error_code, Some(12));
            }
            other => panic!("expected auth error, got {:?}", other),
        }
    }

    #[test]
    fn garbage_message_is_an_auth_error() {
        assert!(matches!(
            HandshakeMessage::parse("ERROR: not json"),
            Err(DriverError::Auth { .. })
        ));
    }

    #[test]
    fn digest_comparison_strips_v_prefix() {
        assert!(compare_digest("v=abc123=", "abc123=").is_ok());
        assert!(compare_digest("v=abc124=", "abc123=").is_err());
    }
}
