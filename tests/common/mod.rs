//! In-process mock server speaking the wire protocol: a real
//! SCRAM-SHA-256 handshake followed by scripted framed responses.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const USER: &str = "admin";
pub const PASSWORD: &str = "hunter2";

const SALT: &[u8] = b"0123456789abcdef";
const ITERATIONS: u32 = 256;
const VERSION_MAGIC: u32 = 0x34c2_bdc3;

/// Scripted reply logic for one connection: maps a received query
/// (token, wire array) to zero or more (token, response body) frames.
pub type Handler = Box<dyn FnMut(u64, Value) -> Vec<(u64, Value)> + Send>;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Password the server expects. A client proof derived from any
    /// other password is rejected with error code 12.
    pub password: String,
    pub min_protocol: i64,
    pub max_protocol: i64,
    /// Set once any client-final (proof) message arrives.
    pub proof_received: Arc<AtomicBool>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            password: PASSWORD.to_string(),
            min_protocol: 0,
            max_protocol: 0,
            proof_received: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Binds an ephemeral port and serves connections until the test ends.
/// Each accepted connection gets its own handler from the factory.
pub async fn spawn_server<F>(config: ServerConfig, factory: F) -> u16
where
    F: Fn() -> Handler + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let config = config.clone();
            let handler = factory();
            tokio::spawn(serve(stream, config, handler));
        }
    });
    port
}

async fn serve(mut stream: TcpStream, config: ServerConfig, mut handler: Handler) {
    if handshake(&mut stream, &config).await.is_err() {
        return;
    }
    loop {
        let mut header = [0u8; 12];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let low = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let high = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
        let len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let token = low | (high << 32);

        let mut payload = vec![0u8; len];
        if stream.read_exact(&mut payload).await.is_err() {
            return;
        }
        let query: Value = serde_json::from_slice(&payload).unwrap();
        for (reply_token, body) in handler(token, query) {
            if write_frame(&mut stream, reply_token, &body).await.is_err() {
                return;
            }
        }
    }
}

async fn write_frame(stream: &mut TcpStream, token: u64, body: &Value) -> std::io::Result<()> {
    let payload = serde_json::to_vec(body).unwrap();
    let mut frame = Vec::with_capacity(12 + payload.len());
    frame.extend_from_slice(&((token & 0xffff_ffff) as u32).to_le_bytes());
    frame.extend_from_slice(&((token >> 32) as u32).to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    stream.write_all(&frame).await
}

async fn write_message(stream: &mut TcpStream, body: &Value) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(body).unwrap();
    bytes.push(0);
    stream.write_all(&bytes).await
}

async fn read_message(stream: &mut TcpStream) -> std::io::Result<Value> {
    let mut bytes = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    Ok(serde_json::from_slice(&bytes).unwrap())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Server side of the V1_0 SCRAM exchange.
async fn handshake(stream: &mut TcpStream, config: &ServerConfig) -> std::io::Result<()> {
    let bad = || std::io::Error::new(std::io::ErrorKind::InvalidData, "handshake failed");

    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await?;
    assert_eq!(u32::from_le_bytes(magic), VERSION_MAGIC);

    let first = read_message(stream).await?;
    let gs2 = first["authentication"].as_str().unwrap().to_string();
    let client_first_bare = gs2.strip_prefix("n,,").unwrap().to_string();
    let client_nonce = client_first_bare.split_once(",r=").unwrap().1.to_string();

    write_message(
        stream,
        &json!({
            "success": true,
            "min_protocol_version": config.min_protocol,
            "max_protocol_version": config.max_protocol,
            "server_version": "2.4.0-mock",
        }),
    )
    .await?;

    let combined_nonce = format!("{}3rFcNGuL", client_nonce);
    let challenge = format!(
        "r={},s={},i={}",
        combined_nonce,
        BASE64.encode(SALT),
        ITERATIONS
    );
    write_message(stream, &json!({"success": true, "authentication": challenge})).await?;

    let final_message = read_message(stream).await?;
    config.proof_received.store(true, Ordering::SeqCst);
    let client_final = final_message["authentication"].as_str().unwrap().to_string();
    let (without_proof, proof_b64) = client_final.rsplit_once(",p=").ok_or_else(bad)?;

    let mut salted = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(config.password.as_bytes(), SALT, ITERATIONS, &mut salted);
    let client_key = hmac_sha256(&salted, b"Client Key");
    let stored_key = Sha256::digest(&client_key);
    let auth_message = format!("{},{},{}", client_first_bare, challenge, without_proof);
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let expected_proof: Vec<u8> = client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(k, s)| k ^ s)
        .collect();

    if BASE64.decode(proof_b64).ok() != Some(expected_proof) {
        write_message(
            stream,
            &json!({"success": false, "error": "Wrong password", "error_code": 12}),
        )
        .await?;
        return Err(bad());
    }

    let server_key = hmac_sha256(&salted, b"Server Key");
    let server_signature = BASE64.encode(hmac_sha256(&server_key, auth_message.as_bytes()));
    write_message(
        stream,
        &json!({"success": true, "authentication": format!("v={}", server_signature)}),
    )
    .await
}
