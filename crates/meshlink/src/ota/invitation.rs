//! Invitation text and digests shared by both update protocols

use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;

/// Invitation command asking the device to flash the application image
pub const COMMAND_FLASH: u8 = 0;

/// Update invitation: `"<cmd> <port> <size> <hash>[ <auth>]"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    /// Command code
    pub command: u8,
    /// Local port the device connects back to; 0 when unused
    pub port: u16,
    /// Image length in bytes
    pub size: usize,
    /// Hex digest of the image
    pub hash: String,
    /// Answer to an `AUTH` challenge
    pub auth: Option<String>,
}

impl Invitation {
    /// Flash invitation for an image
    pub fn flash(port: u16, size: usize, hash: impl Into<String>) -> Self {
        Self {
            command: COMMAND_FLASH,
            port,
            size,
            hash: hash.into(),
            auth: None,
        }
    }

    /// Same invitation carrying an authentication answer
    pub fn with_auth(mut self, auth: impl Into<String>) -> Self {
        self.auth = Some(auth.into());
        self
    }

    /// ASCII bytes to put on the wire
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Invitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", self.command, self.port, self.size, self.hash)?;
        if let Some(auth) = &self.auth {
            write!(f, " {auth}")?;
        }
        Ok(())
    }
}

/// Lowercase hex MD5 of `data`
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Lowercase hex SHA-256 of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Answer to `AUTH <nonce>`: hex of the first 16 bytes of SHA-256(password ‖ nonce)
pub fn auth_hash(password: &str, nonce: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(nonce.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// Datagram sent by the device during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReply {
    /// Invitation accepted; the device will connect back
    Ok,
    /// Authentication challenge with its nonce
    Auth(String),
    /// Device is erasing its update partition
    Erase,
    /// Anything else
    Other(String),
}

impl DeviceReply {
    /// Classify a received datagram
    pub fn parse(datagram: &[u8]) -> Self {
        let text = String::from_utf8_lossy(datagram);
        let text = text.trim();
        match text {
            "OK" => DeviceReply::Ok,
            "ERASE" => DeviceReply::Erase,
            _ => {
                let mut parts = text.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("AUTH"), Some(nonce)) => DeviceReply::Auth(nonce.to_string()),
                    _ => DeviceReply::Other(text.to_string()),
                }
            }
        }
    }
}
