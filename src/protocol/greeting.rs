//! Server greeting and chap-sha1 authentication.
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Total greeting size: two fixed 64-byte lines.
pub const GREETING_SIZE: usize = 128;
pub const GREETING_LINE_SIZE: usize = 64;
/// Product marker every greeting must start with.
pub const PRODUCT_MARKER: &str = "Tarantool";
/// Characters of base64 salt on the second line.
pub const SALT_ENCODED_SIZE: usize = 44;
/// Bytes of decoded salt that enter the scramble.
pub const SCRAMBLE_SIZE: usize = 20;

pub const AUTH_MECHANISM: &str = "chap-sha1";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unknown product in greeting: {0:?}")]
    UnknownProduct(String),

    #[error("greeting is {0} bytes, expected {GREETING_SIZE}")]
    ShortGreeting(usize),

    #[error("invalid salt: {0}")]
    InvalidSalt(String),

    #[error("authentication failed: [{code}] {message}")]
    AuthFailed { code: u32, message: String },
}

/// Parsed server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// The first line, trimmed.
    pub banner: String,
    /// Version token following the product marker, if present.
    pub version: Option<String>,
    /// Decoded salt; at least [`SCRAMBLE_SIZE`] bytes.
    pub salt: Vec<u8>,
}

impl Greeting {
    pub fn parse(raw: &[u8]) -> Result<Self, HandshakeError> {
        if raw.len() < GREETING_SIZE {
            return Err(HandshakeError::ShortGreeting(raw.len()));
        }

        let (line, rest) = raw.split_at(GREETING_LINE_SIZE);
        let banner = String::from_utf8_lossy(line).trim_end().to_string();
        if !banner.starts_with(PRODUCT_MARKER) {
            return Err(HandshakeError::UnknownProduct(banner));
        }
        let version = banner.split_whitespace().nth(1).map(str::to_string);

        let encoded = std::str::from_utf8(&rest[..SALT_ENCODED_SIZE])
            .map_err(|e| HandshakeError::InvalidSalt(e.to_string()))?
            .trim();
        let salt = BASE64
            .decode(encoded)
            .map_err(|e| HandshakeError::InvalidSalt(e.to_string()))?;
        if salt.len() < SCRAMBLE_SIZE {
            return Err(HandshakeError::InvalidSalt(format!(
                "decoded salt is {} bytes",
                salt.len()
            )));
        }

        Ok(Self {
            banner,
            version,
            salt,
        })
    }

    pub fn scramble(&self, password: &str) -> [u8; SCRAMBLE_SIZE] {
        scramble(&self.salt, password)
    }
}

/// Derives the authentication proof sent instead of the password.
///
/// `sha1(password) XOR sha1(salt[..20] ‖ sha1(sha1(password)))`
pub fn scramble(salt: &[u8], password: &str) -> [u8; SCRAMBLE_SIZE] {
    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);

    let mut hasher = Sha1::new();
    hasher.update(&salt[..SCRAMBLE_SIZE.min(salt.len())]);
    hasher.update(step2);
    let step3 = hasher.finalize();

    let mut out = [0_u8; SCRAMBLE_SIZE];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = step1[i] ^ step3[i];
    }
    out
}

/// Builds a greeting the way a server would; used by the mock server.
#[cfg(test)]
pub(crate) fn render_greeting(version: &str, salt: &[u8]) -> Vec<u8> {
    let mut first = format!("{PRODUCT_MARKER} {version} (Binary) 00000000-0000-0000-0000-000000000000")
        .into_bytes();
    first.resize(GREETING_LINE_SIZE - 1, b' ');
    first.push(b'\n');

    let mut second = BASE64.encode(salt).into_bytes();
    second.resize(GREETING_LINE_SIZE - 1, b' ');
    second.push(b'\n');

    first.extend(second);
    first
}
