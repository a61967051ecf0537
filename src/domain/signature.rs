//! URL signatures binding an option segment to an object path.
//!
//! A signature token has the form `<type>:<value>`. The only supported type
//! is `shm` (shared-secret HMAC): the value is the lowercase hex
//! HMAC-SHA256 of `<options>/<object path>` under the signing key.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const SHARED_SECRET_HMAC: &str = "shm";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("unsupported signature type `{0}`")]
    UnsupportedType(String),
    #[error("signature does not match request")]
    Mismatch,
}

/// Verify `token` against the option segment and object path.
pub fn verify(
    secret: &[u8],
    raw_options: &str,
    object_path: &str,
    token: &str,
) -> Result<(), SignatureError> {
    let (kind, value) = token.split_once(':').unwrap_or((token, ""));

    match kind {
        SHARED_SECRET_HMAC => {
            let expected = digest(secret, raw_options, object_path);
            if expected.as_bytes().ct_eq(value.as_bytes()).into() {
                Ok(())
            } else {
                Err(SignatureError::Mismatch)
            }
        }
        other => Err(SignatureError::UnsupportedType(other.to_string())),
    }
}

/// Produce a complete `shm:<hex>` token.
pub fn sign(secret: &[u8], raw_options: &str, object_path: &str) -> String {
    format!(
        "{SHARED_SECRET_HMAC}:{}",
        digest(secret, raw_options, object_path)
    )
}

fn digest(secret: &[u8], raw_options: &str, object_path: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("valid HMAC key of any length");
    mac.update(raw_options.as_bytes());
    mac.update(b"/");
    mac.update(object_path.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
