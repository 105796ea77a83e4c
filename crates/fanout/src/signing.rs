use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 over the raw payload bytes. Used for outbound webhook
/// signatures and for verifying the inbound indexer push.
pub fn sign_payload_hex(secret: &[u8], payload: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|error| anyhow!("invalid HMAC secret: {}", error))?;
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", byte);
    }
    Ok(out)
}

/// Constant-time comparison: always walks the longer input so equal-length
/// prefixes leak nothing through timing.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    let len = a.len().max(b.len());
    for index in 0..len {
        let left = a.get(index).copied().unwrap_or(0);
        let right = b.get(index).copied().unwrap_or(0);
        diff |= (left ^ right) as usize;
    }
    diff == 0
}

pub fn verify_signature_hex(secret: &[u8], payload: &[u8], presented_hex: &str) -> bool {
    match sign_payload_hex(secret, payload) {
        Ok(expected) => ct_eq(
            expected.as_bytes(),
            presented_hex.trim().to_ascii_lowercase().as_bytes(),
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips_with_same_secret_and_payload() {
        let secret = b"shared-secret";
        let payload = br#"{"event":"k_change","data":{"new_k":52}}"#;
        let signature = sign_payload_hex(secret, payload).expect("sign");
        assert!(verify_signature_hex(secret, payload, &signature));
        assert!(verify_signature_hex(secret, payload, &signature.to_uppercase()));
    }

    #[test]
    fn any_tampered_byte_flips_verification() {
        let secret = b"shared-secret";
        let payload = b"payload-bytes";
        let signature = sign_payload_hex(secret, payload).expect("sign");

        let mut tampered_payload = payload.to_vec();
        tampered_payload[0] ^= 0x01;
        assert!(!verify_signature_hex(secret, &tampered_payload, &signature));

        let mut tampered_signature = signature.clone().into_bytes();
        tampered_signature[0] = if tampered_signature[0] == b'0' { b'1' } else { b'0' };
        let tampered_signature = String::from_utf8(tampered_signature).expect("utf8");
        assert!(!verify_signature_hex(secret, payload, &tampered_signature));

        assert!(!verify_signature_hex(b"other-secret", payload, &signature));
    }

    #[test]
    fn ct_eq_handles_length_mismatch() {
        assert!(ct_eq(b"abc", b"abc"));
        assert!(!ct_eq(b"abc", b"abcd"));
        assert!(!ct_eq(b"", b"a"));
        assert!(ct_eq(b"", b""));
    }
}
