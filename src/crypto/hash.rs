//! SHA-256 hashing helpers and the leading-zero-byte difficulty metric.

use sha2::{Digest, Sha256};

/// SHA-256 of `input`, hex-encoded.
pub fn hash_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Decodes a hex-encoded hash back to bytes. Invalid hex yields an empty
/// buffer, whose leading-zero count of 0 fails every difficulty check.
pub fn from_hex(hash: &str) -> Vec<u8> {
    hex::decode(hash).unwrap_or_default()
}

/// Count of full leading 0x00 bytes. This is the mining difficulty metric:
/// byte-granular, so one unit is a factor of 256 in expected work.
pub fn leading_zero_bytes(hash: &[u8]) -> u8 {
    let mut count = 0u8;
    for byte in hash {
        if *byte != 0 {
            break;
        }
        count += 1;
    }
    count
}
