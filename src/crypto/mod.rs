//! Cryptographic primitives: hashing, the difficulty metric, and RSA-PSS
//! signatures with their string codecs.

pub mod hash;
pub mod keys;

pub use hash::{from_hex, hash_hex, leading_zero_bytes};
pub use keys::{generate_keypair, key_to_string, sign, string_to_key, verify};
