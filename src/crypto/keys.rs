//! RSA-2048 keypairs, PSS-SHA256 signatures over precomputed digests, and
//! the base64 string codec for public keys.
//!
//! Public keys travel on the wire as the URL-safe base64 encoding of a
//! canonical JSON object `{"N": "<decimal modulus>", "E": <exponent>}`, so
//! encode/decode round-trips byte-for-byte. The URL alphabet is used on both
//! directions.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pss, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::NodeError;

const KEY_BITS: usize = 2048;

/// Canonical serialized form of an RSA public key.
#[derive(Debug, Serialize, Deserialize)]
struct PublicKeyFields {
    #[serde(rename = "N")]
    modulus: String,
    #[serde(rename = "E")]
    exponent: u32,
}

/// Generates a fresh RSA-2048 private key.
pub fn generate_keypair() -> Result<RsaPrivateKey, NodeError> {
    let mut rng = rand::thread_rng();
    RsaPrivateKey::new(&mut rng, KEY_BITS)
        .map_err(|e| NodeError::Crypto(format!("could not generate keypair: {}", e)))
}

/// Signs a precomputed SHA-256 digest with RSA-PSS and a per-call random
/// salt. Returns the URL-safe base64 of the signature.
pub fn sign(hash: &[u8], key: &RsaPrivateKey) -> Result<String, NodeError> {
    let mut rng = rand::thread_rng();
    let signature = key
        .sign_with_rng(&mut rng, Pss::new::<Sha256>(), hash)
        .map_err(|e| NodeError::Crypto(format!("could not sign hash: {}", e)))?;
    Ok(URL_SAFE.encode(signature))
}

/// Verifies a base64 PSS signature against a precomputed SHA-256 digest.
pub fn verify(signature_b64: &str, hash: &[u8], key: &RsaPublicKey) -> bool {
    let Ok(signature) = URL_SAFE.decode(signature_b64) else {
        return false;
    };
    key.verify(Pss::new::<Sha256>(), hash, &signature).is_ok()
}

/// Encodes a public key into its canonical string form.
pub fn key_to_string(key: &RsaPublicKey) -> Result<String, NodeError> {
    let fields = PublicKeyFields {
        modulus: key.n().to_string(),
        exponent: key
            .e()
            .to_string()
            .parse()
            .map_err(|_| NodeError::Crypto("public exponent out of range".into()))?,
    };
    let json = serde_json::to_string(&fields)?;
    Ok(URL_SAFE.encode(json))
}

/// Decodes a canonical public key string.
pub fn string_to_key(encoded: &str) -> Result<RsaPublicKey, NodeError> {
    let json = URL_SAFE
        .decode(encoded)
        .map_err(|e| NodeError::Crypto(format!("could not decode public key: {}", e)))?;
    let fields: PublicKeyFields = serde_json::from_slice(&json)?;
    let modulus = BigUint::parse_bytes(fields.modulus.as_bytes(), 10)
        .ok_or_else(|| NodeError::Crypto("malformed public key modulus".into()))?;
    RsaPublicKey::new(modulus, BigUint::from(fields.exponent))
        .map_err(|e| NodeError::Crypto(format!("invalid public key: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::{from_hex, hash_hex};

    #[test]
    fn signature_round_trip() {
        let key = generate_keypair().unwrap();
        let digest = from_hex(&hash_hex("payment of 0.5 coins"));

        let signature = sign(&digest, &key).unwrap();
        assert!(verify(&signature, &digest, &key.to_public_key()));
    }

    #[test]
    fn rejects_tampered_digest() {
        let key = generate_keypair().unwrap();
        let digest = from_hex(&hash_hex("original"));
        let other = from_hex(&hash_hex("tampered"));

        let signature = sign(&digest, &key).unwrap();
        assert!(!verify(&signature, &other, &key.to_public_key()));
    }

    #[test]
    fn rejects_garbage_signature() {
        let key = generate_keypair().unwrap();
        let digest = from_hex(&hash_hex("anything"));

        assert!(!verify("!!!not base64!!!", &digest, &key.to_public_key()));
        assert!(!verify(&URL_SAFE.encode(b"short"), &digest, &key.to_public_key()));
    }

    #[test]
    fn key_string_round_trip() {
        let key = generate_keypair().unwrap().to_public_key();
        let encoded = key_to_string(&key).unwrap();
        let decoded = string_to_key(&encoded).unwrap();

        assert_eq!(key, decoded);
        assert_eq!(key_to_string(&decoded).unwrap(), encoded);
    }

    #[test]
    fn rejects_malformed_key_string() {
        assert!(string_to_key("@@@").is_err());
        assert!(string_to_key(&URL_SAFE.encode(b"{\"N\":\"abc\",\"E\":65537}")).is_err());
    }
}
