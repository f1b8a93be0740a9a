//! Encrypted grants bound to a holder key.
//!
//! A capability stores a payload that only the intended holder can open.
//! Its id is a deterministic function of the holder's key material and a
//! nonce, so issuer and holder compute the same id without communicating.
//! Revocation is server-side: delete the row, or time-stamp it revoked.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use serde::Serialize;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use super::{block_crypt, pad, unpad, ManagedKey, ManagedKeyPair, BLOCK_SIZE};
use crate::{Error, Result};

/// A stored grant: a public part anyone can read and a private part only
/// the holder can decrypt.
#[derive(Debug, Clone)]
pub struct Capability {
    pub id: String,
    pub nonce: Vec<u8>,
    pub public_payload: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
}

/// The deterministic id of a shared-secret grant.
///
/// The nonce is encrypted under the holder key; the id is the base64url of
/// the result. Both sides of the grant can compute it independently.
pub fn shared_secret_capability_id(holder_key: &ManagedKey, nonce: &[u8]) -> Result<String> {
    if holder_key.encrypted() {
        return Err(Error::KeyMustBeDecrypted);
    }
    if nonce.len() != BLOCK_SIZE {
        return Err(Error::InvalidKey);
    }
    let mut out = nonce.to_vec();
    block_crypt(nonce, &holder_key.plaintext, &mut out)?;
    Ok(URL_SAFE.encode(out))
}

/// Grant a capability to the holder of a shared secret.
///
/// The private payload is JSON-encoded, padded, and block-encrypted under
/// the holder key with the decoded capability id as IV.
pub fn grant_shared_secret<P: Serialize, Q: Serialize>(
    holder_key: &ManagedKey,
    nonce: &[u8],
    public_payload: &P,
    private_payload: &Q,
) -> Result<Capability> {
    let id = shared_secret_capability_id(holder_key, nonce)?;
    let iv = URL_SAFE
        .decode(&id)
        .map_err(|e| Error::Crypto(format!("capability id: {e}")))?;

    let mut private =
        serde_json::to_vec(private_payload).map_err(Error::MalformedPacket)?;
    pad(&mut private);
    block_crypt(&iv, &holder_key.plaintext, &mut private)?;

    let public = serde_json::to_vec(public_payload).map_err(Error::MalformedPacket)?;

    Ok(Capability {
        id,
        nonce: nonce.to_vec(),
        public_payload: public,
        encrypted_payload: private,
    })
}

/// Open the private payload of a shared-secret grant.
///
/// Returns the JSON bytes of the payload.
pub fn decrypt_shared_secret_payload(
    holder_key: &ManagedKey,
    capability: &Capability,
) -> Result<Vec<u8>> {
    if holder_key.encrypted() {
        return Err(Error::KeyMustBeDecrypted);
    }
    let iv = URL_SAFE
        .decode(&capability.id)
        .map_err(|e| Error::Crypto(format!("capability id: {e}")))?;

    let mut data = capability.encrypted_payload.clone();
    block_crypt(&iv, &holder_key.plaintext, &mut data)?;
    Ok(unpad(&data)?.to_vec())
}

/// The deterministic id of a public-key grant.
pub fn public_key_capability_id(holder_public: &[u8], nonce: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(holder_public);
    hasher.update(nonce);
    URL_SAFE.encode(hasher.finalize())
}

fn box_key(private: &[u8], public: &[u8]) -> Result<chacha20poly1305::Key> {
    if private.len() != 32 || public.len() != 32 {
        return Err(Error::InvalidKey);
    }
    let mut sk = [0u8; 32];
    sk.copy_from_slice(private);
    let mut pk = [0u8; 32];
    pk.copy_from_slice(public);
    let shared = StaticSecret::from(sk).diffie_hellman(&PublicKey::from(pk));
    let digest = Sha256::digest(shared.as_bytes());
    Ok(*chacha20poly1305::Key::from_slice(&digest))
}

/// Grant a capability to the holder of an account key pair.
///
/// The payload is sealed to the holder's public key using the issuer's
/// private key; either party's private half opens it.
pub fn grant_public_key<P: Serialize, Q: Serialize>(
    issuer: &ManagedKeyPair,
    holder_public: &[u8],
    nonce: &[u8],
    public_payload: &P,
    private_payload: &Q,
) -> Result<Capability> {
    if issuer.encrypted() {
        return Err(Error::KeyMustBeDecrypted);
    }
    if nonce.len() != issuer.kind.nonce_size() {
        return Err(Error::InvalidKey);
    }

    let key = box_key(&issuer.private_key, holder_public)?;
    let cipher = XChaCha20Poly1305::new(&key);
    let private = serde_json::to_vec(private_payload).map_err(Error::MalformedPacket)?;
    let sealed = cipher
        .encrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: &private,
                aad: &[],
            },
        )
        .map_err(|_| Error::Crypto("capability seal failed".to_string()))?;

    let public = serde_json::to_vec(public_payload).map_err(Error::MalformedPacket)?;

    Ok(Capability {
        id: public_key_capability_id(holder_public, nonce),
        nonce: nonce.to_vec(),
        public_payload: public,
        encrypted_payload: sealed,
    })
}

/// Open the private payload of a public-key grant.
///
/// Returns the JSON bytes of the payload.
pub fn decrypt_public_key_payload(
    holder: &ManagedKeyPair,
    issuer_public: &[u8],
    capability: &Capability,
) -> Result<Vec<u8>> {
    if holder.encrypted() {
        return Err(Error::KeyMustBeDecrypted);
    }

    let key = box_key(&holder.private_key, issuer_public)?;
    let cipher = XChaCha20Poly1305::new(&key);
    cipher
        .decrypt(
            XNonce::from_slice(&capability.nonce),
            Payload {
                msg: &capability.encrypted_payload,
                aad: &[],
            },
        )
        .map_err(|_| Error::AccessDenied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{key_from_passcode, KeyPairType, KeyType};

    #[test]
    fn shared_secret_id_is_deterministic() {
        let key = key_from_passcode(b"swordfish", b"salt", KeyType::Aes128).unwrap();
        let nonce = [7u8; 16];
        let a = shared_secret_capability_id(&key, &nonce).unwrap();
        let b = shared_secret_capability_id(&key, &nonce).unwrap();
        assert_eq!(a, b);

        let other = key_from_passcode(b"tunafish", b"salt", KeyType::Aes128).unwrap();
        assert_ne!(a, shared_secret_capability_id(&other, &nonce).unwrap());
    }

    #[test]
    fn shared_secret_grant_round_trips() {
        let key = key_from_passcode(b"swordfish", b"salt", KeyType::Aes128).unwrap();
        let nonce = [9u8; 16];
        let secret = vec![1u8, 2, 3, 4];
        let cap = grant_shared_secret(&key, &nonce, &"room-key", &secret).unwrap();

        let payload = decrypt_shared_secret_payload(&key, &cap).unwrap();
        let opened: Vec<u8> = serde_json::from_slice(&payload).unwrap();
        assert_eq!(opened, secret);

        // The wrong key opens to garbage that fails to unpad or parse.
        let wrong = key_from_passcode(b"tunafish", b"salt", KeyType::Aes128).unwrap();
        let garbled = decrypt_shared_secret_payload(&wrong, &cap);
        match garbled {
            Err(_) => {}
            Ok(bytes) => assert!(serde_json::from_slice::<Vec<u8>>(&bytes).is_err()),
        }
    }

    #[test]
    fn public_key_grant_round_trips() {
        let issuer = ManagedKeyPair::generate(KeyPairType::X25519, &[1u8; 32]).unwrap();
        let holder = ManagedKeyPair::generate(KeyPairType::X25519, &[2u8; 32]).unwrap();
        let nonce = [3u8; 24];

        let cap =
            grant_public_key(&issuer, &holder.public_key, &nonce, &"grant", &vec![9u8; 16])
                .unwrap();
        assert_eq!(cap.id, public_key_capability_id(&holder.public_key, &nonce));

        let payload = decrypt_public_key_payload(&holder, &issuer.public_key, &cap).unwrap();
        let opened: Vec<u8> = serde_json::from_slice(&payload).unwrap();
        assert_eq!(opened, vec![9u8; 16]);

        let outsider = ManagedKeyPair::generate(KeyPairType::X25519, &[4u8; 32]).unwrap();
        assert!(decrypt_public_key_payload(&outsider, &issuer.public_key, &cap).is_err());
    }
}
