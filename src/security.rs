//! Key material and the envelopes it travels in.
//!
//! A [`ManagedKey`] is a symmetric key that is either decrypted (plaintext
//! bytes in hand) or encrypted under some other key. A [`ManagedKeyPair`]
//! is the asymmetric analogue, with only the private half protected. Keys
//! move between the two states by block encryption under a key-encrypting
//! key; the master of that hierarchy lives behind the [`kms::Kms`] trait.

pub mod capability;
pub mod kms;

use aes::{Aes128, Aes256};
use aes_gcm::aead::consts::U13;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::AesGcm;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use poly1305::Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use scrypt::Params;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{Error, Result};

/// AES block size, shared by every key type.
pub const BLOCK_SIZE: usize = 16;

/// Message content is encrypted with the 13 canonical bytes of the message
/// id as the AEAD nonce.
pub const CONTENT_NONCE_SIZE: usize = 13;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes256Ctr = Ctr128BE<Aes256>;
type ContentCipher = AesGcm<Aes128, U13>;

/// The symmetric key types in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Aes128,
    Aes256,
}

impl KeyType {
    pub fn key_size(self) -> usize {
        match self {
            Self::Aes128 => 16,
            Self::Aes256 => 32,
        }
    }

    pub fn block_size(self) -> usize {
        BLOCK_SIZE
    }

    pub fn nonce_size(self) -> usize {
        BLOCK_SIZE
    }
}

/// The key pair types in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPairType {
    X25519,
}

impl KeyPairType {
    pub fn private_key_size(self) -> usize {
        32
    }

    pub fn public_key_size(self) -> usize {
        32
    }

    pub fn nonce_size(self) -> usize {
        24
    }
}

/// Key type for room message keys.
pub const ROOM_MESSAGE_KEY_TYPE: KeyType = KeyType::Aes128;

/// Key type for password-derived client keys.
pub const CLIENT_KEY_TYPE: KeyType = KeyType::Aes128;

/// A symmetric key, either decrypted or wrapped under another key.
#[derive(Debug, Clone)]
pub struct ManagedKey {
    pub key_type: KeyType,
    pub iv: Vec<u8>,
    pub plaintext: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub context_key: String,
    pub context_value: String,
}

impl ManagedKey {
    /// A decrypted key from raw bytes.
    pub fn from_plaintext(key_type: KeyType, plaintext: Vec<u8>) -> Self {
        Self {
            key_type,
            iv: Vec::new(),
            plaintext,
            ciphertext: Vec::new(),
            context_key: String::new(),
            context_value: String::new(),
        }
    }

    /// An encrypted key from stored envelope fields.
    pub fn from_ciphertext(
        key_type: KeyType,
        iv: Vec<u8>,
        ciphertext: Vec<u8>,
        context_key: &str,
        context_value: &str,
    ) -> Self {
        Self {
            key_type,
            iv,
            plaintext: Vec::new(),
            ciphertext,
            context_key: context_key.to_string(),
            context_value: context_value.to_string(),
        }
    }

    pub fn encrypted(&self) -> bool {
        !self.ciphertext.is_empty()
    }

    /// Encrypt this key's plaintext in place under a decrypted
    /// key-encrypting key, using this key's IV.
    pub fn encrypt(&mut self, kek: &ManagedKey) -> Result<()> {
        if self.encrypted() {
            return Err(Error::KeyMustBeDecrypted);
        }
        if kek.encrypted() {
            return Err(Error::KeyMustBeDecrypted);
        }
        let mut data = std::mem::take(&mut self.plaintext);
        block_crypt(&self.iv, &kek.plaintext, &mut data)?;
        self.ciphertext = data;
        Ok(())
    }

    /// Decrypt this key's ciphertext in place under a decrypted
    /// key-encrypting key.
    pub fn decrypt(&mut self, kek: &ManagedKey) -> Result<()> {
        if !self.encrypted() {
            return Err(Error::KeyMustBeEncrypted);
        }
        if kek.encrypted() {
            return Err(Error::KeyMustBeDecrypted);
        }
        let mut data = std::mem::take(&mut self.ciphertext);
        block_crypt(&self.iv, &kek.plaintext, &mut data)?;
        self.plaintext = data;
        Ok(())
    }
}

/// An asymmetric key pair with the private half protected at rest.
#[derive(Debug, Clone)]
pub struct ManagedKeyPair {
    pub kind: KeyPairType,
    pub iv: Vec<u8>,
    pub private_key: Vec<u8>,
    pub encrypted_private_key: Vec<u8>,
    pub public_key: Vec<u8>,
}

impl ManagedKeyPair {
    /// Derive a key pair deterministically from private-key-sized seed
    /// bytes.
    pub fn generate(kind: KeyPairType, seed: &[u8]) -> Result<Self> {
        if seed.len() != kind.private_key_size() {
            return Err(Error::InvalidKey);
        }
        let mut private = [0u8; 32];
        private.copy_from_slice(seed);
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        Ok(Self {
            kind,
            iv: Vec::new(),
            private_key: secret.to_bytes().to_vec(),
            encrypted_private_key: Vec::new(),
            public_key: public.as_bytes().to_vec(),
        })
    }

    pub fn encrypted(&self) -> bool {
        !self.encrypted_private_key.is_empty()
    }

    /// Encrypt the private half in place under a decrypted key.
    pub fn encrypt(&mut self, kek: &ManagedKey) -> Result<()> {
        if self.encrypted() {
            return Err(Error::KeyMustBeDecrypted);
        }
        if kek.encrypted() {
            return Err(Error::KeyMustBeDecrypted);
        }
        let mut data = std::mem::take(&mut self.private_key);
        block_crypt(&self.iv, &kek.plaintext, &mut data)?;
        self.encrypted_private_key = data;
        Ok(())
    }

    /// Decrypt the private half in place under a decrypted key.
    pub fn decrypt(&mut self, kek: &ManagedKey) -> Result<()> {
        if !self.encrypted() {
            return Err(Error::KeyMustBeEncrypted);
        }
        if kek.encrypted() {
            return Err(Error::KeyMustBeDecrypted);
        }
        let mut data = std::mem::take(&mut self.encrypted_private_key);
        block_crypt(&self.iv, &kek.plaintext, &mut data)?;
        self.private_key = data;
        Ok(())
    }
}

/// XOR a keystream over `data` in place.
///
/// The key length selects the cipher; the IV must be one block.
pub fn block_crypt(iv: &[u8], key: &[u8], data: &mut [u8]) -> Result<()> {
    if iv.len() != BLOCK_SIZE {
        return Err(Error::InvalidKey);
    }
    match key.len() {
        16 => {
            let mut cipher =
                Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
            cipher.apply_keystream(data);
        }
        32 => {
            let mut cipher =
                Aes256Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(iv));
            cipher.apply_keystream(data);
        }
        _ => return Err(Error::InvalidKey),
    }
    Ok(())
}

/// Pad to a whole number of blocks; the count lives in every pad byte.
pub fn pad(data: &mut Vec<u8>) {
    let n = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    data.extend(std::iter::repeat(n as u8).take(n));
}

/// Strip the padding appended by [`pad`].
pub fn unpad(data: &[u8]) -> Result<&[u8]> {
    let n = *data.last().ok_or(Error::InvalidKey)? as usize;
    if n == 0 || n > BLOCK_SIZE || n > data.len() {
        return Err(Error::InvalidKey);
    }
    Ok(&data[..data.len() - n])
}

/// AEAD-encrypt message content.
///
/// Returns the authentication tag and the ciphertext separately; the nonce
/// must never repeat under the same key.
pub fn encrypt_gcm(
    key: &ManagedKey,
    nonce: &[u8],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<(Vec<u8>, Vec<u8>)> {
    if key.encrypted() {
        return Err(Error::KeyMustBeDecrypted);
    }
    if key.key_type != KeyType::Aes128 || nonce.len() != CONTENT_NONCE_SIZE {
        return Err(Error::InvalidKey);
    }

    let cipher = ContentCipher::new(GenericArray::from_slice(&key.plaintext));
    let mut sealed = cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::Crypto("content encrypt failed".to_string()))?;

    let tag = sealed.split_off(sealed.len() - 16);
    Ok((tag, sealed))
}

/// AEAD-decrypt message content sealed by [`encrypt_gcm`].
pub fn decrypt_gcm(
    key: &ManagedKey,
    nonce: &[u8],
    tag: &[u8],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    if key.encrypted() {
        return Err(Error::KeyMustBeDecrypted);
    }
    if key.key_type != KeyType::Aes128 || nonce.len() != CONTENT_NONCE_SIZE {
        return Err(Error::InvalidKey);
    }

    let mut sealed = ciphertext.to_vec();
    sealed.extend_from_slice(tag);

    let cipher = ContentCipher::new(GenericArray::from_slice(&key.plaintext));
    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: &sealed,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::Crypto("content decrypt failed".to_string()))
}

/// Derive a key from a passcode or password.
///
/// Deterministic: identical `(passcode, nonce, key_type)` inputs yield
/// identical key bytes.
pub fn key_from_passcode(passcode: &[u8], nonce: &[u8], key_type: KeyType) -> Result<ManagedKey> {
    let params = Params::new(14, 8, 1, key_type.key_size())
        .map_err(|e| Error::Crypto(format!("kdf params: {e}")))?;
    let mut out = vec![0u8; key_type.key_size()];
    scrypt::scrypt(passcode, nonce, &params, &mut out)
        .map_err(|e| Error::Crypto(format!("kdf: {e}")))?;
    Ok(ManagedKey::from_plaintext(key_type, out))
}

/// Poly1305 MAC of `msg` under a key zero-padded to 32 bytes.
pub fn poly1305_mac(key: &[u8], msg: &[u8]) -> [u8; 16] {
    let mut key32 = [0u8; 32];
    let n = key.len().min(32);
    key32[..n].copy_from_slice(&key[..n]);
    let tag = Poly1305::new(GenericArray::from_slice(&key32)).compute_unpadded(msg);
    tag.into()
}

/// Constant-time verification of a [`poly1305_mac`] tag.
pub fn poly1305_verify(mac: &[u8], key: &[u8], msg: &[u8]) -> bool {
    constant_time_eq(&poly1305_mac(key, msg), mac)
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Cryptographically random bytes from the operating system.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_crypt_round_trips() {
        let key = vec![7u8; 16];
        let iv = vec![9u8; 16];
        let mut data = b"attack at dawn".to_vec();
        block_crypt(&iv, &key, &mut data).unwrap();
        assert_ne!(data, b"attack at dawn");
        block_crypt(&iv, &key, &mut data).unwrap();
        assert_eq!(data, b"attack at dawn");
    }

    #[test]
    fn block_crypt_rejects_bad_iv_and_key() {
        let mut data = vec![0u8; 4];
        assert!(block_crypt(&[0u8; 8], &[0u8; 16], &mut data).is_err());
        assert!(block_crypt(&[0u8; 16], &[0u8; 7], &mut data).is_err());
    }

    #[test]
    fn pad_round_trips() {
        for len in 0..48 {
            let mut data: Vec<u8> = (0..len as u8).collect();
            let original = data.clone();
            pad(&mut data);
            assert_eq!(data.len() % BLOCK_SIZE, 0);
            assert_eq!(unpad(&data).unwrap(), &original[..]);
        }
    }

    #[test]
    fn managed_key_wrap_round_trips() {
        let kek = ManagedKey::from_plaintext(KeyType::Aes128, vec![1u8; 16]);
        let mut key = ManagedKey::from_plaintext(KeyType::Aes128, vec![2u8; 16]);
        key.iv = vec![3u8; 16];

        key.encrypt(&kek).unwrap();
        assert!(key.encrypted());
        assert!(key.plaintext.is_empty());

        key.decrypt(&kek).unwrap();
        assert!(!key.encrypted());
        assert_eq!(key.plaintext, vec![2u8; 16]);
    }

    #[test]
    fn gcm_round_trips_and_authenticates() {
        let key = ManagedKey::from_plaintext(KeyType::Aes128, vec![5u8; 16]);
        let nonce = b"0123456789abc";
        let (tag, ct) = encrypt_gcm(&key, nonce, b"hello", b"sender").unwrap();
        assert_eq!(
            decrypt_gcm(&key, nonce, &tag, &ct, b"sender").unwrap(),
            b"hello"
        );
        assert!(decrypt_gcm(&key, nonce, &tag, &ct, b"other").is_err());

        let mut bad_tag = tag.clone();
        bad_tag[0] ^= 1;
        assert!(decrypt_gcm(&key, nonce, &bad_tag, &ct, b"sender").is_err());
    }

    #[test]
    fn passcode_kdf_is_deterministic() {
        let a = key_from_passcode(b"swordfish", b"nonce", KeyType::Aes128).unwrap();
        let b = key_from_passcode(b"swordfish", b"nonce", KeyType::Aes128).unwrap();
        let c = key_from_passcode(b"swordfish!", b"nonce", KeyType::Aes128).unwrap();
        assert_eq!(a.plaintext, b.plaintext);
        assert_ne!(a.plaintext, c.plaintext);
        assert_eq!(a.plaintext.len(), 16);
    }

    #[test]
    fn key_pair_generation_is_deterministic() {
        let a = ManagedKeyPair::generate(KeyPairType::X25519, &[4u8; 32]).unwrap();
        let b = ManagedKeyPair::generate(KeyPairType::X25519, &[4u8; 32]).unwrap();
        assert_eq!(a.public_key, b.public_key);
        assert_eq!(a.public_key.len(), 32);
    }

    #[test]
    fn poly1305_verifies() {
        let mac = poly1305_mac(&[1u8; 16], b"nonce bytes");
        assert!(poly1305_verify(&mac, &[1u8; 16], b"nonce bytes"));
        assert!(!poly1305_verify(&mac, &[2u8; 16], b"nonce bytes"));
        assert!(!poly1305_verify(&mac, &[1u8; 16], b"other bytes"));
    }
}
