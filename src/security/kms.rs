//! The key-management collaborator that owns the master key.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::{block_crypt, random_bytes, KeyType, ManagedKey};
use crate::{Error, Result};

const MAC_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// A key-management service.
///
/// Implementations provide randomness, mint data keys wrapped under the
/// master key and MAC-bound to a `(context_key, context_value)` pair, and
/// unwrap those keys in place. An envelope never decrypts under a context
/// other than the one it was minted for.
pub trait Kms: Send + Sync {
    /// Cryptographically random bytes of the requested length.
    fn generate_nonce(&self, bytes: usize) -> Result<Vec<u8>>;

    /// Generate a fresh data key, returned wrapped under the master key and
    /// bound to the given context.
    fn generate_encrypted_key(
        &self,
        key_type: KeyType,
        context_key: &str,
        context_value: &str,
    ) -> Result<ManagedKey>;

    /// Unwrap an encrypted data key in place.
    fn decrypt_key(&self, key: &mut ManagedKey) -> Result<()>;
}

/// A KMS backed by a locally-held AES-256 master key.
///
/// Envelopes are encrypted by block-XOR under the master key and
/// authenticated by an HMAC-SHA-256 over the context, keyed by the data key
/// itself. The wrapped form is `mac || encrypted_key`.
#[derive(Debug, Clone)]
pub struct LocalKms {
    master_key: Vec<u8>,
}

impl LocalKms {
    pub fn new(master_key: Vec<u8>) -> Result<Self> {
        if master_key.len() != KeyType::Aes256.key_size() {
            return Err(Error::InvalidKey);
        }
        Ok(Self { master_key })
    }

    /// A local KMS with a freshly drawn master key.
    pub fn generate() -> Self {
        Self {
            master_key: random_bytes(KeyType::Aes256.key_size()),
        }
    }

    fn context_mac(data_key: &[u8], context_key: &str, context_value: &str) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(data_key).expect("hmac accepts any key length");
        mac.update(context_key.as_bytes());
        mac.update(context_value.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn xor_key(&self, key: &mut ManagedKey) -> Result<()> {
        if key.iv.len() != key.key_type.block_size() {
            return Err(Error::InvalidKey);
        }

        if key.encrypted() {
            if key.ciphertext.len() != key.key_type.key_size() + MAC_SIZE {
                return Err(Error::InvalidKey);
            }
            let mut data = key.ciphertext.split_off(MAC_SIZE);
            let macsum = std::mem::take(&mut key.ciphertext);
            block_crypt(&key.iv, &self.master_key, &mut data)?;
            let expected = Self::context_mac(&data, &key.context_key, &key.context_value);
            if !super::constant_time_eq(&macsum, &expected) {
                return Err(Error::InvalidKey);
            }
            key.plaintext = data;
        } else {
            let mut data = std::mem::take(&mut key.plaintext);
            let macsum = Self::context_mac(&data, &key.context_key, &key.context_value);
            block_crypt(&key.iv, &self.master_key, &mut data)?;
            let mut ciphertext = macsum;
            ciphertext.extend_from_slice(&data);
            key.ciphertext = ciphertext;
        }

        Ok(())
    }
}

impl Kms for LocalKms {
    fn generate_nonce(&self, bytes: usize) -> Result<Vec<u8>> {
        Ok(random_bytes(bytes))
    }

    fn generate_encrypted_key(
        &self,
        key_type: KeyType,
        context_key: &str,
        context_value: &str,
    ) -> Result<ManagedKey> {
        let iv = self.generate_nonce(key_type.block_size())?;
        let plaintext = self.generate_nonce(key_type.key_size())?;

        let mut key = ManagedKey::from_plaintext(key_type, plaintext);
        key.iv = iv;
        key.context_key = context_key.to_string();
        key.context_value = context_value.to_string();
        self.xor_key(&mut key)?;

        Ok(key)
    }

    fn decrypt_key(&self, key: &mut ManagedKey) -> Result<()> {
        if !key.encrypted() {
            return Err(Error::KeyMustBeEncrypted);
        }
        self.xor_key(key)
    }
}

/// A serializable credential from which a live KMS can be materialized.
///
/// Carried as the encrypted payload of a staff capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmsCredential {
    pub kms_type: String,
    pub master_key: String,
}

impl KmsCredential {
    pub fn for_local(kms_master_key: &[u8]) -> Self {
        Self {
            kms_type: "local".to_string(),
            master_key: hex::encode(kms_master_key),
        }
    }

    pub fn kms(&self) -> Result<LocalKms> {
        if self.kms_type != "local" {
            return Err(Error::Crypto(format!(
                "unsupported kms type: {}",
                self.kms_type
            )));
        }
        let master_key =
            hex::decode(&self.master_key).map_err(|e| Error::Crypto(format!("credential: {e}")))?;
        LocalKms::new(master_key)
    }
}

impl LocalKms {
    pub fn credential(&self) -> KmsCredential {
        KmsCredential::for_local(&self.master_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_decrypt_under_their_context() {
        let kms = LocalKms::generate();
        let key = kms
            .generate_encrypted_key(KeyType::Aes128, "room", "lobby")
            .unwrap();
        assert!(key.encrypted());

        let mut copy = key.clone();
        kms.decrypt_key(&mut copy).unwrap();
        assert!(!copy.encrypted());
        assert_eq!(copy.plaintext.len(), 16);
    }

    #[test]
    fn envelopes_do_not_replay_under_another_context() {
        let kms = LocalKms::generate();
        let key = kms
            .generate_encrypted_key(KeyType::Aes128, "room", "lobby")
            .unwrap();

        let mut forged = key.clone();
        forged.context_value = "other".to_string();
        assert!(matches!(kms.decrypt_key(&mut forged), Err(Error::InvalidKey)));
    }

    #[test]
    fn decrypt_requires_encrypted_envelope() {
        let kms = LocalKms::generate();
        let mut key = ManagedKey::from_plaintext(KeyType::Aes128, vec![1u8; 16]);
        assert!(matches!(
            kms.decrypt_key(&mut key),
            Err(Error::KeyMustBeEncrypted)
        ));
    }

    #[test]
    fn bad_iv_is_rejected() {
        let kms = LocalKms::generate();
        let mut key = kms
            .generate_encrypted_key(KeyType::Aes128, "room", "lobby")
            .unwrap();
        key.iv.truncate(8);
        assert!(matches!(kms.decrypt_key(&mut key), Err(Error::InvalidKey)));
    }

    #[test]
    fn credential_round_trips() {
        let kms = LocalKms::generate();
        let cred = kms.credential();
        let json = serde_json::to_string(&cred).unwrap();
        let cred: KmsCredential = serde_json::from_str(&json).unwrap();
        let restored = cred.kms().unwrap();

        let key = kms
            .generate_encrypted_key(KeyType::Aes128, "room", "lobby")
            .unwrap();
        let mut copy = key.clone();
        restored.decrypt_key(&mut copy).unwrap();
        assert!(!copy.encrypted());
    }
}
