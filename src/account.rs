//! Accounts and the key material that protects them.
//!
//! An account's secrets are arranged so that the service can never read
//! the private key without either the owner's password or the KMS master
//! key: a key-encrypting key is wrapped twice, once under the KMS
//! (`system_key`) and once under the password-derived client key
//! (`user_key`), and the account key pair is wrapped under the KEK.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::api::Time;
use crate::security::capability::{decrypt_shared_secret_payload, Capability};
use crate::security::kms::{Kms, KmsCredential, LocalKms};
use crate::security::{
    key_from_passcode, poly1305_mac, poly1305_verify, KeyPairType, ManagedKey, ManagedKeyPair,
    CLIENT_KEY_TYPE,
};
use crate::snowflake::Snowflake;
use crate::{Error, Result};

/// Minimum password length accepted at registration.
pub const MIN_PASSWORD_LENGTH: usize = 6;

type HmacSha256 = Hmac<Sha256>;

/// Check that a personal identity is acceptable for registration.
pub fn validate_personal_identity(namespace: &str, _id: &str) -> (bool, Option<String>) {
    match namespace {
        "email" => (true, None),
        _ => (false, Some(format!("invalid namespace: {namespace}"))),
    }
}

/// Check that a password is acceptable for registration.
pub fn validate_account_password(password: &str) -> (bool, Option<String>) {
    if password.len() < MIN_PASSWORD_LENGTH {
        return (
            false,
            Some(format!(
                "password must be at least {MIN_PASSWORD_LENGTH} characters long"
            )),
        );
    }
    (true, None)
}

/// An identity in some external namespace attached to an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalIdentity {
    pub namespace: String,
    pub id: String,
    pub verified: bool,
}

/// The secrets block of an account.
#[derive(Debug, Clone)]
pub struct AccountSecurity {
    pub nonce: Vec<u8>,
    pub mac: Vec<u8>,
    pub system_key: ManagedKey,
    pub user_key: ManagedKey,
    pub key_pair: ManagedKeyPair,
}

/// Initialize the nonce and account secrets for a new account with the
/// given password. Returns the security block and the decrypted client key.
pub fn new_account_security(
    kms: &dyn Kms,
    password: &str,
) -> Result<(AccountSecurity, ManagedKey)> {
    let kp_type = KeyPairType::X25519;

    // One KMS request covers all the randomness needed: nonce, then
    // private key.
    let random_data = kms.generate_nonce(kp_type.nonce_size() + kp_type.private_key_size())?;
    let (nonce, private_seed) = random_data.split_at(kp_type.nonce_size());

    let mut iv = vec![0u8; CLIENT_KEY_TYPE.block_size()];
    iv.copy_from_slice(&nonce[..CLIENT_KEY_TYPE.block_size()]);

    // The KEK comes back wrapped under the master key, bound to the
    // account nonce as its context.
    let nonce_base64 = base64_url(nonce);
    let system_key = kms.generate_encrypted_key(CLIENT_KEY_TYPE, "nonce", &nonce_base64)?;

    let mut key_pair = ManagedKeyPair::generate(kp_type, private_seed)?;

    let mut kek = system_key.clone();
    kms.decrypt_key(&mut kek)?;

    key_pair.iv = iv.clone();
    key_pair.encrypt(&kek)?;

    // Re-wrap the KEK under the password-derived client key.
    let client_key = key_from_passcode(password.as_bytes(), nonce, CLIENT_KEY_TYPE)?;
    let mut user_key = kek.clone();
    user_key.iv = iv;
    user_key.encrypt(&client_key)?;

    let mac = poly1305_mac(&client_key.plaintext, nonce);

    let security = AccountSecurity {
        nonce: nonce.to_vec(),
        mac: mac.to_vec(),
        system_key,
        user_key,
        key_pair,
    };
    Ok((security, client_key))
}

impl AccountSecurity {
    /// Recover the account key pair with the client key.
    ///
    /// A wrong password fails the MAC check before any decryption is
    /// attempted.
    pub fn unlock(&self, client_key: &ManagedKey) -> Result<ManagedKeyPair> {
        if client_key.encrypted() {
            return Err(Error::KeyMustBeDecrypted);
        }

        if !poly1305_verify(&self.mac, &client_key.plaintext, &self.nonce) {
            return Err(Error::AccessDenied);
        }

        let mut kek = self.user_key.clone();
        kek.decrypt(client_key)?;

        let mut key_pair = self.key_pair.clone();
        key_pair.decrypt(&kek)?;

        Ok(key_pair)
    }

    /// Rewrap the KEK under a new password-derived key.
    ///
    /// The nonce and key pair are preserved; only `user_key` and the MAC
    /// change.
    pub fn reset_password(&self, kms: &dyn Kms, password: &str) -> Result<Self> {
        let mut kek = self.system_key.clone();
        kms.decrypt_key(&mut kek)?;

        let client_key =
            key_from_passcode(password.as_bytes(), &self.nonce, self.user_key.key_type)?;
        kek.encrypt(&client_key)?;

        let mac = poly1305_mac(&client_key.plaintext, &self.nonce);

        Ok(Self {
            nonce: self.nonce.clone(),
            mac: mac.to_vec(),
            system_key: self.system_key.clone(),
            user_key: kek,
            key_pair: self.key_pair.clone(),
        })
    }
}

/// An account and everything persisted about it.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: Snowflake,
    pub security: AccountSecurity,
    pub staff_capability: Option<Capability>,
    pub personal_identities: Vec<PersonalIdentity>,
}

impl Account {
    /// Derive the client key for this account from a password attempt.
    pub fn key_from_password(&self, password: &str) -> Result<ManagedKey> {
        key_from_passcode(
            password.as_bytes(),
            &self.security.nonce,
            self.security.user_key.key_type,
        )
    }

    /// The account's key pair, private half encrypted.
    pub fn key_pair(&self) -> ManagedKeyPair {
        self.security.key_pair.clone()
    }

    /// Recover the account key pair with the client key.
    pub fn unlock(&self, client_key: &ManagedKey) -> Result<ManagedKeyPair> {
        self.security.unlock(client_key)
    }

    pub fn is_staff(&self) -> bool {
        self.staff_capability.is_some()
    }

    /// Materialize the staff KMS credential held by this account.
    pub fn unlock_staff_kms(&self, client_key: &ManagedKey) -> Result<LocalKms> {
        let capability = self
            .staff_capability
            .as_ref()
            .ok_or(Error::AccessDenied)?;

        let mut kek = self.security.user_key.clone();
        kek.decrypt(client_key)?;

        let payload = decrypt_shared_secret_payload(&kek, capability)?;
        let credential: KmsCredential =
            serde_json::from_slice(&payload).map_err(Error::ReceivedMalformedPacket)?;
        credential.kms()
    }
}

fn base64_url(data: &[u8]) -> String {
    use base64::engine::general_purpose::URL_SAFE;
    use base64::Engine as _;
    URL_SAFE.encode(data)
}

fn token_mac(kek: &ManagedKey, label: &str, subject: &str, expires: Time) -> Result<Vec<u8>> {
    if kek.encrypted() {
        return Err(Error::KeyMustBeDecrypted);
    }
    let mut mac =
        HmacSha256::new_from_slice(&kek.plaintext).expect("hmac accepts any key length");
    mac.update(label.as_bytes());
    mac.update(b"|");
    mac.update(subject.as_bytes());
    mac.update(b"|");
    mac.update(expires.0.to_be_bytes().as_ref());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Mint a time-limited email verification token, bound to the account
/// through its KMS-unwrapped KEK.
pub fn email_verification_token(kek: &ManagedKey, email: &str, expires: Time) -> Result<String> {
    Ok(hex::encode(token_mac(kek, "verify", email, expires)?))
}

/// Check an email verification token.
pub fn check_email_verification_token(
    kek: &ManagedKey,
    email: &str,
    expires: Time,
    token: &str,
) -> Result<()> {
    if expires < Time::now() {
        return Err(Error::InvalidVerificationToken);
    }
    let presented = hex::decode(token).map_err(|_| Error::InvalidVerificationToken)?;
    let expected = token_mac(kek, "verify", email, expires)?;
    if !crate::security::constant_time_eq(&presented, &expected) {
        return Err(Error::InvalidVerificationToken);
    }
    Ok(())
}

/// Mint a password reset confirmation code of the form
/// `<account-id>:<expires>:<mac>`.
pub fn password_reset_confirmation(
    kek: &ManagedKey,
    account_id: Snowflake,
    expires: Time,
) -> Result<String> {
    let mac = token_mac(kek, "reset", &account_id.to_string(), expires)?;
    Ok(format!("{account_id}:{}:{}", expires.0, hex::encode(mac)))
}

/// The account named by a confirmation code, available before
/// verification so the account's KEK can be loaded.
pub fn confirmation_account(code: &str) -> Result<Snowflake> {
    let account_id = code.split(':').next().ok_or(Error::InvalidConfirmationCode)?;
    account_id
        .parse()
        .map_err(|_| Error::InvalidConfirmationCode)
}

/// Check a password reset confirmation code.
pub fn check_password_reset_confirmation(kek: &ManagedKey, code: &str) -> Result<Snowflake> {
    let mut parts = code.splitn(3, ':');
    let (account_id, expires, mac) = match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(e), Some(m)) => (a, e, m),
        _ => return Err(Error::InvalidConfirmationCode),
    };

    let account_id: Snowflake = account_id
        .parse()
        .map_err(|_| Error::InvalidConfirmationCode)?;
    let expires = Time(
        expires
            .parse::<i64>()
            .map_err(|_| Error::InvalidConfirmationCode)?,
    );
    if expires < Time::now() {
        return Err(Error::InvalidConfirmationCode);
    }

    let presented = hex::decode(mac).map_err(|_| Error::InvalidConfirmationCode)?;
    let expected = token_mac(kek, "reset", &account_id.to_string(), expires)?;
    if !crate::security::constant_time_eq(&presented, &expected) {
        return Err(Error::InvalidConfirmationCode);
    }
    Ok(account_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::kms::LocalKms;

    fn unlock_with(security: &AccountSecurity, password: &str) -> Result<ManagedKeyPair> {
        let client_key = key_from_passcode(
            password.as_bytes(),
            &security.nonce,
            security.user_key.key_type,
        )?;
        security.unlock(&client_key)
    }

    #[test]
    fn encryption_and_decryption_of_generated_keys() {
        let kms = LocalKms::generate();
        let (security, client_key) = new_account_security(&kms, "hunter2").unwrap();

        assert!(security.system_key.encrypted());
        assert!(security.user_key.encrypted());
        assert!(security.key_pair.encrypted());
        assert_eq!(security.nonce.len(), KeyPairType::X25519.nonce_size());
        assert!(!client_key.encrypted());

        let mut kek = security.system_key.clone();
        kms.decrypt_key(&mut kek).unwrap();

        let mut system_kp = security.key_pair.clone();
        system_kp.decrypt(&kek).unwrap();

        assert!(matches!(
            unlock_with(&security, ""),
            Err(Error::AccessDenied)
        ));

        let kp = unlock_with(&security, "hunter2").unwrap();
        assert_eq!(kp.private_key, system_kp.private_key);
    }

    #[test]
    fn password_resets() {
        let kms = LocalKms::generate();
        let (security, _) = new_account_security(&kms, "hunter2").unwrap();

        let new_security = security.reset_password(&kms, "hunter3").unwrap();

        let old_kp = unlock_with(&security, "hunter2").unwrap();
        assert!(matches!(
            unlock_with(&new_security, "hunter2"),
            Err(Error::AccessDenied)
        ));

        let kp = unlock_with(&new_security, "hunter3").unwrap();
        assert_eq!(kp.private_key, old_kp.private_key);
    }

    #[test]
    fn verification_tokens() {
        let kek = ManagedKey::from_plaintext(CLIENT_KEY_TYPE, vec![5u8; 16]);
        let expires = Time(Time::now().0 + 3600);
        let token = email_verification_token(&kek, "max@example.com", expires).unwrap();

        check_email_verification_token(&kek, "max@example.com", expires, &token).unwrap();
        assert!(
            check_email_verification_token(&kek, "eve@example.com", expires, &token).is_err()
        );

        let expired = Time(Time::now().0 - 1);
        let stale = email_verification_token(&kek, "max@example.com", expired).unwrap();
        assert!(
            check_email_verification_token(&kek, "max@example.com", expired, &stale).is_err()
        );
    }

    #[test]
    fn reset_confirmations() {
        let kek = ManagedKey::from_plaintext(CLIENT_KEY_TYPE, vec![6u8; 16]);
        let id = Snowflake(12345);
        let expires = Time(Time::now().0 + 3600);
        let code = password_reset_confirmation(&kek, id, expires).unwrap();

        assert_eq!(confirmation_account(&code).unwrap(), id);
        assert_eq!(check_password_reset_confirmation(&kek, &code).unwrap(), id);

        let other = ManagedKey::from_plaintext(CLIENT_KEY_TYPE, vec![7u8; 16]);
        assert!(check_password_reset_confirmation(&other, &code).is_err());
        assert!(check_password_reset_confirmation(&kek, "garbage").is_err());
    }
}
