//! Argon2id password digests.
//!
//! Digests use the PHC string format:
//!
//! ```text
//! $argon2id$v=19$m=65536,t=3,p=2$<salt>$<key>
//! ```
//!
//! Salt and key are standard base64 without padding. Verification reads the
//! parameters back out of the digest, so digests created with older settings
//! keep verifying after the configured parameters change.

use argon2::{Algorithm, Argon2, Params, Version};
use base64ct::{Base64Unpadded, Encoding};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

const ALGORITHM_TAG: &str = "argon2id";
const VERSION_TAG: &str = "v=19";
const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum PasswordError {
    #[error("password must not be empty")]
    EmptyPassword,
    #[error("stored password digest is malformed")]
    MalformedDigest,
    #[error("invalid argon2 parameters: {0}")]
    InvalidParams(String),
    #[error("password hashing failed: {0}")]
    Hashing(String),
}

/// Argon2id cost settings used for new digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 2,
        }
    }
}

impl PasswordParams {
    fn to_argon2(self, output_len: usize) -> Result<Params, argon2::Error> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(output_len),
        )
    }
}

#[derive(Debug, Clone)]
pub struct PasswordHasher {
    params: PasswordParams,
}

impl PasswordHasher {
    /// # Errors
    /// Returns `InvalidParams` if Argon2 rejects the cost settings.
    pub fn new(params: PasswordParams) -> Result<Self, PasswordError> {
        params
            .to_argon2(KEY_LEN)
            .map_err(|err| PasswordError::InvalidParams(err.to_string()))?;
        Ok(Self { params })
    }

    #[must_use]
    pub const fn params(&self) -> PasswordParams {
        self.params
    }

    /// Derive a new digest on the blocking pool.
    ///
    /// # Errors
    /// Returns `EmptyPassword` for an empty password and `Hashing` if key
    /// derivation or salt generation fails.
    pub async fn hash(&self, password: &str) -> Result<String, PasswordError> {
        if password.is_empty() {
            return Err(PasswordError::EmptyPassword);
        }
        let hasher = self.clone();
        let password = SecretString::from(password.to_owned());
        tokio::task::spawn_blocking(move || hasher.hash_blocking(password.expose_secret()))
            .await
            .map_err(|err| PasswordError::Hashing(err.to_string()))?
    }

    /// Check a password against a stored digest on the blocking pool.
    ///
    /// # Errors
    /// Returns `EmptyPassword` for an empty password and `MalformedDigest` if
    /// the digest cannot be parsed.
    pub async fn verify(&self, password: &str, digest: &str) -> Result<bool, PasswordError> {
        if password.is_empty() {
            return Err(PasswordError::EmptyPassword);
        }
        let password = SecretString::from(password.to_owned());
        let digest = digest.to_owned();
        tokio::task::spawn_blocking(move || verify_blocking(password.expose_secret(), &digest))
            .await
            .map_err(|err| PasswordError::Hashing(err.to_string()))?
    }

    /// Synchronous variant of [`PasswordHasher::hash`].
    ///
    /// # Errors
    /// See [`PasswordHasher::hash`].
    pub fn hash_blocking(&self, password: &str) -> Result<String, PasswordError> {
        if password.is_empty() {
            return Err(PasswordError::EmptyPassword);
        }

        let mut salt = [0u8; SALT_LEN];
        OsRng
            .try_fill_bytes(&mut salt)
            .map_err(|err| PasswordError::Hashing(err.to_string()))?;

        let params = self
            .params
            .to_argon2(KEY_LEN)
            .map_err(|err| PasswordError::InvalidParams(err.to_string()))?;
        let key = derive(password, &salt, params, KEY_LEN)
            .map_err(|err| PasswordError::Hashing(err.to_string()))?;

        Ok(format!(
            "${ALGORITHM_TAG}${VERSION_TAG}$m={},t={},p={}${}${}",
            self.params.memory_kib,
            self.params.iterations,
            self.params.parallelism,
            Base64Unpadded::encode_string(&salt),
            Base64Unpadded::encode_string(&key),
        ))
    }
}

/// Synchronous variant of [`PasswordHasher::verify`].
///
/// # Errors
/// See [`PasswordHasher::verify`].
pub fn verify_blocking(password: &str, digest: &str) -> Result<bool, PasswordError> {
    if password.is_empty() {
        return Err(PasswordError::EmptyPassword);
    }
    let parsed = ParsedDigest::parse(digest)?;
    let argon_params = parsed
        .params
        .to_argon2(parsed.key.len())
        .map_err(|_| PasswordError::MalformedDigest)?;
    let candidate = derive(password, &parsed.salt, argon_params, parsed.key.len())
        .map_err(|_| PasswordError::MalformedDigest)?;

    Ok(bool::from(candidate.ct_eq(&parsed.key)))
}

fn derive(
    password: &str,
    salt: &[u8],
    params: Params,
    key_len: usize,
) -> Result<Vec<u8>, argon2::Error> {
    let mut key = vec![0u8; key_len];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params).hash_password_into(
        password.as_bytes(),
        salt,
        &mut key,
    )?;
    Ok(key)
}

#[derive(Debug)]
struct ParsedDigest {
    params: PasswordParams,
    salt: Vec<u8>,
    key: Vec<u8>,
}

impl ParsedDigest {
    fn parse(digest: &str) -> Result<Self, PasswordError> {
        let fields: Vec<&str> = digest.split('$').collect();
        let [leading, algorithm, version, params, salt, key] = fields.as_slice() else {
            return Err(PasswordError::MalformedDigest);
        };
        if !leading.is_empty() || *algorithm != ALGORITHM_TAG || *version != VERSION_TAG {
            return Err(PasswordError::MalformedDigest);
        }

        let params = parse_params(params).ok_or(PasswordError::MalformedDigest)?;
        let salt = Base64Unpadded::decode_vec(salt).map_err(|_| PasswordError::MalformedDigest)?;
        let key = Base64Unpadded::decode_vec(key).map_err(|_| PasswordError::MalformedDigest)?;
        if salt.is_empty() || key.is_empty() {
            return Err(PasswordError::MalformedDigest);
        }

        Ok(Self { params, salt, key })
    }
}

/// Parse `m=<u32>,t=<u32>,p=<u32>` in exactly that order.
fn parse_params(field: &str) -> Option<PasswordParams> {
    let mut parts = field.split(',');
    let mut next = |name: &str| -> Option<u32> {
        let (label, value) = parts.next()?.split_once('=')?;
        if label != name || value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        value.parse().ok()
    };

    let memory_kib = next("m")?;
    let iterations = next("t")?;
    let parallelism = next("p")?;
    if parts.next().is_some() {
        return None;
    }

    Some(PasswordParams {
        memory_kib,
        iterations,
        parallelism,
    })
}
