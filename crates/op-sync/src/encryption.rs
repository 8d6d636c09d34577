//! End-to-end encryption of operation payloads
//!
//! Payloads are sealed with AES-256-GCM under a key derived from the user's
//! password with Argon2id. The encoded ciphertext is
//! `base64(salt || nonce || ciphertext)`. One salt (and so one key derivation)
//! is used per batch; each payload still gets its own nonce.

use crate::provider::SyncOperation;

use sp_op_log::Operation;

use std::collections::HashMap;

use aes_gcm::{
	aead::{Aead, KeyInit},
	Aes256Gcm, Key, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::{rngs::OsRng, RngCore};
use serde_json::Value;
use thiserror::Error;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum EncryptionError {
	#[error("failed to derive encryption key")]
	KeyDerivation,
	#[error("failed to encrypt payload")]
	Encrypt,
	#[error("failed to decrypt payload, wrong password or corrupted data")]
	Decrypt,
	#[error("ciphertext is not valid base64: {0}")]
	Encoding(#[from] base64::DecodeError),
	#[error("ciphertext is too short")]
	Truncated,
	#[error("encrypted payload is not a string")]
	NotAString,
	#[error("decrypted payload is not valid JSON: {0}")]
	Json(#[from] serde_json::Error),
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], EncryptionError> {
	let mut key = [0u8; KEY_LEN];
	Argon2::default()
		.hash_password_into(password.as_bytes(), salt, &mut key)
		.map_err(|_| EncryptionError::KeyDerivation)?;
	Ok(key)
}

/// Cipher bound to one password
#[derive(Clone)]
pub struct PayloadCipher {
	password: String,
}

impl std::fmt::Debug for PayloadCipher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PayloadCipher").finish_non_exhaustive()
	}
}

impl PayloadCipher {
	#[must_use]
	pub fn new(password: impl Into<String>) -> Self {
		Self {
			password: password.into(),
		}
	}

	/// Encrypts a single value with a fresh salt
	pub fn encrypt_value(&self, value: &Value) -> Result<String, EncryptionError> {
		self.batch()?.seal(value)
	}

	pub fn decrypt_value(&self, encoded: &str) -> Result<Value, EncryptionError> {
		Opener::new(&self.password).open(encoded)
	}

	/// Replaces every payload with its ciphertext
	pub fn encrypt_ops(&self, ops: &mut [SyncOperation]) -> Result<(), EncryptionError> {
		let batch = self.batch()?;
		for op in ops.iter_mut().filter(|op| !op.is_payload_encrypted) {
			op.payload = Value::String(batch.seal(&op.payload)?);
			op.is_payload_encrypted = true;
		}
		Ok(())
	}

	/// Decrypts every encrypted payload in place
	pub fn decrypt_ops<'a>(
		&self,
		ops: impl IntoIterator<Item = &'a mut SyncOperation>,
	) -> Result<(), EncryptionError> {
		let mut opener = Opener::new(&self.password);
		for op in ops.into_iter().filter(|op| op.is_payload_encrypted) {
			let encoded = op.payload.as_str().ok_or(EncryptionError::NotAString)?;
			op.payload = opener.open(encoded)?;
			op.is_payload_encrypted = false;
		}
		Ok(())
	}

	fn batch(&self) -> Result<SealingBatch, EncryptionError> {
		let mut salt = [0u8; SALT_LEN];
		OsRng.fill_bytes(&mut salt);
		let key = derive_key(&self.password, &salt)?;

		Ok(SealingBatch {
			salt,
			cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
		})
	}
}

/// Turns received wire operations back into log operations, decrypting
/// payloads on the way.
///
/// Fails with [`crate::Error::EncryptionPasswordRequired`] when an encrypted
/// payload arrives and no password is configured.
pub fn open_sync_ops(
	mut ops: Vec<SyncOperation>,
	cipher: Option<&PayloadCipher>,
) -> crate::Result<Vec<Operation>> {
	if ops.iter().any(|op| op.is_payload_encrypted) {
		cipher
			.ok_or(crate::Error::EncryptionPasswordRequired)?
			.decrypt_ops(ops.iter_mut())?;
	}

	ops.into_iter()
		.map(|op| Operation::try_from(op).map_err(Into::into))
		.collect()
}

struct SealingBatch {
	salt: [u8; SALT_LEN],
	cipher: Aes256Gcm,
}

impl SealingBatch {
	fn seal(&self, value: &Value) -> Result<String, EncryptionError> {
		let mut nonce = [0u8; NONCE_LEN];
		OsRng.fill_bytes(&mut nonce);

		let plaintext = serde_json::to_vec(value)?;
		let ciphertext = self
			.cipher
			.encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
			.map_err(|_| EncryptionError::Encrypt)?;

		let mut sealed = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
		sealed.extend_from_slice(&self.salt);
		sealed.extend_from_slice(&nonce);
		sealed.extend_from_slice(&ciphertext);

		Ok(STANDARD.encode(sealed))
	}
}

/// Decrypts payloads, deriving each distinct salt's key only once
struct Opener<'a> {
	password: &'a str,
	keys: HashMap<[u8; SALT_LEN], Aes256Gcm>,
}

impl<'a> Opener<'a> {
	fn new(password: &'a str) -> Self {
		Self {
			password,
			keys: HashMap::new(),
		}
	}

	fn open(&mut self, encoded: &str) -> Result<Value, EncryptionError> {
		let sealed = STANDARD.decode(encoded)?;
		if sealed.len() <= SALT_LEN + NONCE_LEN {
			return Err(EncryptionError::Truncated);
		}

		let (salt, rest) = sealed.split_at(SALT_LEN);
		let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

		let mut salt_key = [0u8; SALT_LEN];
		salt_key.copy_from_slice(salt);

		let cipher = match self.keys.entry(salt_key) {
			std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
			std::collections::hash_map::Entry::Vacant(entry) => {
				let key = derive_key(self.password, salt)?;
				entry.insert(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)))
			}
		};

		let plaintext = cipher
			.decrypt(Nonce::from_slice(nonce), ciphertext)
			.map_err(|_| EncryptionError::Decrypt)?;

		Ok(serde_json::from_slice(&plaintext)?)
	}
}
