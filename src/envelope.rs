use chacha20poly1305::{
	ChaCha20Poly1305, KeyInit as _,
	aead::{AeadInPlace as _, Tag},
};
use rand::{RngCore, rng};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, sync::Arc, time::Duration};

use super::{
	EncryptionContext, Error, Key, KeyService, KeyUnavailableReason, MasterKeyId, Purpose, wire,
};

/// One protected value, in the form it is persisted.
///
/// The `ciphertext` is an opaque, self-describing blob holding the wrapped data key, the
/// nonce, the authentication tag and the encrypted payload.  The `key_id` says which master key
/// wrapped the data key, and the `context` is the exact context the value was encrypted under
/// (it is not secret, but it *is* required to decrypt).
///
/// Encrypted fields are never modified in place: a new value, or a new master key, means a new
/// `EncryptedField`.
///
/// On the wire (that is, in the document store) the ciphertext is base64:
///
/// ```json
/// { "ciphertext": "wv8hhA...", "keyId": "alias/phi", "context": { "clinicId": "c1" } }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedField {
	#[serde(with = "base64_bytes")]
	pub ciphertext: Vec<u8>,
	pub key_id: MasterKeyId,
	pub context: EncryptionContext,
}

mod base64_bytes {
	use base64::{Engine as _, engine::general_purpose::STANDARD};
	use serde::{Deserialize as _, Deserializer, Serializer};

	pub(super) fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
		s.serialize_str(&STANDARD.encode(v))
	}

	pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
		let s = String::deserialize(d)?;
		STANDARD.decode(s).map_err(serde::de::Error::custom)
	}
}

/// Encrypts and decrypts individual fields using envelope encryption.
///
/// Every call to [`encrypt_field`](Self::encrypt_field) gets a brand-new data key from the
/// [`KeyService`], encrypts the value with ChaCha20-Poly1305 under that key, and then throws
/// the plaintext key away, keeping only the wrapped form.  Decryption asks the key service to
/// unwrap the data key again, which it will only do if given the same encryption context.
///
/// The context is *also* used as associated data for the field encryption itself, so even a
/// key service that was careless about checking contexts couldn't be used to move a ciphertext
/// from one context to another.
#[derive(Clone)]
pub struct EnvelopeCipher {
	key_service: Arc<dyn KeyService>,
	master_key_id: MasterKeyId,
	timeout: Duration,
}

impl Debug for EnvelopeCipher {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EnvelopeCipher")
			.field("master_key_id", &self.master_key_id)
			.field("timeout", &self.timeout)
			.finish_non_exhaustive()
	}
}

impl EnvelopeCipher {
	pub fn new(
		key_service: Arc<dyn KeyService>,
		master_key_id: MasterKeyId,
		timeout: Duration,
	) -> Self {
		Self {
			key_service,
			master_key_id,
			timeout,
		}
	}

	pub fn master_key_id(&self) -> &MasterKeyId {
		&self.master_key_id
	}

	/// Encrypt `plaintext` under a fresh data key, bound to `context`.
	///
	/// # Errors
	///
	/// * [`Error::InvalidInput`] if `plaintext` is empty or only whitespace.
	/// * [`Error::KeyUnavailable`] if the key service timed out or couldn't be reached (these
	///   are worth retrying).
	/// * [`Error::Encryption`] for anything else, including the key service refusing to hand
	///   out a key.
	#[tracing::instrument(level = "debug", skip(self, plaintext))]
	pub async fn encrypt_field(
		&self,
		plaintext: &str,
		context: &EncryptionContext,
	) -> Result<EncryptedField, Error> {
		if plaintext.trim().is_empty() {
			return Err(Error::invalid_input("plaintext must not be blank"));
		}

		let data_key = self
			.with_timeout(
				&self.master_key_id,
				self.key_service
					.generate_data_key(&self.master_key_id, context),
			)
			.await
			.map_err(|e| {
				tracing::debug!(key_id=%self.master_key_id, error=%e, "Data key generation failed");
				if e.is_retryable() {
					e
				} else {
					Error::encryption(Vec::<String>::new())
				}
			})?;

		let mut nonce = [0u8; 12];
		rng().fill_bytes(&mut nonce);

		let aad = self.aad(context, &self.master_key_id, &nonce)?;
		let (tag, payload) = seal(&data_key.plaintext, &nonce, &aad, plaintext.as_bytes())?;
		// The plaintext key's job is done; its bytes get zeroed here
		drop(data_key.plaintext);
		tracing::debug!(key_id=%self.master_key_id, "Encrypted field");

		Ok(EncryptedField {
			ciphertext: Envelope::new(data_key.wrapped, nonce, tag, payload).to_bytes()?,
			key_id: self.master_key_id.clone(),
			context: context.clone(),
		})
	}

	/// Recover the plaintext of an [`EncryptedField`].
	///
	/// # Errors
	///
	/// * [`Error::Decryption`] if the key service refuses to unwrap the data key, which is what
	///   happens when the context doesn't match, or the master key has been revoked.
	/// * [`Error::KeyUnavailable`] if the key service timed out or couldn't be reached.
	/// * [`Error::Integrity`] if the ciphertext, tag or nonce has been tampered with, or the
	///   ciphertext isn't a well-formed envelope at all.
	#[tracing::instrument(level = "debug", skip(self, field), fields(key_id = %field.key_id))]
	pub async fn decrypt_field(&self, field: &EncryptedField) -> Result<String, Error> {
		let envelope = Envelope::try_from(&field.ciphertext[..]).map_err(|e| {
			tracing::debug!(key_id=%field.key_id, error=%e, "Malformed envelope");
			Error::Integrity
		})?;

		let data_key = self
			.with_timeout(
				&field.key_id,
				self.key_service
					.unwrap_data_key(&envelope.wrapped_key, &field.context),
			)
			.await
			.map_err(|e| {
				tracing::debug!(key_id=%field.key_id, error=%e, "Data key unwrap failed");
				match e {
					e if e.is_retryable() => e,
					Error::KeyUnavailable { .. } => Error::Decryption,
					// The wrapped key itself was mangled
					Error::InvalidCiphertext(_) | Error::Decoding { .. } => Error::Integrity,
					e => e,
				}
			})?;

		let aad = self.aad(&field.context, &field.key_id, &envelope.nonce)?;
		let plaintext = open(
			&data_key,
			&envelope.nonce,
			&aad,
			&envelope.tag,
			envelope.payload,
		)?;
		drop(data_key);

		String::from_utf8(plaintext).map_err(|_| Error::Integrity)
	}

	async fn with_timeout<T>(
		&self,
		key_id: &MasterKeyId,
		fut: impl Future<Output = Result<T, Error>>,
	) -> Result<T, Error> {
		tokio::time::timeout(self.timeout, fut)
			.await
			.unwrap_or_else(|_| {
				tracing::warn!(
					%key_id,
					timeout=?self.timeout,
					"Key service call timed out"
				);
				Err(Error::key_unavailable(
					key_id.as_str(),
					KeyUnavailableReason::Timeout,
				))
			})
	}

	fn aad(
		&self,
		context: &EncryptionContext,
		key_id: &MasterKeyId,
		nonce: &[u8; 12],
	) -> Result<Vec<u8>, Error> {
		// The context encoding is self-delimiting and the nonce is fixed-width, so the key id
		// in between can't be confused with either
		let mut aad = context.canonical_bytes()?;
		aad.extend_from_slice(key_id.as_str().as_bytes());
		aad.extend_from_slice(nonce);
		Ok(aad)
	}
}

/// ChaCha20-Poly1305 with the tag split out from the ciphertext.
pub(crate) fn seal(
	key: &Key,
	nonce: &[u8; 12],
	aad: &[u8],
	plaintext: &[u8],
) -> Result<([u8; 16], Vec<u8>), Error> {
	let cipher = ChaCha20Poly1305::new(key.expose_secret().into());

	let mut buf = plaintext.to_vec();
	let tag = cipher
		.encrypt_in_place_detached(nonce.into(), aad, &mut buf)
		.map_err(|_| Error::encryption(Vec::<String>::new()))?;

	let mut tag_bytes = [0u8; 16];
	tag_bytes.copy_from_slice(&tag);

	Ok((tag_bytes, buf))
}

pub(crate) fn open(
	key: &Key,
	nonce: &[u8; 12],
	aad: &[u8],
	tag: &[u8; 16],
	mut payload: Vec<u8>,
) -> Result<Vec<u8>, Error> {
	let cipher = ChaCha20Poly1305::new(key.expose_secret().into());

	cipher
		.decrypt_in_place_detached(
			nonce.into(),
			aad,
			&mut payload,
			Tag::<ChaCha20Poly1305>::from_slice(tag),
		)
		.map_err(|_| Error::Integrity)?;

	Ok(payload)
}

/// Refuse to treat a search index as a PHI value.
pub(crate) fn ensure_phi(field: &EncryptedField) -> Result<(), Error> {
	if field.context.has_purpose(Purpose::SearchTokens) {
		return Err(Error::invalid_input("field is a search index, not a PHI value"));
	}

	Ok(())
}

// This makes more sense in base64
const ENVELOPE_MAGIC: [u8; 3] = [0xc2, 0xff, 0x21];

#[derive(Clone, Debug)]
struct Envelope {
	wrapped_key: Vec<u8>,
	nonce: [u8; 12],
	tag: [u8; 16],
	payload: Vec<u8>,
}

impl Envelope {
	fn new(wrapped_key: Vec<u8>, nonce: [u8; 12], tag: [u8; 16], payload: Vec<u8>) -> Self {
		Self {
			wrapped_key,
			nonce,
			tag,
			payload,
		}
	}

	fn to_bytes(&self) -> Result<Vec<u8>, Error> {
		use ciborium_ll::{Encoder, Header};

		let mut v: Vec<u8> = Vec::new();

		v.extend_from_slice(&ENVELOPE_MAGIC);

		let mut enc = Encoder::from(&mut v);
		enc.push(Header::Array(Some(4)))
			.map_err(|e| Error::encoding("array", e))?;
		enc.bytes(&self.wrapped_key, None)
			.map_err(|e| Error::encoding("wrapped key", e))?;
		enc.bytes(&self.nonce, None)
			.map_err(|e| Error::encoding("nonce", e))?;
		enc.bytes(&self.tag, None)
			.map_err(|e| Error::encoding("tag", e))?;
		enc.bytes(&self.payload, None)
			.map_err(|e| Error::encoding("payload", e))?;

		Ok(v)
	}
}

impl TryFrom<&[u8]> for Envelope {
	type Error = Error;

	fn try_from(b: &[u8]) -> Result<Self, Self::Error> {
		let mut dec = wire::open(b, &ENVELOPE_MAGIC, 4, 36)?;

		let wrapped_key = wire::read_bytes(&mut dec, "wrapped key")?;
		let nonce = wire::read_array::<12>(&mut dec, "nonce")?;
		let tag = wire::read_array::<16>(&mut dec, "tag")?;
		let payload = wire::read_bytes(&mut dec, "payload")?;

		wire::finish(dec, b.len())?;

		Ok(Self {
			wrapped_key,
			nonce,
			tag,
			payload,
		})
	}
}
