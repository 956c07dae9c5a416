use async_trait::async_trait;
use chacha20poly1305::{
	ChaCha20Poly1305, KeyInit as _,
	aead::{Aead as _, Payload},
};
use parking_lot::RwLock;
use rand::{RngCore, rng};
use std::collections::HashMap;

use super::{
	EncryptionContext, Error, Key, KeyFingerprint, KeyUnavailableReason, MasterKeyId, generate_key,
	kdf, key_id::fingerprint, wire,
};

/// A freshly generated data key, in both its usable and its storable form.
#[derive(Debug)]
pub struct GeneratedDataKey {
	/// The key to encrypt with.  Drop it as soon as the encryption is done.
	pub plaintext: Key,
	/// The same key, wrapped by the master key.  Opaque, and safe to store.
	pub wrapped: Vec<u8>,
}

/// The boundary to an external key-escrow service.
///
/// Implementations talk to whatever actually holds the master keys (a cloud KMS, an HSM, or
/// the in-process [`LocalKeyService`]).  The encryption context is bound to each wrapped key,
/// and must be echoed back exactly to unwrap it.
///
/// Implementations must not cache plaintext data keys.
#[async_trait]
pub trait KeyService: Send + Sync {
	/// Ask for a new data key, wrapped under the master key `master_key_id`.
	///
	/// # Errors
	///
	/// [`Error::KeyUnavailable`] if the master key is unknown or the caller is not allowed
	/// to use it, or if the service can't be reached.
	async fn generate_data_key(
		&self,
		master_key_id: &MasterKeyId,
		context: &EncryptionContext,
	) -> Result<GeneratedDataKey, Error>;

	/// Recover the plaintext form of a wrapped data key.
	///
	/// # Errors
	///
	/// [`Error::KeyUnavailable`] with [`KeyUnavailableReason::ContextMismatch`] if `context`
	/// is not the context the key was generated under, [`KeyUnavailableReason::Denied`] if the
	/// master key is unknown or revoked, and a retryable reason for transient failures.
	async fn unwrap_data_key(
		&self,
		wrapped: &[u8],
		context: &EncryptionContext,
	) -> Result<Key, Error>;
}

/// An in-process [`KeyService`], for development setups and tests.
///
/// Each named master key has a current version, used to wrap new data keys, and any number of
/// retired versions, which can still unwrap data keys they wrapped.  Calling
/// [`rotate_master_key`](Self::rotate_master_key) retires the current version and creates a
/// new one; calling [`revoke_master_key`](Self::revoke_master_key) throws away every version,
/// after which nothing it wrapped can be recovered.
///
/// # Example
///
/// ```rust
/// use phi_vault::{EncryptionContext, KeyService, LocalKeyService, MasterKeyId};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), phi_vault::Error> {
///
/// let kms = LocalKeyService::new();
/// let master = MasterKeyId::from("alias/phi");
/// kms.add_master_key(master.clone(), phi_vault::generate_key())?;
///
/// let ctx = EncryptionContext::for_clinic("c1");
/// let dk = kms.generate_data_key(&master, &ctx).await?;
///
/// let unwrapped = kms.unwrap_data_key(&dk.wrapped, &ctx).await?;
/// assert_eq!(dk.plaintext.expose_secret(), unwrapped.expose_secret());
///
/// // Same wrapped key, different clinic: no dice
/// let other = EncryptionContext::for_clinic("c2");
/// assert!(kms.unwrap_data_key(&dk.wrapped, &other).await.is_err());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct LocalKeyService {
	master_keys: RwLock<MasterKeys>,
}

#[derive(Debug, Default)]
struct MasterKeys {
	current: HashMap<MasterKeyId, KeyFingerprint>,
	versions: HashMap<KeyFingerprint, (MasterKeyId, Key)>,
}

impl LocalKeyService {
	pub fn new() -> Self {
		Self::default()
	}

	/// Install `key` as the current version of the master key `id`.
	///
	/// If `id` already has a current version, it is retired rather than forgotten.
	#[tracing::instrument(level = "debug", skip(self, key))]
	pub fn add_master_key(&self, id: MasterKeyId, key: Key) -> Result<KeyFingerprint, Error> {
		let fp = fingerprint(&key)?;
		let mut keys = self.master_keys.write();

		tracing::debug!(%id, fingerprint=%fp, "Installing master key");
		keys.versions.insert(fp, (id.clone(), key));
		keys.current.insert(id, fp);

		Ok(fp)
	}

	/// Make a new current version for the master key `id`, keeping the old one for unwrapping.
	#[tracing::instrument(level = "debug", skip(self))]
	pub fn rotate_master_key(&self, id: &MasterKeyId) -> Result<KeyFingerprint, Error> {
		if !self.master_keys.read().current.contains_key(id) {
			return Err(Error::key_unavailable(id.as_str(), KeyUnavailableReason::Denied));
		}

		self.add_master_key(id.clone(), generate_key())
	}

	/// Forget every version of the master key `id`.
	#[tracing::instrument(level = "debug", skip(self))]
	pub fn revoke_master_key(&self, id: &MasterKeyId) {
		let mut keys = self.master_keys.write();

		keys.current.remove(id);
		keys.versions.retain(|fp, (owner, _)| {
			if owner == id {
				tracing::debug!(%id, fingerprint=%fp, "Revoking master key version");
				false
			} else {
				true
			}
		});
	}

	fn wrapping_cipher(master: &Key, fp: &KeyFingerprint) -> Result<ChaCha20Poly1305, Error> {
		let mut info = b"wrap::".to_vec();
		info.extend_from_slice(fp.as_bytes());

		let wrapping_key = kdf::derive_key(master, &info)?;
		Ok(ChaCha20Poly1305::new(wrapping_key.expose_secret().into()))
	}
}

fn wrapping_aad(ctx: &[u8], fp: &KeyFingerprint, nonce: &[u8; 12]) -> Vec<u8> {
	let mut aad = Vec::<u8>::new();
	aad.extend_from_slice(ctx);
	aad.extend_from_slice(fp.as_bytes());
	aad.extend_from_slice(nonce);
	aad
}

#[async_trait]
impl KeyService for LocalKeyService {
	#[tracing::instrument(level = "debug", skip(self, context))]
	async fn generate_data_key(
		&self,
		master_key_id: &MasterKeyId,
		context: &EncryptionContext,
	) -> Result<GeneratedDataKey, Error> {
		let ctx = context.canonical_bytes()?;

		let keys = self.master_keys.read();
		let Some((fp, master)) = keys
			.current
			.get(master_key_id)
			.and_then(|fp| keys.versions.get(fp).map(|(_, k)| (*fp, k)))
		else {
			tracing::debug!(%master_key_id, "No such master key");
			return Err(Error::key_unavailable(
				master_key_id.as_str(),
				KeyUnavailableReason::Denied,
			));
		};

		let cipher = Self::wrapping_cipher(master, &fp)?;
		drop(keys);

		let data_key = generate_key();
		let mut nonce = [0u8; 12];
		rng().fill_bytes(&mut nonce);

		let sealed = cipher
			.encrypt(
				(&nonce).into(),
				Payload {
					msg: data_key.expose_secret(),
					aad: &wrapping_aad(&ctx, &fp, &nonce),
				},
			)
			.map_err(|_| Error::encryption(Vec::<String>::new()))?;
		tracing::debug!(fingerprint=%fp, "Wrapped new data key");

		Ok(GeneratedDataKey {
			plaintext: data_key,
			wrapped: WrappedKey::new(fp, nonce, sealed).to_bytes()?,
		})
	}

	#[tracing::instrument(level = "debug", skip(self, wrapped, context))]
	async fn unwrap_data_key(
		&self,
		wrapped: &[u8],
		context: &EncryptionContext,
	) -> Result<Key, Error> {
		let wrapped = WrappedKey::try_from(wrapped)?;
		let ctx = context.canonical_bytes()?;

		let keys = self.master_keys.read();
		let Some((owner, master)) = keys.versions.get(&wrapped.fingerprint) else {
			tracing::debug!(fingerprint=%wrapped.fingerprint, "Master key version not found");
			return Err(Error::key_unavailable(
				wrapped.fingerprint.to_string(),
				KeyUnavailableReason::Denied,
			));
		};
		let owner = owner.clone();
		let cipher = Self::wrapping_cipher(master, &wrapped.fingerprint)?;
		drop(keys);

		let mut plaintext = cipher
			.decrypt(
				(&wrapped.nonce).into(),
				Payload {
					msg: &wrapped.sealed,
					aad: &wrapping_aad(&ctx, &wrapped.fingerprint, &wrapped.nonce),
				},
			)
			.map_err(|_| {
				tracing::debug!(master_key_id=%owner, "Unwrap rejected");
				Error::key_unavailable(owner.as_str(), KeyUnavailableReason::ContextMismatch)
			})?;

		let key = Key::try_from(&plaintext[..]);
		secrecy::zeroize::Zeroize::zeroize(&mut plaintext);

		key
	}
}

// This makes more sense in base64
const WRAPPED_KEY_MAGIC: [u8; 3] = [0xc2, 0xba, 0x5a];

/// The storable form of a data key wrapped by a [`LocalKeyService`].
#[derive(Clone, Debug)]
struct WrappedKey {
	fingerprint: KeyFingerprint,
	nonce: [u8; 12],
	sealed: Vec<u8>,
}

impl WrappedKey {
	fn new(fingerprint: KeyFingerprint, nonce: [u8; 12], sealed: Vec<u8>) -> Self {
		Self {
			fingerprint,
			nonce,
			sealed,
		}
	}

	fn to_bytes(&self) -> Result<Vec<u8>, Error> {
		use ciborium_ll::{Encoder, Header};

		let mut v: Vec<u8> = Vec::new();

		v.extend_from_slice(&WRAPPED_KEY_MAGIC);

		let mut enc = Encoder::from(&mut v);
		enc.push(Header::Array(Some(3)))
			.map_err(|e| Error::encoding("array", e))?;
		self.fingerprint.encode(&mut enc)?;
		enc.bytes(&self.nonce, None)
			.map_err(|e| Error::encoding("nonce", e))?;
		enc.bytes(&self.sealed, None)
			.map_err(|e| Error::encoding("sealed key", e))?;

		Ok(v)
	}
}

impl TryFrom<&[u8]> for WrappedKey {
	type Error = Error;

	fn try_from(b: &[u8]) -> Result<Self, Self::Error> {
		let mut dec = wire::open(b, &WRAPPED_KEY_MAGIC, 3, 37)?;

		let fingerprint = KeyFingerprint::decode(&mut dec)?;
		let nonce = wire::read_array::<12>(&mut dec, "nonce")?;
		let sealed = wire::read_bytes(&mut dec, "sealed key")?;

		wire::finish(dec, b.len())?;

		Ok(Self {
			fingerprint,
			nonce,
			sealed,
		})
	}
}
