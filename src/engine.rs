use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};

use super::{
	AuditHasher, BatchCoordinator, DecryptReport, EncryptedField, EncryptionContext,
	EngineConfig, EnvelopeCipher, Error, FieldInput, KeyService, Purpose, SearchTokenizer, audit,
	envelope,
};

/// The one place the application goes to protect, recover, search and audit PHI.
///
/// A `PhiEngine` is built once, at the application's composition root, from a
/// [`KeyService`] and an [`EngineConfig`], and then shared (it's cheap to clone).  It holds no
/// mutable state and no key material of its own.
///
/// # Example
///
/// ```rust
/// use phi_vault::{EncryptionContext, EngineConfig, Error, LocalKeyService, PhiEngine};
/// use std::sync::Arc;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Error> {
///
/// let kms = Arc::new(LocalKeyService::new());
/// kms.add_master_key("alias/phi".into(), phi_vault::generate_key())?;
///
/// let engine = PhiEngine::new(kms, EngineConfig::new("alias/phi"))?;
///
/// let c1 = EncryptionContext::for_clinic("c1");
/// let phone = engine.encrypt_phi("555-0100", &c1).await?;
/// assert_eq!("555-0100", engine.decrypt_phi(&phone).await?);
///
/// // Moving the ciphertext to another clinic's record doesn't get you anywhere
/// let mut moved = phone.clone();
/// moved.context = EncryptionContext::for_clinic("c2");
/// assert!(matches!(engine.decrypt_phi(&moved).await, Err(Error::Decryption)));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PhiEngine {
	cipher: EnvelopeCipher,
	batch: BatchCoordinator,
	search: SearchTokenizer,
}

impl PhiEngine {
	/// # Errors
	///
	/// [`Error::Config`] if `config` doesn't [`validate`](EngineConfig::validate).
	#[tracing::instrument(level = "debug", skip(key_service))]
	pub fn new(key_service: Arc<dyn KeyService>, config: EngineConfig) -> Result<Self, Error> {
		config.validate()?;

		let cipher = EnvelopeCipher::new(
			key_service,
			config.master_key_id,
			config.key_service_timeout,
		);

		Ok(Self {
			batch: BatchCoordinator::new(cipher.clone()),
			search: SearchTokenizer::new(cipher.clone()),
			cipher,
		})
	}

	/// Encrypt a single PHI value.  See [`EnvelopeCipher::encrypt_field`].
	///
	/// The stored context is `context` with its purpose set to `PHI`.
	pub async fn encrypt_phi(
		&self,
		plaintext: &str,
		context: &EncryptionContext,
	) -> Result<EncryptedField, Error> {
		self.cipher
			.encrypt_field(plaintext, &context.clone().with_purpose(Purpose::Phi))
			.await
	}

	/// Decrypt a single PHI value.  See [`EnvelopeCipher::decrypt_field`].
	///
	/// # Errors
	///
	/// [`Error::InvalidInput`] if `field` is a search index, and otherwise whatever
	/// [`EnvelopeCipher::decrypt_field`] reports.
	pub async fn decrypt_phi(&self, field: &EncryptedField) -> Result<String, Error> {
		envelope::ensure_phi(field)?;
		self.cipher.decrypt_field(field).await
	}

	/// Encrypt a value again, under a fresh data key from the *current* master key.
	///
	/// This is how values get moved off a retired master key after a rotation.  The result
	/// has the same context as `field`; `field` itself is left alone, and can be deleted once
	/// the new value has been stored.
	#[tracing::instrument(level = "debug", skip(self, field), fields(from = %field.key_id))]
	pub async fn reencrypt_phi(&self, field: &EncryptedField) -> Result<EncryptedField, Error> {
		let plaintext = self.decrypt_phi(field).await?;
		let fresh = self.cipher.encrypt_field(&plaintext, &field.context).await?;
		tracing::debug!(to = %fresh.key_id, "Re-encrypted field");
		Ok(fresh)
	}

	/// See [`BatchCoordinator::encrypt_batch`].
	pub async fn encrypt_batch(
		&self,
		fields: Vec<FieldInput>,
	) -> Result<BTreeMap<String, EncryptedField>, Error> {
		self.batch.encrypt_batch(fields).await
	}

	/// See [`BatchCoordinator::decrypt_batch`].
	pub async fn decrypt_batch(
		&self,
		fields: &BTreeMap<String, EncryptedField>,
	) -> BTreeMap<String, String> {
		self.batch.decrypt_batch(fields).await
	}

	/// See [`BatchCoordinator::decrypt_batch_report`].
	pub async fn decrypt_batch_report(
		&self,
		fields: &BTreeMap<String, EncryptedField>,
	) -> DecryptReport {
		self.batch.decrypt_batch_report(fields).await
	}

	/// Build the encrypted search index for a value.  See [`SearchTokenizer::search_index`].
	pub async fn generate_search_tokens(
		&self,
		plaintext: &str,
		salt: &str,
		context: &EncryptionContext,
	) -> Result<EncryptedField, Error> {
		self.search.search_index(plaintext, salt, context).await
	}

	/// Check a query against an encrypted search index.  See [`SearchTokenizer::matches`].
	pub async fn search_matches(
		&self,
		index: &EncryptedField,
		salt: &str,
		query: &str,
	) -> Result<bool, Error> {
		self.search.matches(index, salt, query).await
	}

	/// See [`index_hash`](crate::index_hash).
	pub fn hash_for_index(&self, data: &str, salt: &str) -> Result<String, Error> {
		audit::index_hash(data, salt)
	}

	/// See [`AuditHasher::hash`].
	pub fn create_audit_hash(&self, record: &impl Serialize) -> Result<String, Error> {
		AuditHasher::hash(record)
	}

	/// Check a record against its audit hash.
	///
	/// A mismatch is logged as a warning, as it means the record was changed somewhere other
	/// than through this engine.
	pub fn verify_audit_hash(&self, record: &impl Serialize, expected: &str) -> Result<bool, Error> {
		let ok = AuditHasher::verify(record, expected)?;

		if !ok {
			tracing::warn!("Audit hash mismatch");
		}

		Ok(ok)
	}

	/// Like [`verify_audit_hash`](Self::verify_audit_hash), but a mismatch is an
	/// [`Error::AuditMismatch`].
	pub fn ensure_audit_hash(&self, record: &impl Serialize, expected: &str) -> Result<(), Error> {
		if self.verify_audit_hash(record, expected)? {
			Ok(())
		} else {
			Err(Error::AuditMismatch)
		}
	}
}
