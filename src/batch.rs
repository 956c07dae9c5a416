use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};

use super::{
	EncryptedField, EncryptionContext, EnvelopeCipher, Error, Purpose, envelope::ensure_phi,
};

/// The value a field that couldn't be decrypted gets in a batch decryption result.
pub const DECRYPTION_FAILED: &str = "[DECRYPTION_FAILED]";

/// One named value to encrypt as part of a batch.
#[derive(Clone, Debug)]
pub struct FieldInput {
	pub key: String,
	pub value: String,
	pub context: EncryptionContext,
}

impl FieldInput {
	pub fn new(
		key: impl Into<String>,
		value: impl Into<String>,
		context: EncryptionContext,
	) -> Self {
		Self {
			key: key.into(),
			value: value.into(),
			context,
		}
	}
}

/// The result of a fail-soft batch decryption, with the fields that didn't make it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecryptReport {
	/// Every requested field; failed ones hold [`DECRYPTION_FAILED`].
	pub values: BTreeMap<String, String>,
	/// The names of the fields that could not be decrypted, in sorted order.
	pub failed: Vec<String>,
}

impl DecryptReport {
	pub fn is_complete(&self) -> bool {
		self.failed.is_empty()
	}
}

/// Encrypts and decrypts whole records, one field at a time, all at once.
///
/// Every field in a batch is encrypted or decrypted concurrently, since each one is
/// independent and the time is almost entirely spent waiting on the key service.  No order
/// between fields is guaranteed.
///
/// Failures are handled differently in each direction:
///
/// * Encryption is all-or-nothing.  If any field fails, the whole batch fails with an
///   [`Error::Encryption`] naming every field that failed, and no encrypted fields are
///   returned.
///
/// * Decryption is best-effort.  A field that fails reads as [`DECRYPTION_FAILED`], and
///   the rest of the record is returned as normal, so that one unreadable field doesn't make
///   a whole clinical record unreadable.  Each failure is logged (by field name and error
///   class, never by value) so that widespread key service trouble gets noticed.
///
/// Every field is encrypted with the purpose `PHI` added to its context, and a search index
/// handed in for decryption counts as a failed field.
#[derive(Clone, Debug)]
pub struct BatchCoordinator {
	cipher: EnvelopeCipher,
}

impl BatchCoordinator {
	pub fn new(cipher: EnvelopeCipher) -> Self {
		Self { cipher }
	}

	/// Encrypt every field, or none of them.
	///
	/// # Errors
	///
	/// * [`Error::InvalidInput`] if two fields share a key.
	/// * [`Error::Encryption`] naming every field that could not be encrypted.
	#[tracing::instrument(level = "debug", skip(self, fields), fields(count = fields.len()))]
	pub async fn encrypt_batch(
		&self,
		fields: Vec<FieldInput>,
	) -> Result<BTreeMap<String, EncryptedField>, Error> {
		let mut seen = BTreeSet::new();
		for f in &fields {
			if !seen.insert(f.key.as_str()) {
				return Err(Error::invalid_input(format!("duplicate field {}", f.key)));
			}
		}

		// Every request runs to completion so all failures can be named
		let results = join_all(fields.iter().map(|f| async move {
			(
				f.key.as_str(),
				self.cipher
					.encrypt_field(&f.value, &f.context.clone().with_purpose(Purpose::Phi))
					.await,
			)
		}))
		.await;

		let mut encrypted = BTreeMap::new();
		let mut failed = Vec::new();

		for (key, result) in results {
			match result {
				Ok(field) => {
					encrypted.insert(key.to_string(), field);
				}
				Err(e) => {
					tracing::warn!(
						field = key,
						error_class = e.class(),
						"Field encryption failed"
					);
					failed.push(key.to_string());
				}
			}
		}

		if failed.is_empty() {
			Ok(encrypted)
		} else {
			failed.sort();
			Err(Error::encryption(failed))
		}
	}

	/// Decrypt every field that can be decrypted.
	#[tracing::instrument(level = "debug", skip(self, fields), fields(count = fields.len()))]
	pub async fn decrypt_batch(
		&self,
		fields: &BTreeMap<String, EncryptedField>,
	) -> BTreeMap<String, String> {
		self.decrypt_batch_report(fields).await.values
	}

	/// Decrypt every field that can be decrypted, and say which ones couldn't.
	#[tracing::instrument(level = "debug", skip(self, fields), fields(count = fields.len()))]
	pub async fn decrypt_batch_report(
		&self,
		fields: &BTreeMap<String, EncryptedField>,
	) -> DecryptReport {
		let results = join_all(
			fields
				.iter()
				.map(|(key, field)| async move { (key, self.decrypt_one(field).await) }),
		)
		.await;

		let mut report = DecryptReport::default();

		for (key, result) in results {
			let value = match result {
				Ok(plaintext) => plaintext,
				Err(e) => {
					tracing::warn!(
						field = key.as_str(),
						key_id = %fields[key].key_id,
						error_class = e.class(),
						retryable = e.is_retryable(),
						"Field decryption failed"
					);
					report.failed.push(key.clone());
					DECRYPTION_FAILED.to_string()
				}
			};
			report.values.insert(key.clone(), value);
		}

		// Input is a BTreeMap, so this is already sorted
		if !report.failed.is_empty() {
			tracing::warn!(
				failed = report.failed.len(),
				total = fields.len(),
				"Batch decryption was incomplete"
			);
		}

		report
	}

	async fn decrypt_one(&self, field: &EncryptedField) -> Result<String, Error> {
		ensure_phi(field)?;
		self.cipher.decrypt_field(field).await
	}
}
