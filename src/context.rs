use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Error;

/// The context key that records what an encrypted value is for.
pub const PURPOSE_KEY: &str = "purpose";

/// What an encrypted value is used for.
///
/// The purpose is part of the [`EncryptionContext`], so a ciphertext produced for one purpose
/// (say, a search index) can't be passed off as another (say, a patient's phone number).
/// [`PhiEngine`](crate::PhiEngine) stamps `PHI` on everything it encrypts as a value, and
/// refuses to decrypt a `SEARCH_TOKENS` field as one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purpose {
	Phi,
	SearchTokens,
}

impl Purpose {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Phi => "PHI",
			Self::SearchTokens => "SEARCH_TOKENS",
		}
	}
}

/// Caller-supplied metadata that binds a ciphertext to its intended use.
///
/// Typical entries are the tenant (clinic) the record belongs to, the record type and the
/// field name.  Exactly the same context must be supplied to decrypt as was supplied to
/// encrypt; any difference makes decryption fail.
///
/// Entries are kept sorted, so two contexts built in a different order are still equal and
/// produce the same [`canonical_bytes`](Self::canonical_bytes).
///
/// ```rust
/// use phi_vault::{EncryptionContext, Purpose};
///
/// let a = EncryptionContext::new().with("clinicId", "c1").with("field", "phone");
/// let b = EncryptionContext::new().with("field", "phone").with("clinicId", "c1");
/// assert_eq!(a, b);
///
/// let search = a.with_purpose(Purpose::SearchTokens);
/// assert_eq!(Some("SEARCH_TOKENS"), search.get("purpose"));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptionContext(BTreeMap<String, String>);

impl EncryptionContext {
	pub fn new() -> Self {
		Self::default()
	}

	/// Shorthand for the common case of a context scoped to one clinic.
	pub fn for_clinic(clinic_id: impl Into<String>) -> Self {
		Self::new().with("clinicId", clinic_id)
	}

	pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.0.insert(key.into(), value.into());
		self
	}

	pub fn with_purpose(self, purpose: Purpose) -> Self {
		self.with(PURPOSE_KEY, purpose.as_str())
	}

	pub fn get(&self, key: &str) -> Option<&str> {
		self.0.get(key).map(String::as_str)
	}

	pub fn purpose(&self) -> Option<&str> {
		self.get(PURPOSE_KEY)
	}

	pub fn has_purpose(&self, purpose: Purpose) -> bool {
		self.purpose() == Some(purpose.as_str())
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
	}

	/// The byte string used as associated data and as the key-service binding.
	///
	/// This is the CBOR encoding of the sorted map, so it is unambiguous: no choice of keys or
	/// values can make two different contexts encode identically.
	pub fn canonical_bytes(&self) -> Result<Vec<u8>, Error> {
		let mut v = Vec::new();
		ciborium::into_writer(&self.0, &mut v)
			.map_err(|e| Error::serialization(format!("encryption context: {e:?}")))?;
		Ok(v)
	}
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EncryptionContext {
	fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
		Self(
			iter.into_iter()
				.map(|(k, v)| (k.into(), v.into()))
				.collect(),
		)
	}
}
