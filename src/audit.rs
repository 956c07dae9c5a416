//! Tamper evidence for stored records, and keyed hashes for deduplication.
use hmac::{Hmac, Mac as _};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};

use super::Error;

/// Computes and checks audit hashes: SHA-256 over a canonical JSON rendering of a record.
///
/// The canonical rendering sorts object keys at every level of nesting, so the same logical
/// record always hashes the same way, whatever order its fields were built in.
///
/// ```rust
/// use phi_vault::AuditHasher;
/// use serde_json::json;
///
/// let h = AuditHasher::hash(&json!({"a": 1, "b": 2})).unwrap();
/// assert!(AuditHasher::verify(&json!({"b": 2, "a": 1}), &h).unwrap());
/// assert!(!AuditHasher::verify(&json!({"a": 1, "b": 3}), &h).unwrap());
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct AuditHasher;

impl AuditHasher {
	/// Hash `record`, returning the digest as lowercase hex.
	///
	/// # Errors
	///
	/// [`Error::Serialization`] if `record` can't be represented as JSON (a map with
	/// non-string keys, say).
	#[tracing::instrument(level = "trace", skip(record))]
	pub fn hash(record: &impl Serialize) -> Result<String, Error> {
		Ok(hex::encode(Self::digest(record)?))
	}

	/// Check `record` against a previously computed hash.
	///
	/// The comparison is over the digest bytes, in constant time.  A hash that isn't valid hex
	/// simply doesn't match.
	#[tracing::instrument(level = "trace", skip(record, expected))]
	pub fn verify(record: &impl Serialize, expected: &str) -> Result<bool, Error> {
		let actual = Self::digest(record)?;

		let Ok(expected) = hex::decode(expected.trim()) else {
			return Ok(false);
		};

		Ok(constant_time_eq::constant_time_eq(&actual, &expected))
	}

	/// Like [`verify`](Self::verify), but a mismatch is an [`Error::AuditMismatch`].
	pub fn ensure(record: &impl Serialize, expected: &str) -> Result<(), Error> {
		if Self::verify(record, expected)? {
			Ok(())
		} else {
			Err(Error::AuditMismatch)
		}
	}

	fn digest(record: &impl Serialize) -> Result<[u8; 32], Error> {
		let value =
			serde_json::to_value(record).map_err(|e| Error::serialization(e.to_string()))?;
		let bytes = serde_json::to_vec(&canonicalize(value))
			.map_err(|e| Error::serialization(e.to_string()))?;

		Ok(Sha256::digest(&bytes).into())
	}
}

// Rebuild every object with its keys inserted in sorted order, which is the order they are
// written out in whether or not serde_json is preserving insertion order
fn canonicalize(value: Value) -> Value {
	match value {
		Value::Object(map) => {
			let mut entries: Vec<(String, Value)> = map.into_iter().collect();
			entries.sort_by(|(a, _), (b, _)| a.cmp(b));

			Value::Object(
				entries
					.into_iter()
					.map(|(k, v)| (k, canonicalize(v)))
					.collect::<Map<_, _>>(),
			)
		}
		Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
		other => other,
	}
}

/// A one-way keyed hash of `data`, for use as a deduplication or lookup key.
///
/// This is HMAC-SHA256 keyed by `salt`, returned as lowercase hex.  Unlike an audit hash, it
/// can't be recomputed by anyone who doesn't know the salt.
///
/// # Errors
///
/// [`Error::InvalidInput`] if `salt` is empty.
#[tracing::instrument(level = "trace", skip(data, salt))]
pub fn index_hash(data: &str, salt: &str) -> Result<String, Error> {
	if salt.is_empty() {
		return Err(Error::invalid_input("index hash salt must not be empty"));
	}

	let mut mac = <Hmac<Sha256> as hmac::Mac>::new_from_slice(salt.as_bytes())
		.map_err(|_| Error::invalid_input("index hash salt rejected"))?;
	mac.update(data.as_bytes());

	Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use std::collections::HashMap;

	#[test]
	fn key_order_does_not_matter() {
		assert_eq!(
			AuditHasher::hash(&json!({"a": 1, "b": 2})).unwrap(),
			AuditHasher::hash(&json!({"b": 2, "a": 1})).unwrap()
		);
	}

	#[test]
	fn nested_key_order_does_not_matter() {
		let mut one = HashMap::new();
		let mut two = HashMap::new();
		for (k, v) in [("z", 1), ("m", 2), ("a", 3), ("q", 4)] {
			one.insert(k, json!({"x": v, "y": [{"p": 1, "o": 2}]}));
		}
		for (k, v) in [("q", 4), ("a", 3), ("m", 2), ("z", 1)] {
			two.insert(k, json!({"y": [{"o": 2, "p": 1}], "x": v}));
		}

		assert_eq!(
			AuditHasher::hash(&one).unwrap(),
			AuditHasher::hash(&two).unwrap()
		);
	}

	#[test]
	fn any_change_changes_the_hash() {
		let base = AuditHasher::hash(&json!({"a": 1, "b": 2})).unwrap();

		for changed in [
			json!({"a": 1, "b": 3}),
			json!({"a": 1, "b": "2"}),
			json!({"a": 1, "c": 2}),
			json!({"a": 1, "b": 2, "c": null}),
			json!({"a": 1}),
		] {
			assert_ne!(base, AuditHasher::hash(&changed).unwrap());
		}
	}

	#[test]
	fn known_digest() {
		// sha256(b"{\"a\":1,\"b\":2}")
		assert_eq!(
			hex::encode(Sha256::digest(br#"{"a":1,"b":2}"#)),
			AuditHasher::hash(&json!({"b": 2, "a": 1})).unwrap()
		);
		assert_eq!(64, AuditHasher::hash(&json!(null)).unwrap().len());
	}

	#[test]
	fn verification() {
		let record = json!({"patient": "p-1", "fields": ["dob", "phone"]});
		let h = AuditHasher::hash(&record).unwrap();

		assert!(AuditHasher::verify(&record, &h).unwrap());
		assert!(AuditHasher::verify(&record, &h.to_uppercase()).unwrap());
		assert!(!AuditHasher::verify(&record, "not hex").unwrap());
		assert!(!AuditHasher::verify(&record, &h[..62]).unwrap());
		assert!(!AuditHasher::verify(&json!({"patient": "p-2"}), &h).unwrap());

		assert!(AuditHasher::ensure(&record, &h).is_ok());
		assert!(matches!(
			AuditHasher::ensure(&json!({}), &h),
			Err(Error::AuditMismatch)
		));
	}

	#[test]
	fn structs_hash_like_their_json() {
		#[derive(Serialize)]
		struct Visit {
			patient: &'static str,
			code: u32,
		}

		assert_eq!(
			AuditHasher::hash(&json!({"code": 99213, "patient": "p-1"})).unwrap(),
			AuditHasher::hash(&Visit {
				patient: "p-1",
				code: 99213
			})
			.unwrap()
		);
	}

	#[test]
	fn non_string_map_keys_are_rejected() {
		let mut m = HashMap::new();
		m.insert(vec![1u8], 1);

		assert!(matches!(
			AuditHasher::hash(&m),
			Err(Error::Serialization(_))
		));
	}

	#[test]
	fn index_hash_is_keyed() {
		let a = index_hash("5551234567", "salt-a").unwrap();

		assert_eq!(a, index_hash("5551234567", "salt-a").unwrap());
		assert_ne!(a, index_hash("5551234567", "salt-b").unwrap());
		assert_ne!(a, index_hash("5551234568", "salt-a").unwrap());
		assert_ne!(a, AuditHasher::hash(&"5551234567").unwrap());
		assert!(matches!(
			index_hash("5551234567", ""),
			Err(Error::InvalidInput(_))
		));
	}

	// RFC 4231, test case 2
	#[test]
	fn index_hash_is_hmac_sha256() {
		assert_eq!(
			"5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843",
			index_hash("what do ya want for nothing?", "Jefe").unwrap()
		);
	}
}
