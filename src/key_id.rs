use serde::{Deserialize, Serialize};

use super::{Error, Key, kdf, wire};

/// Name of a master key held by the key service.
///
/// This is what gets stored next to each [`EncryptedField`](super::EncryptedField), so that the
/// right master key can be asked to unwrap the data key later.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MasterKeyId(String);

impl MasterKeyId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl std::fmt::Display for MasterKeyId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for MasterKeyId {
	fn from(s: &str) -> Self {
		Self::new(s)
	}
}

impl From<String> for MasterKeyId {
	fn from(s: String) -> Self {
		Self(s)
	}
}

type Fp = [u8; 16];

/// A short, non-secret identifier for one specific version of a master key.
#[allow(clippy::derived_hash_with_manual_eq)] // k1 == k2 => hash(k1) == hash(k2) will hold
#[derive(Clone, Copy, Debug, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct KeyFingerprint(Fp);

impl KeyFingerprint {
	pub(crate) fn as_bytes(&self) -> &Fp {
		&self.0
	}

	pub(crate) fn encode(&self, enc: &mut ciborium_ll::Encoder<&mut Vec<u8>>) -> Result<(), Error> {
		enc.bytes(&self.0, None)
			.map_err(|e| Error::encoding("fingerprint", e))?;
		Ok(())
	}

	pub(crate) fn decode(dec: &mut ciborium_ll::Decoder<&[u8]>) -> Result<Self, Error> {
		let bytes = wire::read_bytes(dec, "fingerprint")?;

		let fp: Fp = bytes[..]
			.try_into()
			.map_err(|_| Error::invalid_ciphertext("incorrect fingerprint length"))?;

		Ok(Self(fp))
	}
}

impl PartialEq for KeyFingerprint {
	fn eq(&self, other: &Self) -> bool {
		constant_time_eq::constant_time_eq_n(&self.0, &other.0)
	}
}

impl Eq for KeyFingerprint {}

impl std::fmt::Display for KeyFingerprint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

/// Get a reasonably-unique fingerprint for a key
#[tracing::instrument(level = "trace", skip(key))]
pub(crate) fn fingerprint(key: &Key) -> Result<KeyFingerprint, Error> {
	let mut fp: Fp = Default::default();

	fp.copy_from_slice(&kdf::derive_key(key, b"fingerprint")?.expose_secret()[0..16]);

	Ok(KeyFingerprint(fp))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fingerprints_are_stable_and_distinct() {
		let k1 = Key::new([1u8; 32]);
		let k2 = Key::new([2u8; 32]);

		assert_eq!(fingerprint(&k1).unwrap(), fingerprint(&k1.clone()).unwrap());
		assert_ne!(fingerprint(&k1).unwrap(), fingerprint(&k2).unwrap());
		assert_eq!(32, fingerprint(&k1).unwrap().to_string().len());
	}

	#[test]
	fn fingerprint_cbor_round_trip() {
		let fp = fingerprint(&Key::new([9u8; 32])).unwrap();

		let mut v = Vec::new();
		fp.encode(&mut ciborium_ll::Encoder::from(&mut v)).unwrap();

		let mut dec = ciborium_ll::Decoder::from(&v[..]);
		assert_eq!(fp, KeyFingerprint::decode(&mut dec).unwrap());
	}

	#[test]
	fn master_key_id_is_a_plain_string_on_the_wire() {
		let id = MasterKeyId::from("alias/phi");
		assert_eq!("\"alias/phi\"", serde_json::to_string(&id).unwrap());
	}
}
