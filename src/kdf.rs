use hkdf::Hkdf;
use sha2::Sha256;

use super::{Error, Key};

/// Derive a subkey from `key` for the given purpose.
pub(crate) fn derive_key(key: &Key, info: &[u8]) -> Result<Key, Error> {
	let hk = Hkdf::<Sha256>::from_prk(key.expose_secret())
		.map_err(|_| Error::invalid_key("key not long enough for HKDF"))?;

	let mut output = Box::new([0u8; 32]);

	hk.expand(info, &mut output[..])
		.map_err(|_| Error::invalid_key("HKDF output length rejected"))?;

	Ok(output.into())
}
