use secrecy::ExposeSecret as _;

/// Symmetric key material: either a master key held by a [`LocalKeyService`](super::LocalKeyService)
/// or a single-use data key handed out by a [`KeyService`](super::KeyService).
///
/// The bytes live in a [`secrecy::SecretBox`], so they are zeroed when the key is dropped and
/// never show up in `Debug` output.
#[derive(Debug)]
pub struct Key(secrecy::SecretBox<[u8; 32]>);

impl Key {
	pub fn new(k: [u8; 32]) -> Self {
		Box::new(k).into()
	}

	pub fn expose_secret(&self) -> &[u8; 32] {
		self.0.expose_secret()
	}
}

impl Clone for Key {
	fn clone(&self) -> Self {
		Self(Box::new(*self.expose_secret()).into())
	}
}

impl From<Box<[u8; 32]>> for Key {
	fn from(k: Box<[u8; 32]>) -> Self {
		Key(k.into())
	}
}

impl TryFrom<&[u8]> for Key {
	type Error = super::Error;

	fn try_from(b: &[u8]) -> Result<Self, Self::Error> {
		let k: [u8; 32] = b
			.try_into()
			.map_err(|_| super::Error::invalid_key(format!("expected 32 bytes, got {}", b.len())))?;
		Ok(Key::new(k))
	}
}

/// Create a fresh random key.
///
/// Mostly useful for seeding a [`LocalKeyService`](super::LocalKeyService) in tests and
/// development setups; production data keys come from the key service.
#[tracing::instrument(level = "debug")]
pub fn generate_key() -> Key {
	use rand::{RngCore, rng};

	// Fill in place so no copy of the key is left behind on the stack
	let mut k = Box::new([0u8; 32]);

	rng().fill_bytes(&mut k[..]);

	k.into()
}
