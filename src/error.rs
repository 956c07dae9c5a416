#[derive(Debug, thiserror::Error, thiserror_ext::Construct)]
#[non_exhaustive]
pub enum Error {
	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("key service unavailable for {key_id}: {reason}")]
	KeyUnavailable {
		key_id: String,
		reason: KeyUnavailableReason,
	},

	#[error("failed to encrypt {}", describe_fields(.fields))]
	Encryption { fields: Vec<String> },

	#[error("failed to decrypt ciphertext")]
	Decryption,

	#[error("ciphertext failed integrity check")]
	Integrity,

	#[error("audit hash does not match record")]
	AuditMismatch,

	#[error("ciphertext decoding failure on {element}: {cause:?}")]
	Decoding {
		element: String,
		cause: ciborium_ll::Error<std::io::Error>,
	},

	#[error("ciphertext encoding failure on {element}: {cause}")]
	Encoding {
		element: String,
		cause: std::io::Error,
	},

	#[error("invalid ciphertext: {0}")]
	InvalidCiphertext(String),

	#[error("invalid key: {0}")]
	InvalidKey(String),

	#[error("could not serialize record: {0}")]
	Serialization(String),

	#[error("invalid configuration: {0}")]
	Config(String),
}

impl Error {
	/// Whether retrying the same operation might succeed.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::KeyUnavailable { reason, .. } => reason.is_retryable(),
			_ => false,
		}
	}

	/// A short, PHI-free label for logs and metrics.
	pub fn class(&self) -> &'static str {
		match self {
			Self::InvalidInput(_) => "invalid_input",
			Self::KeyUnavailable { .. } => "key_unavailable",
			Self::Encryption { .. } => "encryption_failure",
			Self::Decryption => "decryption_failure",
			Self::Integrity => "integrity_failure",
			Self::AuditMismatch => "audit_mismatch",
			Self::Decoding { .. } | Self::Encoding { .. } | Self::InvalidCiphertext(_) => {
				"invalid_ciphertext"
			}
			Self::InvalidKey(_) => "invalid_key",
			Self::Serialization(_) => "serialization",
			Self::Config(_) => "config",
		}
	}
}

/// Why the key service could not hand over a key.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum KeyUnavailableReason {
	/// The call did not complete within the configured timeout.
	Timeout,
	/// The caller is not authorized to use the master key, or it does not exist.
	Denied,
	/// The encryption context differs from the one the key was bound to.
	ContextMismatch,
	/// The key service could not be reached or returned an unexpected error.
	Transport(String),
}

impl KeyUnavailableReason {
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::Timeout | Self::Transport(_))
	}
}

impl std::fmt::Display for KeyUnavailableReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Timeout => f.write_str("timed out"),
			Self::Denied => f.write_str("access denied"),
			Self::ContextMismatch => f.write_str("encryption context mismatch"),
			Self::Transport(msg) => write!(f, "transport error: {msg}"),
		}
	}
}

fn describe_fields(fields: &[String]) -> String {
	if fields.is_empty() {
		"plaintext".to_string()
	} else {
		format!("field(s): {}", fields.join(", "))
	}
}
