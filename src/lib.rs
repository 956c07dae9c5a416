//! Field-level encryption, search and tamper evidence for protected health information.
//!
//! Every PHI value is encrypted on its own, with a data key that is used exactly once.  The
//! data key is generated by a [`KeyService`] (a cloud KMS, an HSM, or for development the
//! in-process [`LocalKeyService`]), which also hands back a *wrapped* copy of the key,
//! encrypted under a master key that never leaves the key service.  Only the wrapped key is
//! stored, next to the ciphertext, in an [`EncryptedField`].  Reading the value back means
//! asking the key service to unwrap the key again, which is where access control (and
//! auditing of access) happens.
//!
//! Each encryption is bound to an [`EncryptionContext`], such as the clinic a patient belongs
//! to.  The context has to be supplied, unchanged, to decrypt; a ciphertext copied into
//! another clinic's record simply won't decrypt there.  [This Security StackExchange
//! answer](https://security.stackexchange.com/a/179279/167630) is an excellent explanation of
//! why an encryption context is useful.
//!
//! # Search
//!
//! Staff still need to find patients by partial name or phone number.  [`tokens_for`] breaks
//! a value into searchable fragments (word prefixes, phone number parts), and
//! [`SearchTokenizer`] stores them as one more encrypted field.  An authorized search decrypts
//! that index and checks the query against it; nothing searchable is ever stored in the
//! clear.
//!
//! # Tamper evidence
//!
//! [`AuditHasher`] produces a SHA-256 digest over a canonical rendering of a record, which can
//! be stored alongside it and checked on every read to detect changes made behind the
//! application's back.
//!
//! # Records
//!
//! [`BatchCoordinator`] handles a whole record's worth of fields at once, concurrently.  It
//! refuses to produce a partially-encrypted record, but will happily return a partially
//! *decrypted* one, with the unreadable fields marked as [`DECRYPTION_FAILED`].
//!
//! [`PhiEngine`] wraps all of the above up behind one handle.
mod audit;
mod batch;
mod config;
mod context;
mod engine;
mod envelope;
mod error;
mod key_service;
mod search;
mod wire;

pub use audit::{AuditHasher, index_hash};
pub use batch::{BatchCoordinator, DECRYPTION_FAILED, DecryptReport, FieldInput};
pub use config::EngineConfig;
pub use context::{EncryptionContext, PURPOSE_KEY, Purpose};
pub use engine::PhiEngine;
pub use envelope::{EncryptedField, EnvelopeCipher};
pub use error::{Error, KeyUnavailableReason};
pub use key_service::{GeneratedDataKey, KeyService, LocalKeyService};
pub use search::{SearchTokenizer, index_matches, tokens_for};

mod kdf;
mod key;
mod key_id;

pub use key::{Key, generate_key};
pub use key_id::{KeyFingerprint, MasterKeyId};

#[cfg(test)]
mod test_util;
