//! Partial-match search over encrypted values.
//!
//! Each searchable value gets a *search index*: the set of tokens derived from it (words,
//! word prefixes, and phone-number fragments), joined together with a per-field salt and
//! encrypted like any other field, under a context whose purpose is
//! [`SEARCH_TOKENS`](crate::Purpose::SearchTokens).  An authorized search path decrypts the
//! index and checks whether the query's tokens are all present.
//!
//! This supports "does this record match?", but not "which records match?" without decrypting
//! every candidate index.  Callers that need server-side equality lookups can store
//! [`index_hash`](crate::index_hash)es of individual tokens alongside.
use std::collections::BTreeSet;

use super::{EncryptedField, EncryptionContext, EnvelopeCipher, Error, Purpose};

/// Words shorter than this produce no tokens at all.
pub const MIN_PREFIX: usize = 3;

/// Longest prefix emitted for each word (the whole word is always emitted as well).
pub const MAX_PREFIX: usize = 8;

/// Digit runs at least this long are treated as phone-like numbers.
pub const MIN_DIGIT_RUN: usize = 7;

/// Derive the search tokens for `plaintext`.
///
/// The text is lowercased and stripped of everything that is neither alphanumeric nor
/// whitespace, then split into words.  Every word of at least three characters contributes its
/// prefixes of length three to eight, and itself.  Digit runs of seven or more digits (ignoring
/// punctuation and spaces between digits) contribute the whole run, and ten-digit runs also
/// contribute their area code and exchange.
///
/// ```rust
/// let tokens = phi_vault::tokens_for("John Smith, 555-123-4567");
///
/// for t in ["joh", "john", "smi", "smit", "smith", "5551234567", "555", "123"] {
///     assert!(tokens.contains(t), "missing {t}");
/// }
/// ```
pub fn tokens_for(plaintext: &str) -> BTreeSet<String> {
	let mut tokens: BTreeSet<String> = BTreeSet::new();

	for word in words(plaintext) {
		let chars: Vec<char> = word.chars().collect();

		if chars.len() < MIN_PREFIX {
			continue;
		}

		for n in MIN_PREFIX..=chars.len().min(MAX_PREFIX) {
			tokens.insert(chars[..n].iter().collect::<String>());
		}
		tokens.insert(word);
	}

	for run in digit_runs(plaintext) {
		if run.len() == 10 {
			tokens.insert(run[0..3].to_string());
			tokens.insert(run[3..6].to_string());
		}
		tokens.insert(run);
	}

	tokens
}

/// Check a decrypted search index against a query.
///
/// `index` must be the plaintext of an index produced with the same `salt`; anything else
/// never matches.  The query matches when every one of its terms is present in the index.
/// The terms are its phone-like digit runs, plus its words of three or more characters (words
/// made only of digits are left out when the query has a digit run, as they're part of it).
/// A query with no terms matches nothing.
///
/// Digit runs have to match exactly.  A word matches if it is a token, or if it is longer
/// than the longest indexed prefix and starts some indexed word, so "christoph" still finds
/// "Christopher".
pub fn index_matches(index: &str, salt: &str, query: &str) -> bool {
	let Some(tokens) = index
		.strip_suffix(salt)
		.and_then(|rest| rest.strip_suffix(':'))
	else {
		return false;
	};

	let tokens: BTreeSet<&str> = tokens.split(' ').filter(|t| !t.is_empty()).collect();

	let runs = digit_runs(query);
	let query_words: Vec<String> = words(query)
		.filter(|w| w.chars().count() >= MIN_PREFIX)
		.filter(|w| runs.is_empty() || !w.chars().all(|c| c.is_ascii_digit()))
		.collect();

	if runs.is_empty() && query_words.is_empty() {
		return false;
	}

	let word_found = |w: &String| {
		tokens.contains(w.as_str())
			|| (w.chars().count() > MAX_PREFIX && tokens.iter().any(|t| t.starts_with(w.as_str())))
	};

	runs.iter().all(|r| tokens.contains(r.as_str())) && query_words.iter().all(word_found)
}

fn words(text: &str) -> impl Iterator<Item = String> {
	let normalized: String = text
		.to_lowercase()
		.chars()
		.filter(|c| c.is_alphanumeric() || c.is_whitespace())
		.collect();

	normalized
		.split_whitespace()
		.map(str::to_string)
		.collect::<Vec<_>>()
		.into_iter()
}

// Letters end a run; anything else between digits is formatting
fn digit_runs(text: &str) -> Vec<String> {
	let mut runs = Vec::new();
	let mut current = String::new();

	for c in text.chars() {
		if c.is_ascii_digit() {
			current.push(c);
		} else if c.is_alphabetic() {
			if current.len() >= MIN_DIGIT_RUN {
				runs.push(std::mem::take(&mut current));
			}
			current.clear();
		}
	}

	if current.len() >= MIN_DIGIT_RUN {
		runs.push(current);
	}

	runs
}

/// Builds and queries encrypted search indexes.
#[derive(Clone, Debug)]
pub struct SearchTokenizer {
	cipher: EnvelopeCipher,
}

impl SearchTokenizer {
	pub fn new(cipher: EnvelopeCipher) -> Self {
		Self { cipher }
	}

	/// Encrypt the search index for `plaintext`.
	///
	/// The index is encrypted under `context`, with its purpose set to `SEARCH_TOKENS`, so it
	/// can't be confused with (or decrypted as) the value it indexes.
	///
	/// # Errors
	///
	/// [`Error::InvalidInput`] if `plaintext` is blank or `salt` is empty, and otherwise
	/// whatever [`EnvelopeCipher::encrypt_field`] reports.
	#[tracing::instrument(level = "debug", skip(self, plaintext, salt))]
	pub async fn search_index(
		&self,
		plaintext: &str,
		salt: &str,
		context: &EncryptionContext,
	) -> Result<EncryptedField, Error> {
		if plaintext.trim().is_empty() {
			return Err(Error::invalid_input("cannot index a blank value"));
		}
		if salt.is_empty() {
			return Err(Error::invalid_input("search index salt must not be empty"));
		}

		let tokens = tokens_for(plaintext);
		tracing::debug!(token_count = tokens.len(), "Derived search tokens");

		let mut blob = tokens.into_iter().collect::<Vec<_>>().join(" ");
		blob.push(':');
		blob.push_str(salt);

		self.cipher
			.encrypt_field(&blob, &context.clone().with_purpose(Purpose::SearchTokens))
			.await
	}

	/// Decrypt a search index and check it against `query`.
	///
	/// # Errors
	///
	/// [`Error::InvalidInput`] if `index` wasn't encrypted as a search index, and otherwise
	/// whatever [`EnvelopeCipher::decrypt_field`] reports.
	#[tracing::instrument(level = "debug", skip(self, index, salt, query), fields(key_id = %index.key_id))]
	pub async fn matches(
		&self,
		index: &EncryptedField,
		salt: &str,
		query: &str,
	) -> Result<bool, Error> {
		if !index.context.has_purpose(Purpose::SearchTokens) {
			return Err(Error::invalid_input("field is not a search index"));
		}

		let plaintext = self.cipher.decrypt_field(index).await?;

		Ok(index_matches(&plaintext, salt, query))
	}
}
