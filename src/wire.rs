//! Small helpers shared by the CBOR-framed blobs (field envelopes and wrapped keys).
use ciborium_ll::{Decoder, Header};

use super::Error;

/// Check the magic prefix and that the blob holds a CBOR array of exactly `items` elements,
/// returning a decoder positioned at the first element.
pub(crate) fn open<'a>(
	b: &'a [u8],
	magic: &[u8; 3],
	items: usize,
	min_len: usize,
) -> Result<Decoder<&'a [u8]>, Error> {
	if b.len() < min_len {
		return Err(Error::invalid_ciphertext("too short"));
	}

	if b[0..3] != magic[..] {
		tracing::debug!(expected=?magic, actual=?&b[0..3], "Bad magic");
		return Err(Error::invalid_ciphertext("incorrect magic"));
	}

	let mut dec = Decoder::from(&b[3..]);

	match dec.pull().map_err(|e| Error::decoding("array", e))? {
		Header::Array(Some(n)) if n == items => Ok(dec),
		_ => Err(Error::invalid_ciphertext("expected array")),
	}
}

/// Read one byte string, coping with segmented (indefinite-length) encodings.
pub(crate) fn read_bytes(dec: &mut Decoder<&[u8]>, element: &str) -> Result<Vec<u8>, Error> {
	let Header::Bytes(len) = dec
		.pull()
		.map_err(|e| Error::decoding(format!("{element} header"), e))?
	else {
		return Err(Error::invalid_ciphertext(format!("expected {element}")));
	};

	let mut segments = dec.bytes(len);
	let mut buf = [0u8; 1024];
	let mut out: Vec<u8> = Vec::new();

	while let Some(mut segment) = segments
		.pull()
		.map_err(|e| Error::decoding(element, e))?
	{
		while let Some(chunk) = segment
			.pull(&mut buf[..])
			.map_err(|e| Error::decoding(element, e))?
		{
			out.extend_from_slice(chunk);
		}
	}

	Ok(out)
}

/// Read a byte string that must be exactly `N` bytes long.
pub(crate) fn read_array<const N: usize>(
	dec: &mut Decoder<&[u8]>,
	element: &str,
) -> Result<[u8; N], Error> {
	read_bytes(dec, element)?[..]
		.try_into()
		.map_err(|_| Error::invalid_ciphertext(format!("incorrect {element} length")))
}

/// Fail if anything follows the last element.
pub(crate) fn finish(mut dec: Decoder<&[u8]>, total_len: usize) -> Result<(), Error> {
	// The decoder was opened past the three magic bytes
	if dec.offset() + 3 != total_len {
		return Err(Error::invalid_ciphertext("trailing data"));
	}

	Ok(())
}
