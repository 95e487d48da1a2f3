//! Byte-transform applied to stored snapshot payloads.
//!
//! Payloads are deflate-compressed on the way into a store and decoded on
//! the way out. The rest of the crate treats the transform as an opaque
//! `io::Write`/`io::Read` wrapping; nothing here inspects snapshot contents.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

/// Wrap `writer` so bytes written to the result are stored deflate-encoded.
///
/// Call `finish()` on the encoder to flush the trailing compressed block.
pub(crate) fn encoder<W: Write>(writer: W) -> DeflateEncoder<W> {
    // Fastest level: captures happen once per simulated frame.
    DeflateEncoder::new(writer, Compression::fast())
}

/// Wrap `reader` so encoded bytes read from it come out decoded.
pub(crate) fn decoder<R: Read>(reader: R) -> DeflateDecoder<R> {
    DeflateDecoder::new(reader)
}
