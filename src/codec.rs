//! gzip compression of application payloads. Handshake datagrams bypass this entirely; every
//!  payload an application sends or receives through a session passes through it.

use std::io::{ErrorKind, Read, Write};

use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::trace;

use crate::error::{SessionError, SessionResult};

pub fn compress(payload: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2 + 32), Compression::default());

    encoder.write_all(payload)
        .and_then(|_| encoder.finish())
        .expect("this is a bug: gzip encoding into a Vec cannot fail")
}

/// Reverses [compress]. Input that is not exactly one gzip member produced by it (garbage,
///  truncation, checksum mismatch, trailing bytes) is rejected.
pub fn decompress(compressed: &[u8]) -> SessionResult<Vec<u8>> {
    if compressed.is_empty() {
        return Err(SessionError::Codec(ErrorKind::UnexpectedEof.into()));
    }

    let mut decoder = GzDecoder::new(compressed);
    let mut result = Vec::new();
    decoder.read_to_end(&mut result)?;

    trace!("decompressed {} bytes into {}", compressed.len(), result.len());
    if !decoder.into_inner().is_empty() {
        return Err(SessionError::Codec(std::io::Error::new(ErrorKind::InvalidData, "trailing bytes after gzip member")));
    }
    Ok(result)
}
