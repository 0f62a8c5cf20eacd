//! LZ4 block compression shared by the cache envelope and record sweeps.
//!
//! The uncompressed length is prepended to every block, so decompression
//! needs no side channel.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::error::InfraError;

/// Compresses `bytes` into a size-prefixed LZ4 block.
#[must_use]
pub fn compress(bytes: &[u8]) -> Vec<u8> {
    compress_prepend_size(bytes)
}

/// Reverses [`compress`].
///
/// # Errors
///
/// Returns [`InfraError::Compression`] if `bytes` is not a valid
/// size-prefixed LZ4 block.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, InfraError> {
    decompress_size_prepended(bytes).map_err(|e| InfraError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repetitive_payload_shrinks() {
        let payload = "authentic ".repeat(2_000);
        let packed = compress(payload.as_bytes());
        assert!(packed.len() < payload.len() / 4);
        assert_eq!(decompress(&packed).ok(), Some(payload.into_bytes()));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decompress(&[0xff, 0xff, 0xff, 0x7f, 0x01]).is_err());
    }
}
