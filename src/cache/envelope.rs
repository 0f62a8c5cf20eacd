//! Structured envelope for cached values.
//!
//! Every stored value starts with a three-byte header: a magic byte, a
//! format version and the payload encoding. The flag lives in the header
//! rather than in the payload, so no legitimate payload can be mistaken for
//! a compressed one.

use crate::compression;
use crate::error::InfraError;

const MAGIC: u8 = 0xCE;
const VERSION: u8 = 1;
const HEADER_LEN: usize = 3;

/// How the envelope payload is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    /// Serialized value stored as-is.
    Plain = 0,
    /// Serialized value stored as a size-prefixed LZ4 block.
    Lz4 = 1,
}

impl Encoding {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Plain),
            1 => Some(Self::Lz4),
            _ => None,
        }
    }
}

/// A cache value plus its encoding flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEnvelope {
    encoding: Encoding,
    payload: Vec<u8>,
}

impl CacheEnvelope {
    /// Wraps a serialized value, compressing it when it is strictly larger
    /// than `threshold` bytes.
    #[must_use]
    pub fn seal(serialized: Vec<u8>, threshold: usize) -> Self {
        if serialized.len() > threshold {
            Self {
                encoding: Encoding::Lz4,
                payload: compression::compress(&serialized),
            }
        } else {
            Self {
                encoding: Encoding::Plain,
                payload: serialized,
            }
        }
    }

    /// Payload encoding.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Returns `true` if the payload is compressed.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.encoding == Encoding::Lz4
    }

    /// Encodes header and payload into the stored byte form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&[MAGIC, VERSION, self.encoding as u8]);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parses the stored byte form.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Compression`] if the header is missing, has an
    /// unknown version, or names an unknown encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, InfraError> {
        let Some((header, payload)) = bytes.split_first_chunk::<HEADER_LEN>() else {
            return Err(InfraError::Compression("cache value too short".to_string()));
        };
        let [magic, version, tag] = *header;
        if magic != MAGIC {
            return Err(InfraError::Compression("cache value has no envelope".to_string()));
        }
        if version != VERSION {
            return Err(InfraError::Compression(format!(
                "unsupported cache envelope version {version}"
            )));
        }
        let encoding = Encoding::from_tag(tag)
            .ok_or_else(|| InfraError::Compression(format!("unknown cache encoding {tag}")))?;
        Ok(Self {
            encoding,
            payload: payload.to_vec(),
        })
    }

    /// Returns the serialized value, decompressing if needed.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Compression`] if a compressed payload is corrupt.
    pub fn open(self) -> Result<Vec<u8>, InfraError> {
        match self.encoding {
            Encoding::Plain => Ok(self.payload),
            Encoding::Lz4 => compression::decompress(&self.payload),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_exclusive() {
        let at = CacheEnvelope::seal(vec![b'x'; 100], 100);
        assert!(!at.is_compressed());
        let over = CacheEnvelope::seal(vec![b'x'; 101], 100);
        assert!(over.is_compressed());
    }

    #[test]
    fn compressed_envelope_reopens_to_original() {
        let value = b"{\"findings\":[]}".repeat(100);
        let sealed = CacheEnvelope::seal(value.clone(), 64);
        let Ok(parsed) = CacheEnvelope::from_bytes(&sealed.to_bytes()) else {
            panic!("envelope did not parse");
        };
        assert_eq!(parsed.encoding(), Encoding::Lz4);
        assert_eq!(parsed.open().ok(), Some(value));
    }

    #[test]
    fn payload_resembling_a_marker_stays_plain() {
        // A plain payload that happens to start with the magic byte.
        let value = vec![MAGIC, VERSION, 1, 0xff];
        let sealed = CacheEnvelope::seal(value.clone(), 1_000);
        let Ok(parsed) = CacheEnvelope::from_bytes(&sealed.to_bytes()) else {
            panic!("envelope did not parse");
        };
        assert_eq!(parsed.open().ok(), Some(value));
    }

    #[test]
    fn bare_bytes_are_rejected() {
        assert!(CacheEnvelope::from_bytes(b"{}").is_err());
        assert!(CacheEnvelope::from_bytes(&[MAGIC, 9, 0]).is_err());
        assert!(CacheEnvelope::from_bytes(&[MAGIC, VERSION, 7]).is_err());
    }
}
