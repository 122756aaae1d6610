//! Content checksums.

use std::io::{self, Read};

use blake3::Hasher;

/// Computes a content fingerprint for one file.
pub trait ChecksumGenerator: Send + Sync {
    /// Read `input` to the end and return its checksum as a hex string.
    fn checksum(&self, input: &mut dyn Read) -> io::Result<String>;
}

/// BLAKE3 over the full content, hex encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Checksum;

impl ChecksumGenerator for Blake3Checksum {
    fn checksum(&self, input: &mut dyn Read) -> io::Result<String> {
        let mut hasher = Hasher::new();
        hasher.update_reader(input)?;
        Ok(hex::encode(hasher.finalize().as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn matches_one_shot_hash() {
        let content = b"The quick brown fox jumps over the lazy dog".repeat(5_000);
        let streamed = Blake3Checksum
            .checksum(&mut Cursor::new(content.as_slice()))
            .unwrap();
        assert_eq!(streamed, blake3::hash(&content).to_hex().as_str());
    }

    #[test]
    fn read_errors_propagate() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::other("disk on fire"))
            }
        }
        let err = Blake3Checksum.checksum(&mut Broken).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }

    #[test]
    fn empty_input() {
        let sum = Blake3Checksum.checksum(&mut io::empty()).unwrap();
        assert_eq!(sum.len(), 64);
        assert_eq!(sum, hex::encode(blake3::hash(&[]).as_bytes()));
    }
}
