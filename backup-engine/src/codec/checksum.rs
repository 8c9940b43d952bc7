//! Deterministic SHA-256 digests for integrity checksums and
//! deduplication keys.

use crate::utils::errors::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

const BUFFER_SIZE: usize = 64 * 1024;

pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    feed(&mut hasher, reader)?;
    Ok(hex::encode(hasher.finalize()))
}

pub fn hash_file(path: &Path) -> Result<String> {
    let mut reader = BufReader::with_capacity(BUFFER_SIZE, File::open(path)?);
    Ok(hash_reader(&mut reader)?)
}

/// Digest over the concatenation of several files, in the given order.
pub fn hash_files<P: AsRef<Path>>(paths: &[P]) -> Result<String> {
    let mut hasher = Sha256::new();
    for path in paths {
        let mut reader = BufReader::with_capacity(BUFFER_SIZE, File::open(path.as_ref())?);
        feed(&mut hasher, &mut reader)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn feed<R: Read>(hasher: &mut Sha256, reader: &mut R) -> io::Result<()> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}

/// Wraps a reader and hashes exactly the bytes that pass through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Hex digest and byte count of everything read so far
    pub fn finalize(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_file_and_stream_digests_agree() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("f.txt");
        std::fs::write(&path, b"hello world")?;

        let mut reader = HashingReader::new(File::open(&path)?);
        io::copy(&mut reader, &mut io::sink())?;
        let (streamed, bytes) = reader.finalize();

        assert_eq!(bytes, 11);
        assert_eq!(streamed, hash_file(&path)?);
        assert_eq!(streamed, hash_bytes(b"hello world"));
        Ok(())
    }

    #[test]
    fn test_hash_files_is_order_sensitive() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        std::fs::write(&a, b"first")?;
        std::fs::write(&b, b"second")?;

        assert_eq!(hash_files(&[&a, &b])?, hash_bytes(b"firstsecond"));
        assert_ne!(hash_files(&[&a, &b])?, hash_files(&[&b, &a])?);
        Ok(())
    }
}
