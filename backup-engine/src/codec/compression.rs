//! Streaming compression with a preferred algorithm and a fallback.
//!
//! Zstandard is preferred. Gzip is used when the zstd encoder cannot be built
//! for the requested level. Decompression sniffs the magic bytes, so callers
//! never need to remember which algorithm produced an artifact.

use crate::config::CompressionConfig;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::warn;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    None,
    Zstd,
    Gzip,
}

impl Algorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Some(Algorithm::None),
            "zstd" | "zst" => Some(Algorithm::Zstd),
            "gzip" | "gz" => Some(Algorithm::Gzip),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::None => "none",
            Algorithm::Zstd => "zstd",
            Algorithm::Gzip => "gzip",
        }
    }

    /// File extension including the leading dot ("" for none)
    pub fn extension(&self) -> &'static str {
        match self {
            Algorithm::None => "",
            Algorithm::Zstd => ".zst",
            Algorithm::Gzip => ".gz",
        }
    }

    /// Identify the algorithm from the first bytes of a stream.
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&ZSTD_MAGIC) {
            Algorithm::Zstd
        } else if header.starts_with(&GZIP_MAGIC) {
            Algorithm::Gzip
        } else {
            Algorithm::None
        }
    }
}

/// Result of compressing one stream
#[derive(Debug, Clone, Copy)]
pub struct CompressionOutcome {
    /// Algorithm actually used (may be the fallback)
    pub algorithm: Algorithm,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compressor {
    algorithm: Algorithm,
    level: i32,
}

impl Compressor {
    pub fn new(algorithm: Algorithm, level: i32) -> Self {
        Self { algorithm, level }
    }

    pub fn zstd(level: i32) -> Self {
        Self::new(Algorithm::Zstd, level)
    }

    /// `None` when compression is disabled.
    pub fn from_config(config: &CompressionConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        match Algorithm::parse(&config.algorithm) {
            Some(Algorithm::None) | None => None,
            Some(algorithm) => Some(Self::new(algorithm, config.level)),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Algorithm a stream will be written with, after applying the fallback rule.
    pub fn effective_algorithm(&self) -> Algorithm {
        match self.algorithm {
            Algorithm::Zstd if !zstd::compression_level_range().contains(&self.level) => {
                Algorithm::Gzip
            }
            other => other,
        }
    }

    pub fn compress_stream<R: Read, W: Write>(
        &self,
        reader: &mut R,
        writer: W,
    ) -> Result<CompressionOutcome> {
        let algorithm = self.effective_algorithm();
        if algorithm != self.algorithm {
            warn!(
                level = self.level,
                "zstd cannot compress at this level, falling back to gzip"
            );
        }

        let mut counted = CountingWriter::new(writer);
        let bytes_in = match algorithm {
            Algorithm::Zstd => {
                let mut encoder = zstd::stream::write::Encoder::new(&mut counted, self.level)
                    .map_err(|e| EngineError::Compression(format!("zstd encoder: {}", e)))?;
                let n = io::copy(reader, &mut encoder)?;
                encoder
                    .finish()
                    .map_err(|e| EngineError::Compression(format!("zstd finish: {}", e)))?;
                n
            }
            Algorithm::Gzip => {
                let level = flate2::Compression::new(self.level.clamp(0, 9) as u32);
                let mut encoder = flate2::write::GzEncoder::new(&mut counted, level);
                let n = io::copy(reader, &mut encoder)?;
                encoder
                    .finish()
                    .map_err(|e| EngineError::Compression(format!("gzip finish: {}", e)))?;
                n
            }
            Algorithm::None => io::copy(reader, &mut counted)?,
        };
        counted.flush()?;

        Ok(CompressionOutcome {
            algorithm,
            bytes_in,
            bytes_out: counted.count,
        })
    }

    pub fn compress_file(&self, src: &Path, dst: &Path) -> Result<CompressionOutcome> {
        let mut input = BufReader::new(File::open(src)?);
        let output = BufWriter::new(File::create(dst)?);
        self.compress_stream(&mut input, output)
    }
}

/// Decompress a stream of any supported format into `writer`. Returns the
/// number of decompressed bytes written.
pub fn decompress_stream<R: Read, W: Write>(reader: R, mut writer: W) -> Result<u64> {
    let mut buffered = BufReader::new(reader);
    let algorithm = Algorithm::detect(buffered.fill_buf()?);

    let written = match algorithm {
        Algorithm::Zstd => {
            let mut decoder = zstd::stream::read::Decoder::with_buffer(buffered)
                .map_err(|e| EngineError::Compression(format!("zstd decoder: {}", e)))?;
            io::copy(&mut decoder, &mut writer)
                .map_err(|e| EngineError::Compression(format!("zstd decode: {}", e)))?
        }
        Algorithm::Gzip => {
            let mut decoder = flate2::bufread::GzDecoder::new(buffered);
            io::copy(&mut decoder, &mut writer)
                .map_err(|e| EngineError::Compression(format!("gzip decode: {}", e)))?
        }
        Algorithm::None => io::copy(&mut buffered, &mut writer)?,
    };
    writer.flush()?;
    Ok(written)
}

pub fn decompress_file(src: &Path, dst: &Path) -> Result<u64> {
    let input = File::open(src)?;
    let output = BufWriter::new(File::create(dst)?);
    decompress_stream(input, output)
}

/// Algorithm of an artifact on disk, from its first bytes.
pub fn detect_file(path: &Path) -> Result<Algorithm> {
    let mut header = [0u8; 4];
    let mut file = File::open(path)?;
    let n = file.read(&mut header)?;
    Ok(Algorithm::detect(&header[..n]))
}

struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Vec<u8> {
        b"backup engine payload ".repeat(512)
    }

    #[test]
    fn test_zstd_round_trip_shrinks_repetitive_data() -> Result<()> {
        let data = sample();
        let mut compressed = Vec::new();
        let outcome = Compressor::zstd(3).compress_stream(&mut data.as_slice(), &mut compressed)?;

        assert_eq!(outcome.algorithm, Algorithm::Zstd);
        assert_eq!(outcome.bytes_in, data.len() as u64);
        assert_eq!(outcome.bytes_out, compressed.len() as u64);
        assert!(compressed.len() < data.len());
        assert_eq!(Algorithm::detect(&compressed), Algorithm::Zstd);

        let mut restored = Vec::new();
        decompress_stream(compressed.as_slice(), &mut restored)?;
        assert_eq!(restored, data);
        Ok(())
    }

    #[test]
    fn test_out_of_range_zstd_level_falls_back_to_gzip() -> Result<()> {
        let compressor = Compressor::zstd(1000);
        assert_eq!(compressor.effective_algorithm(), Algorithm::Gzip);

        let data = sample();
        let mut compressed = Vec::new();
        let outcome = compressor.compress_stream(&mut data.as_slice(), &mut compressed)?;
        assert_eq!(outcome.algorithm, Algorithm::Gzip);
        assert_eq!(Algorithm::detect(&compressed), Algorithm::Gzip);

        let mut restored = Vec::new();
        decompress_stream(compressed.as_slice(), &mut restored)?;
        assert_eq!(restored, data);
        Ok(())
    }

    #[test]
    fn test_uncompressed_input_passes_through() -> Result<()> {
        let mut restored = Vec::new();
        decompress_stream(&b"plain text"[..], &mut restored)?;
        assert_eq!(restored, b"plain text");
        Ok(())
    }

    #[test]
    fn test_compress_file_and_detect() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let src = temp_dir.path().join("data.bin");
        let dst = temp_dir.path().join("data.bin.zst");
        let back = temp_dir.path().join("data.out");
        std::fs::write(&src, sample())?;

        Compressor::zstd(5).compress_file(&src, &dst)?;
        assert_eq!(detect_file(&dst)?, Algorithm::Zstd);

        decompress_file(&dst, &back)?;
        assert_eq!(std::fs::read(&back)?, sample());
        Ok(())
    }

    #[test]
    fn test_disabled_config_yields_no_compressor() {
        let mut config = CompressionConfig::default();
        assert!(Compressor::from_config(&config).is_some());
        config.enabled = false;
        assert!(Compressor::from_config(&config).is_none());
        config.enabled = true;
        config.algorithm = "none".into();
        assert!(Compressor::from_config(&config).is_none());
    }
}
