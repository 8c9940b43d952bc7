//! Byte-level codecs shared by every engine: streaming compression and
//! content hashing.

pub mod checksum;
pub mod compression;

pub use checksum::{hash_file, hash_files, HashingReader};
pub use compression::{Algorithm, CompressionOutcome, Compressor};
