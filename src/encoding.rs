//! On-storage encoding conventions: recognized state file extensions and
//! transparent gzip compression.
//!
//! State files are JSON, optionally gzip-compressed with a `.gz` suffix
//! appended to the full name (`dev.json` vs `dev.json.gz`). Both forms are
//! the same logical object; readers must accept either regardless of the
//! store's current write-time setting.

use crate::core::{Result, StoreError};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

/// Extension of uncompressed state files, with the leading dot.
pub const JSON_EXT: &str = ".json";

/// Extension appended to gzip-compressed state files.
pub const GZIP_EXT: &str = ".gz";

/// Returns true if `ext` (with leading dot) is a recognized state
/// serialization format.
pub fn is_recognized_ext(ext: &str) -> bool {
    ext == JSON_EXT
}

pub fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| StoreError::IoError(format!("gzip encode: {}", e)))
}

pub fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| StoreError::IoError(format!("gzip decode: {}", e)))?;
    Ok(out)
}

/// Last path segment of a storage key.
pub fn object_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Splits `file` into (stem, extension-with-dot). Returns an empty extension
/// when there is none.
pub fn split_ext(file: &str) -> (&str, &str) {
    match file.rfind('.') {
        Some(idx) if idx > 0 => (&file[..idx], &file[idx..]),
        _ => (file, ""),
    }
}

/// Recovers the logical stack name from a state file name, stripping a `.gz`
/// suffix first and then requiring a recognized serialization extension.
/// Returns `None` for foreign files (`*.bak`, partial uploads, ...).
pub fn stack_file_name(file: &str) -> Option<&str> {
    let file = file.strip_suffix(GZIP_EXT).unwrap_or(file);
    let (stem, ext) = split_ext(file);
    if is_recognized_ext(ext) { Some(stem) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_round_trip() {
        let data = br#"{"latest":{"resources":[]}}"#;
        let compressed = gzip_compress(data).unwrap();
        assert_ne!(compressed, data.to_vec());
        assert_eq!(gzip_decompress(&compressed).unwrap(), data.to_vec());
    }

    #[test]
    fn test_stack_file_name() {
        assert_eq!(stack_file_name("dev.json"), Some("dev"));
        assert_eq!(stack_file_name("dev.json.gz"), Some("dev"));
        assert_eq!(stack_file_name("dev.json.bak"), None);
        assert_eq!(stack_file_name("dev.json.bak.1234"), None);
        assert_eq!(stack_file_name("dev"), None);
        assert_eq!(stack_file_name("dev.yaml"), None);
    }

    #[test]
    fn test_object_name() {
        assert_eq!(object_name("a/b/c.json"), "c.json");
        assert_eq!(object_name("c.json"), "c.json");
    }
}
