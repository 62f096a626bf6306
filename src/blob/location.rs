//! Store-location URL handling.
//!
//! Store locations are URLs whose scheme selects the storage transport:
//! `file://` for the local filesystem, `mem://` for the in-memory bucket,
//! and hosted object-store schemes (`s3://`, `gs://`, `azblob://`) whose
//! transports are linked in by the caller.

use crate::core::{Result, StoreError};
use std::path::{Path, PathBuf};

pub const FILE_SCHEME_PREFIX: &str = "file://";
pub const MEMORY_SCHEME_PREFIX: &str = "mem://";

/// Schemes this crate knows how to address. Hosted ones still need a caller
/// supplied transport.
pub const KNOWN_SCHEMES: &[&str] = &["file", "mem", "s3", "gs", "azblob"];

/// Returns true if `url_str` looks like a store location this backend can
/// address.
pub fn is_store_url(url_str: &str) -> bool {
    match url::Url::parse(url_str) {
        Ok(u) => KNOWN_SCHEMES.contains(&u.scheme()),
        Err(_) => false,
    }
}

fn to_slash(path: &Path) -> String {
    let s = path.to_string_lossy().replace('\\', "/");
    // Rooted non-slash paths (Windows drive letters) need a leading slash in
    // URL form.
    if std::path::MAIN_SEPARATOR != '/' && !s.starts_with('/') {
        format!("/{}", s)
    } else {
        s
    }
}

/// Normalizes a user-provided store URL into canonical form.
///
/// Only `file://` URLs are touched: `~` expands to the home directory,
/// relative paths are made absolute, and separators become forward slashes.
/// Other schemes pass through untouched.
pub fn massage_store_url(url_str: &str) -> Result<String> {
    let Some(path) = url_str.strip_prefix(FILE_SCHEME_PREFIX) else {
        return Ok(url_str.to_string());
    };

    let path = if path == "~" {
        dirs::home_dir()
            .ok_or_else(|| StoreError::IoError("could not resolve home directory for 'file://~' path".to_string()))?
    } else if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| StoreError::IoError("could not resolve home directory for 'file://~' path".to_string()))?;
        home.join(rest)
    } else {
        PathBuf::from(path)
    };

    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };

    Ok(format!("{}{}", FILE_SCHEME_PREFIX, to_slash(&path)))
}

/// Extracts the local root directory from a canonicalized `file://` URL.
pub fn file_url_root(url_str: &str) -> Option<PathBuf> {
    url_str.strip_prefix(FILE_SCHEME_PREFIX).map(PathBuf::from)
}
