//! Hashing utilities for fleetsync
//!
//! - BLAKE3 for the installed-binaries checksum manifest
//! - SHA-256 for verifying downloads against published checksum files

use blake3::Hasher;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Compute BLAKE3 hash incrementally (for streaming)
pub struct Blake3Hasher {
    hasher: Hasher,
}

impl Blake3Hasher {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finalize(&self) -> String {
        let hash = self.hasher.finalize();
        format!("{}", hash)
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// BLAKE3 of a file's contents, streamed
pub fn blake3_file(path: &Path) -> crate::Result<String> {
    let mut hasher = Blake3Hasher::new();
    stream_file(path, |chunk| hasher.update(chunk))?;
    Ok(hasher.finalize())
}

fn stream_file(path: &Path, mut f: impl FnMut(&[u8])) -> crate::Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        f(&buf[..n]);
    }
    Ok(())
}

/// Extract the digest from a checksum file body
///
/// Accepts the `sha256sum` format (`<hex>  <name>`) as well as a bare digest.
/// When several lines are present, the one naming `file_name` wins.
pub fn parse_checksum_file(body: &str, file_name: Option<&str>) -> Option<String> {
    let mut first = None;
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut parts = line.split_whitespace();
        let Some(digest) = parts.next() else {
            continue;
        };
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        let digest = digest.to_ascii_lowercase();
        let named = parts.next().map(|n| n.trim_start_matches('*'));
        match (file_name, named) {
            (Some(wanted), Some(name)) if name.ends_with(wanted) => return Some(digest),
            _ => {
                first.get_or_insert(digest);
            }
        }
    }
    first
}
