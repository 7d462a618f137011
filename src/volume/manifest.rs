//! Checksum manifest of an installed `bin/` directory

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::hash::blake3_file;
use crate::common::utils::{read_optional, write_atomic};
use crate::common::{Error, Result};

pub const MANIFEST_FILE: &str = ".manifest.json";

/// BLAKE3 digest of every file of one install, keyed by relative path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumManifest {
    pub version: String,
    pub files: BTreeMap<String, String>,
}

impl ChecksumManifest {
    /// Hash every regular file under `dir`
    pub fn build(dir: &Path, version: &str) -> Result<Self> {
        let mut files = BTreeMap::new();
        collect(dir, dir, &mut files)?;
        tracing::debug!("Hashed {} files for {} in {:?}", files.len(), version, dir);
        Ok(Self {
            version: version.to_string(),
            files,
        })
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        let body = serde_json::to_vec_pretty(self)?;
        write_atomic(&dir.join(MANIFEST_FILE), &body)
    }

    /// Load `dir/.manifest.json`; `None` when there is none
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        match read_optional(&dir.join(MANIFEST_FILE))? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Check every listed file against its digest
    pub fn verify(&self, dir: &Path) -> Result<()> {
        for (relative, expected) in &self.files {
            let path = dir.join(relative);
            if !path.is_file() {
                return Err(Error::BinaryValidation(format!(
                    "{} listed in manifest but missing",
                    relative
                )));
            }
            let actual = blake3_file(&path)?;
            if &actual != expected {
                return Err(Error::ChecksumMismatch {
                    file: relative.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

fn collect(base: &Path, dir: &Path, files: &mut BTreeMap<String, String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            collect(base, &path, files)?;
        } else if file_type.is_file() {
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            if relative == Path::new(MANIFEST_FILE) {
                continue;
            }
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(key, blake3_file(&path)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn install(dir: &Path) {
        fs::create_dir_all(dir.join("lib")).unwrap();
        fs::write(dir.join("server"), b"#!/bin/sh\necho server\n").unwrap();
        fs::write(dir.join("lib").join("plugin.so"), b"\x7fELF").unwrap();
    }

    #[test]
    fn test_build_write_load_verify() {
        let dir = TempDir::new().unwrap();
        install(dir.path());

        let manifest = ChecksumManifest::build(dir.path(), "7.14.3").unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert!(manifest.files.contains_key("lib/plugin.so"));
        manifest.write(dir.path()).unwrap();

        // the manifest never lists itself
        let rebuilt = ChecksumManifest::build(dir.path(), "7.14.3").unwrap();
        assert_eq!(rebuilt, manifest);

        let loaded = ChecksumManifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, manifest);
        loaded.verify(dir.path()).unwrap();
    }

    #[test]
    fn test_tampered_file_fails() {
        let dir = TempDir::new().unwrap();
        install(dir.path());
        let manifest = ChecksumManifest::build(dir.path(), "1.0.0").unwrap();

        fs::write(dir.path().join("server"), b"tampered").unwrap();
        match manifest.verify(dir.path()) {
            Err(Error::ChecksumMismatch { file, .. }) => assert_eq!(file, "server"),
            other => panic!("expected checksum mismatch, got {:?}", other),
        }

        fs::remove_file(dir.path().join("server")).unwrap();
        assert!(matches!(
            manifest.verify(dir.path()),
            Err(Error::BinaryValidation(_))
        ));
    }

    #[test]
    fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        assert!(ChecksumManifest::load(dir.path()).unwrap().is_none());
    }
}
