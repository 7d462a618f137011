//! Fetching and unpacking release archives

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::common::hash::parse_checksum_file;
use crate::common::utils::{format_bytes, temp_sibling};
use crate::common::{Error, Result};

/// Transfers and unpacks one artifact into a directory
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch `url` into `target_dir`. Fails on transport, integrity or
    /// extraction errors; `target_dir` content is unspecified after a failure.
    async fn fetch(&self, url: &str, checksum_url: Option<&str>, target_dir: &Path) -> Result<()>;
}

/// Downloads a `.tar.gz` over HTTP(S), checks its SHA-256, and unpacks it
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Download(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Stream `url` into `path`, returning the SHA-256 of what was written
    async fn download_to(&self, url: &str, path: &Path) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Download(format!("GET {}: {}", url, e)))?;

        let mut file = tokio::fs::File::create(path).await?;
        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Download(format!("GET {}: {}", url, e)))?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if written == 0 {
            return Err(Error::Download(format!("{} returned an empty body", url)));
        }
        tracing::info!("Downloaded {} ({})", url, format_bytes(written));
        Ok(hex::encode(hasher.finalize()))
    }

    async fn expected_digest(&self, checksum_url: &str, file_name: &str) -> Result<String> {
        let body = self
            .client
            .get(checksum_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::Download(format!("GET {}: {}", checksum_url, e)))?
            .text()
            .await
            .map_err(|e| Error::Download(format!("GET {}: {}", checksum_url, e)))?;

        parse_checksum_file(&body, Some(file_name)).ok_or_else(|| {
            Error::Download(format!(
                "no SHA-256 digest for {} in {}",
                file_name, checksum_url
            ))
        })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &str, checksum_url: Option<&str>, target_dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(target_dir).await?;
        let archive = temp_sibling(&target_dir.with_extension("tar.gz"));

        let result = async {
            let actual = self.download_to(url, &archive).await?;

            if let Some(checksum_url) = checksum_url {
                let file_name = url.rsplit('/').next().unwrap_or(url);
                let expected = self.expected_digest(checksum_url, file_name).await?;
                if !expected.eq_ignore_ascii_case(&actual) {
                    return Err(Error::ChecksumMismatch {
                        file: file_name.to_string(),
                        expected,
                        actual,
                    });
                }
                tracing::debug!("SHA-256 of {} verified", file_name);
            } else {
                tracing::warn!("No checksum URL for {}, skipping verification", url);
            }

            let archive = archive.clone();
            let target = target_dir.to_path_buf();
            tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &target))
                .await
                .map_err(|e| Error::Download(format!("extraction task failed: {}", e)))?
        }
        .await;

        let _ = tokio::fs::remove_file(&archive).await;
        result
    }
}

/// Unpack a gzip tarball into `target`, flattening a single top-level directory
pub fn extract_tar_gz(archive: &Path, target: &Path) -> Result<()> {
    let file = fs::File::open(archive)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut tarball = tar::Archive::new(decoder);
    tarball.set_preserve_permissions(true);
    tarball
        .unpack(target)
        .map_err(|e| Error::Download(format!("cannot unpack {:?}: {}", archive, e)))?;

    flatten_single_directory(target)
}

/// Release tarballs usually wrap everything in `name/`; hoist its content
fn flatten_single_directory(target: &Path) -> Result<()> {
    let entries: Vec<PathBuf> = fs::read_dir(target)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;

    let [only] = entries.as_slice() else {
        return Ok(());
    };
    if !only.is_dir() || fs::symlink_metadata(only)?.file_type().is_symlink() {
        return Ok(());
    }

    // rename the wrapper first so a child with the same name can move up
    let wrapper = temp_sibling(only);
    fs::rename(only, &wrapper)?;
    for entry in fs::read_dir(&wrapper)? {
        let entry = entry?;
        fs::rename(entry.path(), target.join(entry.file_name()))?;
    }
    fs::remove_dir(&wrapper)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn build_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_extract_flattens_wrapper_directory() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("release.tar.gz");
        build_archive(
            &archive,
            &[
                ("worker/bin/worker", b"#!/bin/sh\n"),
                ("worker/README", b"docs"),
            ],
        );

        let target = dir.path().join("out");
        fs::create_dir(&target).unwrap();
        extract_tar_gz(&archive, &target).unwrap();

        assert!(target.join("bin").join("worker").is_file());
        assert!(target.join("README").is_file());
        assert!(!target.join("worker").exists());
    }

    #[test]
    fn test_extract_keeps_flat_layout() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("release.tar.gz");
        build_archive(&archive, &[("server", b"a"), ("client", b"b")]);

        let target = dir.path().join("out");
        fs::create_dir(&target).unwrap();
        extract_tar_gz(&archive, &target).unwrap();

        assert!(target.join("server").is_file());
        assert!(target.join("client").is_file());
    }

    #[test]
    fn test_wrapper_with_same_named_child() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("release.tar.gz");
        build_archive(&archive, &[("tool/tool", b"x")]);

        let target = dir.path().join("out");
        fs::create_dir(&target).unwrap();
        extract_tar_gz(&archive, &target).unwrap();
        assert!(target.join("tool").is_file());
    }

    #[test]
    fn test_corrupt_archive_is_a_download_error() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("release.tar.gz");
        fs::write(&archive, b"not gzip").unwrap();
        let target = dir.path().join("out");
        fs::create_dir(&target).unwrap();
        assert!(extract_tar_gz(&archive, &target).is_err());
    }
}
