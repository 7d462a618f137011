//! Adapters for the collaborators fleetsync drives but does not own

pub mod download;
pub mod service;

pub use download::{extract_tar_gz, Downloader, HttpDownloader};
pub use service::{ServiceManager, SystemdServiceManager};
