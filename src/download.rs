//! Archive downloads with hash verification, and archive extraction.
//!
//! A download is only accepted once its digest matches. A mismatching or
//! partial file is deleted before the next attempt, and the number of
//! attempts is bounded.

use crate::ui;
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "sha256")]
    Sha256,
    #[serde(rename = "sha3-256")]
    Sha3_256,
    /// Only for sources that publish nothing better.
    #[serde(rename = "sha1")]
    Sha1,
}

impl HashAlgorithm {
    /// Lowercase hex digest of the file contents.
    pub fn digest_file(self, path: &Path) -> Result<String> {
        let file = File::open(path).with_context(|| {
            format!(
                "Failed to open file for hash verification: {}",
                path.display()
            )
        })?;
        match self {
            HashAlgorithm::Sha256 => digest_reader::<Sha256>(file),
            HashAlgorithm::Sha3_256 => digest_reader::<Sha3_256>(file),
            HashAlgorithm::Sha1 => digest_reader::<Sha1>(file),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => write!(f, "sha256"),
            HashAlgorithm::Sha3_256 => write!(f, "sha3-256"),
            HashAlgorithm::Sha1 => write!(f, "sha1"),
        }
    }
}

fn digest_reader<D>(mut reader: impl Read) -> Result<String>
where
    D: Digest,
    sha2::digest::Output<D>: fmt::LowerHex,
{
    let mut hasher = D::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug)]
pub enum DownloadError {
    /// Every attempt produced a file whose digest did not match.
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
        attempts: u32,
    },
    /// The transfer itself failed on the last attempt.
    Transfer { url: String, attempts: u32, source: anyhow::Error },
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadError::HashMismatch {
                path,
                expected,
                actual,
                attempts,
            } => write!(
                f,
                "Downloaded file {} hash doesn't match expected hash after {} attempts, {} != {}",
                path.display(),
                attempts,
                actual,
                expected
            ),
            DownloadError::Transfer { url, attempts, .. } => {
                write!(f, "Downloading '{}' failed after {} attempts", url, attempts)
            }
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DownloadError::Transfer { source, .. } => Some(&**source),
            DownloadError::HashMismatch { .. } => None,
        }
    }
}

/// Moves the bytes behind a URL into a local file.
pub trait Fetcher {
    fn fetch(&self, url: &str, target: &Path) -> Result<()>;
}

/// HTTP(S) fetcher with a progress bar.
pub struct HttpFetcher;

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, target: &Path) -> Result<()> {
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow::anyhow!("Download failed: {}", e))?;

        let total_size = response
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let pb = ProgressBar::new(total_size);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.blue} [{elapsed_precise}] [{bar:40.green/black}] {bytes}/{total_bytes} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("━━╸"),
        );

        let mut file = File::create(target)
            .with_context(|| format!("Failed to create {}", target.display()))?;
        let mut reader = pb.wrap_read(response.into_body().into_reader());
        io::copy(&mut reader, &mut file)?;
        pb.finish_and_clear();
        Ok(())
    }
}

/// Copies from a local path. Accepts plain paths and `file://` URLs.
pub struct LocalFetcher;

impl Fetcher for LocalFetcher {
    fn fetch(&self, url: &str, target: &Path) -> Result<()> {
        let source = url.strip_prefix("file://").unwrap_or(url);
        fs::copy(source, target)
            .with_context(|| format!("Failed to copy {} to {}", source, target.display()))?;
        Ok(())
    }
}

pub fn is_remote_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Picks the fetcher able to handle `url`.
pub fn fetcher_for(url: &str) -> Box<dyn Fetcher> {
    if is_remote_url(url) {
        Box::new(HttpFetcher)
    } else {
        Box::new(LocalFetcher)
    }
}

/// What a download must hash to.
#[derive(Debug, Clone)]
pub struct ExpectedHash {
    pub hex: String,
    pub algorithm: HashAlgorithm,
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadOptions {
    /// Total number of downloads tried before giving up.
    pub attempts: u32,
    /// Trust an existing file without hashing it again.
    pub skip_check_if_present: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            attempts: 5,
            skip_check_if_present: false,
        }
    }
}

/// Downloads `url` to `target` unless it is already there, then checks its hash.
///
/// Returns the number of transfers performed (0 when an existing file was accepted).
pub fn download_if_missing(
    fetcher: &dyn Fetcher,
    url: &str,
    target: &Path,
    expected: &ExpectedHash,
    options: DownloadOptions,
) -> Result<u32> {
    if expected.hex.trim().is_empty() {
        anyhow::bail!("No hash configured for download of '{}'", url);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let attempts = options.attempts.max(1);
    let mut transfers = 0;

    loop {
        if target.exists() {
            if transfers == 0 && options.skip_check_if_present {
                return Ok(0);
            }
            if transfers == 0 {
                ui::info(format!(
                    "Making sure already downloaded file is intact: '{}'",
                    target.display()
                ));
            }
        } else {
            ui::info(format!(
                "Downloading url: '{}' to file: '{}'",
                url,
                target.display()
            ));
            transfers += 1;
            if let Err(e) = fetcher.fetch(url, target) {
                ui::error(format!("Download failed: {:#}", e));
                let _ = fs::remove_file(target);
                if transfers >= attempts {
                    return Err(DownloadError::Transfer {
                        url: url.to_string(),
                        attempts: transfers,
                        source: e,
                    }
                    .into());
                }
                ui::info(format!(
                    "Attempting download again, attempts left: {}",
                    attempts - transfers
                ));
                continue;
            }
            if !target.exists() {
                anyhow::bail!("Failed to write download to file {}", target.display());
            }
        }

        let actual = expected.algorithm.digest_file(target)?;
        if actual == expected.hex {
            ui::success("Done downloading");
            return Ok(transfers);
        }

        fs::remove_file(target)
            .with_context(|| format!("Failed to delete corrupt file {}", target.display()))?;
        if transfers >= attempts {
            return Err(DownloadError::HashMismatch {
                path: target.to_path_buf(),
                expected: expected.hex.clone(),
                actual,
                attempts: transfers,
            }
            .into());
        }
        ui::error(format!(
            "Downloaded file hash doesn't match expected hash, {} != {}",
            actual, expected.hex
        ));
        ui::info(format!(
            "Attempting download again, attempts left: {}",
            attempts - transfers
        ));
    }
}

/// Extracts a `.zip`, `.tar.gz` / `.tgz` or plain `.tar` archive into `target_dir`.
pub fn extract_archive(archive_path: &Path, target_dir: &Path) -> Result<()> {
    let name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    fs::create_dir_all(target_dir)?;

    if name.ends_with(".zip") {
        extract_zip(archive_path, target_dir)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let file = File::open(archive_path)?;
        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
        archive
            .unpack(target_dir)
            .with_context(|| format!("Failed to extract {}", archive_path.display()))
    } else if name.ends_with(".tar") {
        let mut archive = tar::Archive::new(File::open(archive_path)?);
        archive
            .unpack(target_dir)
            .with_context(|| format!("Failed to extract {}", archive_path.display()))
    } else {
        anyhow::bail!(
            "Don't know how to extract '{}' (supported: .zip, .tar.gz, .tgz, .tar)",
            archive_path.display()
        )
    }
}

fn extract_zip(archive_path: &Path, target_dir: &Path) -> Result<()> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Invalid zip archive {}", archive_path.display()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let outpath = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => continue,
        };

        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(p) = outpath.parent() {
                fs::create_dir_all(p)?;
            }
            let mut outfile = File::create(&outpath)?;
            io::copy(&mut entry, &mut outfile)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;

    struct StaticFetcher {
        body: Vec<u8>,
        calls: Cell<u32>,
    }

    impl StaticFetcher {
        fn new(body: &[u8]) -> Self {
            Self {
                body: body.to_vec(),
                calls: Cell::new(0),
            }
        }
    }

    impl Fetcher for StaticFetcher {
        fn fetch(&self, _url: &str, target: &Path) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            fs::write(target, &self.body)?;
            Ok(())
        }
    }

    struct FailingFetcher {
        calls: Cell<u32>,
    }

    impl Fetcher for FailingFetcher {
        fn fetch(&self, _url: &str, target: &Path) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            // Leave a partial file behind like an interrupted transfer
            fs::write(target, b"partial")?;
            anyhow::bail!("connection reset")
        }
    }

    // sha256("hello")
    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn expected(hex: &str, algorithm: HashAlgorithm) -> ExpectedHash {
        ExpectedHash {
            hex: hex.to_string(),
            algorithm,
        }
    }

    #[test]
    fn test_digests_of_known_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        fs::write(&path, b"hello").unwrap();

        assert_eq!(
            HashAlgorithm::Sha256.digest_file(&path).unwrap(),
            HELLO_SHA256
        );
        assert_eq!(
            HashAlgorithm::Sha1.digest_file(&path).unwrap(),
            "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"
        );
        assert_eq!(
            HashAlgorithm::Sha3_256.digest_file(&path).unwrap(),
            "3338be694f50c5f338814986cdf0686453a888b84f424d792af4b9202398f392"
        );
    }

    #[test]
    fn test_matching_hash_accepted_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("lib.zip");
        let fetcher = StaticFetcher::new(b"hello");

        let transfers = download_if_missing(
            &fetcher,
            "https://example.com/lib.zip",
            &target,
            &expected(HELLO_SHA256, HashAlgorithm::Sha256),
            DownloadOptions::default(),
        )
        .unwrap();

        assert_eq!(transfers, 1);
        assert_eq!(fetcher.calls.get(), 1);
        assert!(target.exists());
    }

    #[test]
    fn test_mismatch_retries_configured_attempts_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("lib.zip");
        let fetcher = StaticFetcher::new(b"not what we wanted");

        let err = download_if_missing(
            &fetcher,
            "https://example.com/lib.zip",
            &target,
            &expected(HELLO_SHA256, HashAlgorithm::Sha256),
            DownloadOptions {
                attempts: 3,
                skip_check_if_present: false,
            },
        )
        .unwrap_err();

        assert_eq!(fetcher.calls.get(), 3);
        assert!(!target.exists(), "corrupt download must be deleted");
        assert!(matches!(
            err.downcast_ref::<DownloadError>(),
            Some(DownloadError::HashMismatch { attempts: 3, .. })
        ));
    }

    #[test]
    fn test_hash_comparison_is_case_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("lib.zip");
        let fetcher = StaticFetcher::new(b"hello");

        let result = download_if_missing(
            &fetcher,
            "https://example.com/lib.zip",
            &target,
            &expected(&HELLO_SHA256.to_uppercase(), HashAlgorithm::Sha256),
            DownloadOptions {
                attempts: 1,
                skip_check_if_present: false,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_transfer_failure_deletes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("lib.zip");
        let fetcher = FailingFetcher {
            calls: Cell::new(0),
        };

        let err = download_if_missing(
            &fetcher,
            "https://example.com/lib.zip",
            &target,
            &expected(HELLO_SHA256, HashAlgorithm::Sha256),
            DownloadOptions {
                attempts: 2,
                skip_check_if_present: false,
            },
        )
        .unwrap_err();

        assert_eq!(fetcher.calls.get(), 2);
        assert!(!target.exists());
        assert!(matches!(
            err.downcast_ref::<DownloadError>(),
            Some(DownloadError::Transfer { attempts: 2, .. })
        ));
    }

    #[test]
    fn test_existing_intact_file_is_not_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("lib.zip");
        fs::write(&target, b"hello").unwrap();
        let fetcher = StaticFetcher::new(b"hello");

        let transfers = download_if_missing(
            &fetcher,
            "https://example.com/lib.zip",
            &target,
            &expected(HELLO_SHA256, HashAlgorithm::Sha256),
            DownloadOptions::default(),
        )
        .unwrap();
        assert_eq!(transfers, 0);
        assert_eq!(fetcher.calls.get(), 0);
    }

    #[test]
    fn test_existing_corrupt_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("lib.zip");
        fs::write(&target, b"stale").unwrap();
        let fetcher = StaticFetcher::new(b"hello");

        let transfers = download_if_missing(
            &fetcher,
            "https://example.com/lib.zip",
            &target,
            &expected(HELLO_SHA256, HashAlgorithm::Sha256),
            DownloadOptions::default(),
        )
        .unwrap();
        assert_eq!(transfers, 1);
        assert_eq!(fs::read(&target).unwrap(), b"hello");
    }

    #[test]
    fn test_skip_check_trusts_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("lib.zip");
        fs::write(&target, b"anything").unwrap();
        let fetcher = StaticFetcher::new(b"hello");

        let transfers = download_if_missing(
            &fetcher,
            "https://example.com/lib.zip",
            &target,
            &expected(HELLO_SHA256, HashAlgorithm::Sha256),
            DownloadOptions {
                attempts: 5,
                skip_check_if_present: true,
            },
        )
        .unwrap();
        assert_eq!(transfers, 0);
    }

    #[test]
    fn test_missing_hash_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::new(b"hello");
        let result = download_if_missing(
            &fetcher,
            "https://example.com/lib.zip",
            &dir.path().join("lib.zip"),
            &expected("", HashAlgorithm::Sha256),
            DownloadOptions::default(),
        );
        assert!(result.is_err());
        assert_eq!(fetcher.calls.get(), 0);
    }

    #[test]
    fn test_extract_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("pkg.zip");
        {
            let file = File::create(&archive_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file("include/lib.h", options).unwrap();
            writer.write_all(b"#pragma once\n").unwrap();
            writer.finish().unwrap();
        }

        let out = dir.path().join("out");
        extract_archive(&archive_path, &out).unwrap();
        assert_eq!(
            fs::read_to_string(out.join("include").join("lib.h")).unwrap(),
            "#pragma once\n"
        );
    }

    #[test]
    fn test_extract_unknown_format_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("pkg.7z");
        fs::write(&archive_path, b"").unwrap();
        assert!(extract_archive(&archive_path, &dir.path().join("out")).is_err());
    }

    #[test]
    fn test_local_fetcher_handles_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        fs::write(&source, b"payload").unwrap();
        let target = dir.path().join("copy.bin");

        let url = format!("file://{}", source.display());
        assert!(!is_remote_url(&url));
        fetcher_for(&url).fetch(&url, &target).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"payload");
        assert!(is_remote_url("https://example.com/a.zip"));
    }
}
