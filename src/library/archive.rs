use super::Retrieve;
use crate::config::ArchiveConfig;
use crate::context::Context;
use crate::download::{self, DownloadOptions, ExpectedHash, Fetcher};
use crate::ui;
use anyhow::{Context as _, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// A source shipped as a hash-verified archive.
pub struct ArchiveSource {
    url: String,
    file_name: String,
    expected: ExpectedHash,
    verify_existing: bool,
    fetcher: Box<dyn Fetcher>,
}

impl ArchiveSource {
    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self {
            url: config.url.clone(),
            file_name: config.file_name().to_string(),
            expected: ExpectedHash {
                hex: config.hash.clone(),
                algorithm: config.algorithm,
            },
            verify_existing: config.verify_existing,
            fetcher: download::fetcher_for(&config.url),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Box<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    /// Downloaded archives sit next to the extracted folders.
    pub fn archive_path(&self, ctx: &Context) -> PathBuf {
        ctx.libraries_dir().join(&self.file_name)
    }
}

impl Retrieve for ArchiveSource {
    fn kind(&self) -> &'static str {
        "archive"
    }

    fn version_key(&self) -> Option<String> {
        Some(self.expected.hex.clone())
    }

    fn retrieve(&self, ctx: &Context, dir: &Path) -> Result<()> {
        let archive = self.archive_path(ctx);
        download::download_if_missing(
            self.fetcher.as_ref(),
            &self.url,
            &archive,
            &self.expected,
            DownloadOptions {
                attempts: ctx.settings.download_attempts,
                skip_check_if_present: !self.verify_existing,
            },
        )?;

        if dir.exists() {
            return Ok(());
        }
        ui::info(format!("Extracting {} to {}", self.file_name, dir.display()));
        unpack_into(&archive, dir)
    }

    fn requires_clone(&self, dir: &Path) -> bool {
        !dir.exists()
    }

    fn is_using_specific_commit(&self) -> bool {
        false
    }

    fn make_sure_right_commit_is_checked_out(&self, _ctx: &Context, _dir: &Path) -> Result<()> {
        Ok(())
    }
}

/// Extracts next to `dir` first. A single top-level folder in the archive becomes `dir` itself.
fn unpack_into(archive: &Path, dir: &Path) -> Result<()> {
    let staging = staging_dir(dir);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    download::extract_archive(archive, &staging)?;

    let entries: Vec<PathBuf> = fs::read_dir(&staging)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    let content_root = match entries.as_slice() {
        [single] if single.is_dir() => single.clone(),
        _ => staging.clone(),
    };

    fs::rename(&content_root, dir)
        .with_context(|| format!("Failed to move extracted files to {}", dir.display()))?;
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    Ok(())
}

/// `<dir>.partial`, keeping dotted folder names like `zlib-1.2.11` intact.
fn staging_dir(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dir.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::HashAlgorithm;
    use std::cell::Cell;
    use std::fs::File;
    use std::io::Write;

    struct ZipFetcher {
        body: Vec<u8>,
        calls: Cell<u32>,
    }

    impl Fetcher for ZipFetcher {
        fn fetch(&self, _url: &str, target: &Path) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            fs::write(target, &self.body)?;
            Ok(())
        }
    }

    fn zip_bytes(dir: &Path, entries: &[(&str, &str)]) -> Vec<u8> {
        let path = dir.join("build.zip");
        {
            let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        let bytes = fs::read(&path).unwrap();
        fs::remove_file(&path).unwrap();
        bytes
    }

    fn source_for(body: Vec<u8>, dir: &Path) -> (ArchiveSource, PathBuf) {
        let digest_path = dir.join("digest.tmp");
        fs::write(&digest_path, &body).unwrap();
        let hash = HashAlgorithm::Sha256.digest_file(&digest_path).unwrap();
        fs::remove_file(&digest_path).unwrap();

        let config = ArchiveConfig {
            url: "https://example.com/fmt-10.2.1.zip".to_string(),
            hash,
            algorithm: HashAlgorithm::Sha256,
            file: None,
            verify_existing: true,
        };
        let source = ArchiveSource::from_config(&config).with_fetcher(Box::new(ZipFetcher {
            body,
            calls: Cell::new(0),
        }));
        (source, dir.join("ThirdParty").join("fmt"))
    }

    #[test]
    fn test_single_top_level_folder_is_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let body = zip_bytes(
            dir.path(),
            &[("fmt-10.2.1/CMakeLists.txt", "project(fmt)"), ("fmt-10.2.1/include/fmt.h", "")],
        );
        let (source, target) = source_for(body, dir.path());
        let ctx = Context::for_tests(dir.path());

        assert!(source.requires_clone(&target));
        source.retrieve(&ctx, &target).unwrap();
        assert!(target.join("CMakeLists.txt").exists());
        assert!(target.join("include").join("fmt.h").exists());
        assert!(source.archive_path(&ctx).exists());
        assert!(!staging_dir(&target).exists());
    }

    #[test]
    fn test_flat_archive_extracts_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let body = zip_bytes(dir.path(), &[("a.h", "a"), ("b.h", "b")]);
        let (source, target) = source_for(body, dir.path());
        let ctx = Context::for_tests(dir.path());

        source.retrieve(&ctx, &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("a.h")).unwrap(), "a");
        assert_eq!(fs::read_to_string(target.join("b.h")).unwrap(), "b");
    }

    #[test]
    fn test_existing_extraction_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let body = zip_bytes(dir.path(), &[("a.h", "a")]);
        let (source, target) = source_for(body, dir.path());
        let ctx = Context::for_tests(dir.path());

        source.retrieve(&ctx, &target).unwrap();
        fs::write(target.join("a.h"), "patched").unwrap();
        source.retrieve(&ctx, &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("a.h")).unwrap(), "patched");
        assert!(!source.is_using_specific_commit());
    }

    #[test]
    fn test_dotted_folder_name_stages_beside_itself() {
        let dir = tempfile::tempdir().unwrap();
        let libraries = dir.path().join("ThirdParty");
        let target = libraries.join("zlib-1.2.11");
        assert_eq!(staging_dir(&target), libraries.join("zlib-1.2.11.partial"));

        let neighbour = libraries.join("zlib-1.2.partial");
        fs::create_dir_all(&neighbour).unwrap();
        fs::write(neighbour.join("keep.txt"), "keep").unwrap();

        let archive = dir.path().join("zlib.zip");
        fs::write(&archive, zip_bytes(dir.path(), &[("zlib.h", "z")])).unwrap();
        unpack_into(&archive, &target).unwrap();

        assert_eq!(fs::read_to_string(target.join("zlib.h")).unwrap(), "z");
        assert!(neighbour.join("keep.txt").exists());
        assert!(!staging_dir(&target).exists());
    }
}
