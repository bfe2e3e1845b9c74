//! Precompiled packages: finding them, installing them, and creating them.
//!
//! An index (`index.json`) lists zip packages keyed by library name, platform
//! tag and build type. When the resolver finds a match for an enabled library
//! the installer extracts the package into the install prefix instead of
//! building the library from source.

use crate::context::Context;
use crate::download::{self, DownloadOptions, ExpectedHash, HashAlgorithm};
use crate::library::Dependency;
use crate::platform;
use crate::ui;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

pub const INDEX_FILE: &str = "index.json";

/// A ready-made build of one library.
pub trait Precompiled {
    fn name(&self) -> &str;
    /// Downloads the package unless an intact copy is already cached.
    fn retrieve(&self, ctx: &Context) -> Result<()>;
    /// Extracts the package into the install prefix.
    fn install(&self, ctx: &Context) -> Result<()>;
}

pub trait PrecompiledResolver {
    fn find(&self, library: &dyn Dependency, ctx: &Context) -> Option<Box<dyn Precompiled>>;
}

/// Resolver used when no index is configured.
pub struct NoPrecompiled;

impl PrecompiledResolver for NoPrecompiled {
    fn find(&self, _library: &dyn Dependency, _ctx: &Context) -> Option<Box<dyn Precompiled>> {
        None
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PrecompiledIndex {
    #[serde(default)]
    pub packages: Vec<IndexEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub name: String,
    pub platform: String,
    pub build_type: String,
    /// Commit, tag or archive hash the package was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Absolute URL, or a path relative to the index location.
    pub url: String,
    pub hash: String,
    #[serde(default)]
    pub algorithm: HashAlgorithm,
}

impl IndexEntry {
    fn matches(&self, library: &dyn Dependency, platform: &str, build_type: &str) -> bool {
        self.name.eq_ignore_ascii_case(library.name())
            && self.platform == platform
            && self.build_type == build_type
            && self
                .version
                .as_ref()
                .is_none_or(|version| library.version_key().as_ref() == Some(version))
    }
}

pub struct IndexResolver {
    index: PrecompiledIndex,
    /// Where relative package URLs are resolved from.
    base: String,
    platform: String,
}

impl IndexResolver {
    pub fn new(index: PrecompiledIndex, base: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            index,
            base: base.into(),
            platform: platform.into(),
        }
    }

    /// Reads an index from a URL or a file path (relative to `root`).
    pub fn load(location: &str, root: &Path) -> Result<Self> {
        if download::is_remote_url(location) {
            ui::info(format!("Fetching precompiled index {}", location));
            let index: PrecompiledIndex = ureq::get(location)
                .call()
                .map_err(|e| anyhow::anyhow!("Failed to fetch precompiled index: {}", e))?
                .body_mut()
                .read_json()
                .map_err(|e| anyhow::anyhow!("Invalid precompiled index {}: {}", location, e))?;
            let base = location
                .rsplit_once('/')
                .map_or(location, |(base, _)| base)
                .to_string();
            return Ok(Self::new(index, base, platform::platform_tag()));
        }

        let path = root.join(location.strip_prefix("file://").unwrap_or(location));
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read precompiled index {}", path.display()))?;
        let index: PrecompiledIndex = serde_json::from_str(&content)
            .with_context(|| format!("Invalid precompiled index {}", path.display()))?;
        let base = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(index, base, platform::platform_tag()))
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.contains("://") || Path::new(url).is_absolute() {
            url.to_string()
        } else if download::is_remote_url(&self.base) {
            format!("{}/{}", self.base, url)
        } else {
            Path::new(&self.base).join(url).to_string_lossy().into_owned()
        }
    }
}

impl PrecompiledResolver for IndexResolver {
    fn find(&self, library: &dyn Dependency, ctx: &Context) -> Option<Box<dyn Precompiled>> {
        let entry = self
            .index
            .packages
            .iter()
            .find(|e| e.matches(library, &self.platform, &ctx.settings.build_type))?;
        Some(Box::new(PrecompiledPackage {
            name: library.name().to_string(),
            url: self.resolve_url(&entry.url),
            expected: ExpectedHash {
                hex: entry.hash.clone(),
                algorithm: entry.algorithm,
            },
        }))
    }
}

pub struct PrecompiledPackage {
    name: String,
    url: String,
    expected: ExpectedHash,
}

impl PrecompiledPackage {
    fn archive_path(&self, ctx: &Context) -> PathBuf {
        let file = self
            .url
            .rsplit(['/', '\\'])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name);
        ctx.precompiled_cache_dir().join(file)
    }
}

impl Precompiled for PrecompiledPackage {
    fn name(&self) -> &str {
        &self.name
    }

    fn retrieve(&self, ctx: &Context) -> Result<()> {
        let fetcher = download::fetcher_for(&self.url);
        download::download_if_missing(
            fetcher.as_ref(),
            &self.url,
            &self.archive_path(ctx),
            &self.expected,
            DownloadOptions {
                attempts: ctx.settings.download_attempts,
                skip_check_if_present: false,
            },
        )
        .with_context(|| format!("Failed to retrieve precompiled {}", self.name))?;
        Ok(())
    }

    fn install(&self, ctx: &Context) -> Result<()> {
        let prefix = ctx.install_prefix();
        ui::info(format!("Extracting precompiled {} to {}", self.name, prefix.display()));
        download::extract_archive(&self.archive_path(ctx), &prefix)
    }
}

fn sanitize_for_path(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Zips the installed files of each library and writes (or updates) `index.json` in `out_dir`.
pub fn create_packages(
    libraries: &[&dyn Dependency],
    ctx: &Context,
    out_dir: &Path,
) -> Result<PrecompiledIndex> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let index_path = out_dir.join(INDEX_FILE);
    let mut index: PrecompiledIndex = if index_path.exists() {
        serde_json::from_str(&fs::read_to_string(&index_path)?)
            .with_context(|| format!("Invalid existing index {}", index_path.display()))?
    } else {
        PrecompiledIndex::default()
    };

    let platform = platform::platform_tag();
    let build_type = &ctx.settings.build_type;
    let prefix = ctx.install_prefix();

    for library in libraries {
        let Some(files) = library.installed_files() else {
            ui::warning(format!(
                "{} has no installed_files, can't create a precompiled package for it",
                library.name()
            ));
            continue;
        };

        let file_name = format!(
            "{}-{}-{}.zip",
            sanitize_for_path(library.name()),
            platform,
            build_type
        );
        let zip_path = out_dir.join(&file_name);
        write_package(&zip_path, &prefix, files)
            .with_context(|| format!("Failed to package {}", library.name()))?;

        let entry = IndexEntry {
            name: library.name().to_string(),
            platform: platform.clone(),
            build_type: build_type.clone(),
            version: library.version_key(),
            url: file_name,
            hash: HashAlgorithm::Sha256.digest_file(&zip_path)?,
            algorithm: HashAlgorithm::Sha256,
        };
        index.packages.retain(|e| {
            !(e.name.eq_ignore_ascii_case(&entry.name)
                && e.platform == entry.platform
                && e.build_type == entry.build_type)
        });
        index.packages.push(entry);
        ui::success(format!("Created {}", zip_path.display()));
    }

    fs::write(&index_path, serde_json::to_string_pretty(&index)?)
        .with_context(|| format!("Failed to write {}", index_path.display()))?;
    Ok(index)
}

fn write_package(zip_path: &Path, prefix: &Path, files: &[String]) -> Result<()> {
    let mut zip = zip::ZipWriter::new(File::create(zip_path)?);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in files {
        let path = prefix.join(entry);
        if !path.exists() {
            anyhow::bail!("'{}' is not installed in {}", entry, prefix.display());
        }
        for item in WalkDir::new(&path).into_iter().filter_map(|e| e.ok()) {
            if !item.file_type().is_file() {
                continue;
            }
            let name = item
                .path()
                .strip_prefix(prefix)?
                .to_string_lossy()
                .replace('\\', "/");
            zip.start_file(name, options)?;
            io::copy(&mut File::open(item.path())?, &mut zip)?;
        }
    }
    zip.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::{Enable, Prerequisites};

    struct Stub {
        name: &'static str,
        version: Option<String>,
        files: Option<Vec<String>>,
    }

    impl Dependency for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn folder_name(&self) -> &str {
            self.name
        }
        fn source_kind(&self) -> &'static str {
            "git"
        }
        fn version_key(&self) -> Option<String> {
            self.version.clone()
        }
        fn installed_files(&self) -> Option<&[String]> {
            self.files.as_deref()
        }
        fn retrieve(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn requires_clone(&self, _ctx: &Context) -> bool {
            false
        }
        fn is_using_specific_commit(&self) -> bool {
            false
        }
        fn make_sure_right_commit_is_checked_out(&self, _ctx: &Context) -> Result<()> {
            Ok(())
        }
        fn setup(&self, _ctx: &mut Context) -> Result<()> {
            Ok(())
        }
        fn compile(&self, _ctx: &mut Context) -> Result<()> {
            Ok(())
        }
        fn install(&self, _ctx: &mut Context) -> Result<()> {
            Ok(())
        }
        fn prerequisites(&self) -> Option<&dyn Prerequisites> {
            None
        }
        fn enabler(&self) -> Option<&dyn Enable> {
            None
        }
    }

    fn entry(name: &str, build_type: &str, version: Option<&str>) -> IndexEntry {
        IndexEntry {
            name: name.to_string(),
            platform: "linux-x86_64".to_string(),
            build_type: build_type.to_string(),
            version: version.map(str::to_string),
            url: format!("{}.zip", name),
            hash: "00".to_string(),
            algorithm: HashAlgorithm::Sha256,
        }
    }

    #[test]
    fn test_index_matching_rules() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::for_tests(dir.path());
        let index = PrecompiledIndex {
            packages: vec![
                entry("Zlib", "RelWithDebInfo", None),
                entry("fmt", "Debug", None),
                entry("glm", "RelWithDebInfo", Some("1.0.1")),
            ],
        };
        let resolver = IndexResolver::new(index, "https://example.com/pkgs", "linux-x86_64");
        let lib = |name, version: Option<&str>| Stub {
            name,
            version: version.map(str::to_string),
            files: None,
        };

        let zlib = resolver.find(&lib("zlib", None), &ctx).unwrap();
        assert_eq!(zlib.name(), "zlib");
        assert!(resolver.find(&lib("fmt", None), &ctx).is_none());
        assert!(resolver.find(&lib("glm", Some("0.9.9")), &ctx).is_none());
        assert!(resolver.find(&lib("glm", Some("1.0.1")), &ctx).is_some());
        assert!(resolver.find(&lib("boost", None), &ctx).is_none());
    }

    #[test]
    fn test_relative_urls_resolve_against_index() {
        let resolver = IndexResolver::new(PrecompiledIndex::default(), "https://example.com/pkgs", "x");
        assert_eq!(resolver.resolve_url("a.zip"), "https://example.com/pkgs/a.zip");
        assert_eq!(resolver.resolve_url("https://cdn/b.zip"), "https://cdn/b.zip");
    }

    #[test]
    fn test_create_then_install_package() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::for_tests(dir.path());
        let prefix = ctx.install_prefix();
        fs::create_dir_all(prefix.join("include/zlib")).unwrap();
        fs::write(prefix.join("include/zlib/zlib.h"), "// zlib").unwrap();
        fs::create_dir_all(prefix.join("lib")).unwrap();
        fs::write(prefix.join("lib/libz.a"), "archive").unwrap();

        let zlib = Stub {
            name: "zlib",
            version: Some("v1.3".to_string()),
            files: Some(vec!["include/zlib".into(), "lib/libz.a".into()]),
        };
        let out = dir.path().join("packages");
        let index = create_packages(&[&zlib as &dyn Dependency], &ctx, &out).unwrap();
        assert_eq!(index.packages.len(), 1);
        let written: PrecompiledIndex =
            serde_json::from_str(&fs::read_to_string(out.join(INDEX_FILE)).unwrap()).unwrap();
        assert_eq!(written.packages, index.packages);

        // Creating again replaces the entry instead of duplicating it
        let index = create_packages(&[&zlib as &dyn Dependency], &ctx, &out).unwrap();
        assert_eq!(index.packages.len(), 1);

        let resolver = IndexResolver::load(&out.join(INDEX_FILE).to_string_lossy(), dir.path()).unwrap();
        let package = resolver.find(&zlib, &ctx).unwrap();
        fs::remove_dir_all(&prefix).unwrap();

        package.retrieve(&ctx).unwrap();
        assert!(
            ctx.precompiled_cache_dir()
                .join(format!("zlib-{}-RelWithDebInfo.zip", platform::platform_tag()))
                .exists()
        );
        package.install(&ctx).unwrap();
        assert_eq!(
            fs::read_to_string(prefix.join("include/zlib/zlib.h")).unwrap(),
            "// zlib"
        );
        assert!(prefix.join("lib/libz.a").exists());
    }
}
