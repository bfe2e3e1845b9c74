//! Configuration parsing (`setup.toml`) and run options.
//!
//! ```toml
//! [project]
//! name = "Thrive"
//! cmake_options = { BUILD_TESTING = "OFF" }
//! packages = { fedora = ["gcc-c++", "cmake"], ubuntu = ["g++", "cmake"] }
//!
//! [settings]
//! build_type = "RelWithDebInfo"
//!
//! [[library]]
//! name = "AngelScript"
//! git = "https://github.com/codecat/angelscript-mirror.git"
//! commit = "a14d2bbf7a7a8d1a0a1e4ba0e63f1e3d4b1f59e8"
//! cmake_dir = "sdk/angelscript/projects/cmake"
//! ```

use crate::download::HashAlgorithm;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "setup.toml";

#[derive(Deserialize, Debug, Default)]
pub struct SetupConfig {
    pub project: Option<ProjectConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, rename = "library")]
    pub libraries: Vec<LibraryConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
    #[serde(default)]
    pub cmake_options: BTreeMap<String, String>,
    /// Prerequisite packages of the project itself, keyed by platform id.
    pub packages: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Settings {
    pub build_type: String,
    pub libraries_dir: PathBuf,
    pub install_prefix: PathBuf,
    pub skip_pull_updates: bool,
    pub skip_package_manager: bool,
    pub pretend_linux: Option<String>,
    /// Local path or URL of a precompiled package index (JSON).
    pub precompiled_index: Option<String>,
    /// Download cache for precompiled packages. Defaults to the user cache directory.
    pub precompiled_cache: Option<PathBuf>,
    pub full_parallel: bool,
    pub full_parallel_limit: Option<usize>,
    pub download_attempts: u32,
    pub stuck_timeout_secs: u64,
    pub stuck_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            build_type: "RelWithDebInfo".to_string(),
            libraries_dir: PathBuf::from("ThirdParty"),
            install_prefix: PathBuf::from("ThirdParty/install"),
            skip_pull_updates: false,
            skip_package_manager: false,
            pretend_linux: None,
            precompiled_index: None,
            precompiled_cache: None,
            full_parallel: false,
            full_parallel_limit: None,
            download_attempts: 5,
            stuck_timeout_secs: 120,
            stuck_retries: 5,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BuildKind {
    #[default]
    Cmake,
    /// Copies `installed_files` from the source tree into the prefix.
    Copy,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ArchiveConfig {
    pub url: String,
    pub hash: String,
    #[serde(default)]
    pub algorithm: HashAlgorithm,
    /// Local file name, defaults to the last URL segment.
    pub file: Option<String>,
    /// Re-verify the hash of an already downloaded file.
    #[serde(default = "default_true")]
    pub verify_existing: bool,
}

impl ArchiveConfig {
    pub fn file_name(&self) -> &str {
        match &self.file {
            Some(file) => file,
            None => self
                .url
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("download"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct LibraryConfig {
    pub name: String,
    pub folder: Option<String>,
    pub git: Option<String>,
    pub commit: Option<String>,
    pub tag: Option<String>,
    pub branch: Option<String>,
    pub archive: Option<ArchiveConfig>,
    #[serde(default)]
    pub build: BuildKind,
    /// Directory holding the top-level CMakeLists.txt, relative to the library folder.
    pub cmake_dir: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Files (or directories) relative to the install prefix this library installs.
    pub installed_files: Option<Vec<String>>,
    pub packages: Option<BTreeMap<String, Vec<String>>>,
    /// Directories made visible to later builds once this library is installed.
    #[serde(default)]
    pub enable_paths: Vec<String>,
    /// Directories put on the search path only while this library builds.
    #[serde(default)]
    pub tool_paths: Vec<String>,
}

impl LibraryConfig {
    pub fn folder_name(&self) -> &str {
        self.folder.as_deref().unwrap_or(&self.name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("A [[library]] entry is missing its name");
        }
        match (&self.git, &self.archive) {
            (Some(_), Some(_)) => anyhow::bail!(
                "Library '{}' sets both 'git' and 'archive', pick one",
                self.name
            ),
            (None, None) => anyhow::bail!(
                "Library '{}' needs either a 'git' url or an [library.archive] table",
                self.name
            ),
            _ => {}
        }
        let pins = [&self.commit, &self.tag, &self.branch]
            .iter()
            .filter(|p| p.is_some())
            .count();
        if pins > 1 {
            anyhow::bail!(
                "Library '{}' may pin only one of 'commit', 'tag' or 'branch'",
                self.name
            );
        }
        if pins > 0 && self.git.is_none() {
            anyhow::bail!(
                "Library '{}' pins a git revision but has no 'git' url",
                self.name
            );
        }
        if self.build == BuildKind::Copy && self.installed_files.is_none() {
            anyhow::bail!(
                "Library '{}' uses build = \"copy\" which needs 'installed_files'",
                self.name
            );
        }
        Ok(())
    }
}

fn default_source_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("build")
}

fn default_true() -> bool {
    true
}

/// Loads and validates a setup file. Returns it with the directory paths resolve against.
pub fn load_config(path: &Path) -> Result<(SetupConfig, PathBuf)> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "{} not found.\n\n\
            💡 Tip: run from the project root or pass --config <FILE>.",
            path.display()
        ));
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = parse_config(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let root = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((config, root))
}

pub fn parse_config(content: &str) -> Result<SetupConfig> {
    let config: SetupConfig = toml::from_str(content)
        .context("Invalid setup file - check for syntax errors (missing quotes, brackets)")?;
    for lib in &config.libraries {
        lib.validate()?;
    }
    if config.settings.download_attempts == 0 {
        anyhow::bail!("settings.download_attempts must be at least 1");
    }
    Ok(config)
}

/// How a library name relates to the `only` / `skip` filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Enabled,
    Skipped,
    NotSelected,
}

/// Flags fixed for the whole run once arguments are parsed.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub allow_sudo: bool,
    pub skip_package_manager: bool,
    pub only: Option<Vec<String>>,
    pub skip: Vec<String>,
    pub only_main_project: bool,
    pub only_dependencies: bool,
    pub skip_pull_updates: bool,
    pub compile_threads: usize,
    pub full_parallel: bool,
    pub full_parallel_limit: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            allow_sudo: true,
            skip_package_manager: false,
            only: None,
            skip: Vec::new(),
            only_main_project: false,
            only_dependencies: false,
            skip_pull_updates: false,
            compile_threads: num_cpus::get(),
            full_parallel: false,
            full_parallel_limit: None,
        }
    }
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            skip_package_manager: settings.skip_package_manager,
            skip_pull_updates: settings.skip_pull_updates,
            full_parallel: settings.full_parallel,
            full_parallel_limit: settings.full_parallel_limit,
            ..Self::default()
        }
    }

    /// The skip list is checked first, so a library named in both lists is skipped.
    pub fn selection(&self, name: &str, folder_name: &str) -> Selection {
        let matches = |selected: &String| {
            selected.eq_ignore_ascii_case(name) || selected.eq_ignore_ascii_case(folder_name)
        };

        if self.skip.iter().any(matches) {
            return Selection::Skipped;
        }
        match &self.only {
            None => Selection::Enabled,
            Some(only) if only.iter().any(matches) => Selection::Enabled,
            Some(_) => Selection::NotSelected,
        }
    }
}
