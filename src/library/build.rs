use super::Build;
use crate::context::Context;
use crate::exec::{self, OutputStyle};
use crate::ui;
use anyhow::{Context as _, Result};
use regex::Regex;
use semver::Version;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Oldest cmake that understands `--build --parallel`.
pub const MIN_CMAKE_VERSION: &str = "3.12.0";

pub fn parse_cmake_version(output: &str) -> Option<Version> {
    let re = Regex::new(r"cmake version (\d+)\.(\d+)(?:\.(\d+))?").ok()?;
    let caps = re.captures(output)?;
    let part = |i: usize| caps.get(i).map_or("0", |m| m.as_str());
    Version::parse(&format!("{}.{}.{}", part(1), part(2), part(3))).ok()
}

/// Makes sure a new enough cmake is on the search path.
pub fn check_cmake(ctx: &Context) -> Result<Version> {
    ctx.env.require_command("cmake")?;
    let mut cmd = ctx.env.command("cmake");
    cmd.arg("--version");
    let (_, output) = exec::run_capture(&mut cmd)?;
    let version = parse_cmake_version(&output)
        .with_context(|| format!("Unrecognized 'cmake --version' output: {}", output.trim()))?;
    let minimum = Version::parse(MIN_CMAKE_VERSION)?;
    if version < minimum {
        anyhow::bail!(
            "cmake {} is too old, at least {} is required",
            version,
            MIN_CMAKE_VERSION
        );
    }
    Ok(version)
}

/// Arguments for configuring `source` from inside its build directory.
pub fn configure_args(
    ctx: &Context,
    source: &Path,
    options: &BTreeMap<String, String>,
    extra: &[String],
) -> Vec<String> {
    let mut args = vec![
        source.to_string_lossy().into_owned(),
        format!("-DCMAKE_BUILD_TYPE={}", ctx.settings.build_type),
        format!("-DCMAKE_INSTALL_PREFIX={}", ctx.install_prefix().display()),
        format!("-DCMAKE_PREFIX_PATH={}", ctx.cmake_prefix_path_arg()),
    ];
    args.extend(options.iter().map(|(k, v)| format!("-D{}={}", k, v)));
    args.extend(extra.iter().cloned());
    args
}

pub fn build_args(ctx: &Context, threads: usize, target: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--build".to_string(),
        ".".to_string(),
        "--config".to_string(),
        ctx.settings.build_type.clone(),
    ];
    match target {
        Some(target) => args.extend(["--target".to_string(), target.to_string()]),
        None => args.extend(["--parallel".to_string(), threads.max(1).to_string()]),
    }
    args
}

pub fn run_cmake(ctx: &Context, build_dir: &Path, args: &[String]) -> Result<()> {
    let mut cmd = ctx.env.command("cmake");
    cmd.args(args).current_dir(build_dir);
    exec::run_checked(&mut cmd, &OutputStyle::default())
}

pub struct CMakeBuild {
    cmake_dir: Option<String>,
    options: BTreeMap<String, String>,
}

impl CMakeBuild {
    pub fn new(cmake_dir: Option<String>, options: BTreeMap<String, String>) -> Self {
        Self { cmake_dir, options }
    }

    pub fn build_dir(source_dir: &Path) -> PathBuf {
        source_dir.join("build")
    }

    pub fn cmake_source(&self, source_dir: &Path) -> PathBuf {
        match &self.cmake_dir {
            Some(sub) => source_dir.join(sub),
            None => source_dir.to_path_buf(),
        }
    }
}

impl Build for CMakeBuild {
    fn setup(&self, ctx: &Context, source_dir: &Path) -> Result<()> {
        check_cmake(ctx)?;
        let build_dir = Self::build_dir(source_dir);
        fs::create_dir_all(&build_dir)
            .with_context(|| format!("Failed to create {}", build_dir.display()))?;
        let args = configure_args(ctx, &self.cmake_source(source_dir), &self.options, &[]);
        run_cmake(ctx, &build_dir, &args)
    }

    fn compile(&self, ctx: &Context, source_dir: &Path) -> Result<()> {
        let args = build_args(ctx, ctx.compile_threads(), None);
        run_cmake(ctx, &Self::build_dir(source_dir), &args)
    }

    fn install(&self, ctx: &Context, source_dir: &Path) -> Result<()> {
        let args = build_args(ctx, ctx.compile_threads(), Some("install"));
        run_cmake(ctx, &Self::build_dir(source_dir), &args)
    }
}

/// Header-only or prebuilt sources: copies the listed paths into the install prefix.
pub struct CopyInstall {
    files: Vec<String>,
}

impl CopyInstall {
    pub fn new(files: Vec<String>) -> Self {
        Self { files }
    }
}

impl Build for CopyInstall {
    fn setup(&self, _ctx: &Context, _source_dir: &Path) -> Result<()> {
        Ok(())
    }

    fn compile(&self, _ctx: &Context, _source_dir: &Path) -> Result<()> {
        Ok(())
    }

    fn install(&self, ctx: &Context, source_dir: &Path) -> Result<()> {
        let prefix = ctx.install_prefix();
        let mut copied = 0;
        for entry in &self.files {
            let from = source_dir.join(entry);
            if !from.exists() {
                anyhow::bail!("'{}' not found in {}", entry, source_dir.display());
            }
            copied += copy_tree(&from, &prefix.join(entry))?;
        }
        ui::info(format!("Copied {} files to {}", copied, prefix.display()));
        Ok(())
    }
}

/// Copies a file or a directory tree, returns the number of files copied.
fn copy_tree(from: &Path, to: &Path) -> Result<usize> {
    if from.is_file() {
        copy_file(from, to)?;
        return Ok(1);
    }
    let mut count = 0;
    for entry in WalkDir::new(from).into_iter().filter_map(|e| e.ok()) {
        let relative = entry.path().strip_prefix(from)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            copy_file(entry.path(), &target)?;
            count += 1;
        }
    }
    Ok(count)
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    Ok(())
}
