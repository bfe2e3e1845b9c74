//! Library descriptors and the capabilities the installer drives.
//!
//! A library is anything implementing [`Dependency`]: retrieval, a
//! configure/compile/install build, and two optional capabilities:
//!
//! - [`Prerequisites`] - OS packages that must exist before building
//! - [`Enable`] - makes an installed library visible to later builds
//!
//! [`ConfiguredLibrary`] is the implementation built from a `[[library]]`
//! table, combining a [`Retrieve`] strategy (git or archive) with a
//! [`Build`] strategy (CMake or copy).

mod archive;
mod build;
mod descriptor;
mod git;
mod prerequisites;

pub use archive::ArchiveSource;
pub use build::{
    CMakeBuild, CopyInstall, MIN_CMAKE_VERSION, build_args, check_cmake, configure_args,
    parse_cmake_version, run_cmake,
};
pub use descriptor::ConfiguredLibrary;
pub use git::{GitSource, Pin};
pub use prerequisites::PackageList;

use crate::context::Context;
use anyhow::Result;
use std::fmt;
use std::path::Path;

/// One third-party library as seen by the installer.
pub trait Dependency {
    fn name(&self) -> &str;

    /// Directory name under the libraries dir. Also accepted by `--only` / `--skip`.
    fn folder_name(&self) -> &str;

    /// Short label of the retrieval method for the summary.
    fn source_kind(&self) -> &'static str;

    /// The pinned revision or archive hash, if any. Precompiled packages may be keyed on it.
    fn version_key(&self) -> Option<String> {
        None
    }

    /// Paths relative to the install prefix this library installs, if known.
    fn installed_files(&self) -> Option<&[String]> {
        None
    }

    fn retrieve(&self, ctx: &Context) -> Result<()>;
    fn requires_clone(&self, ctx: &Context) -> bool;
    fn is_using_specific_commit(&self) -> bool;
    fn make_sure_right_commit_is_checked_out(&self, ctx: &Context) -> Result<()>;

    fn setup(&self, ctx: &mut Context) -> Result<()>;
    fn compile(&self, ctx: &mut Context) -> Result<()>;
    fn install(&self, ctx: &mut Context) -> Result<()>;

    fn prerequisites(&self) -> Option<&dyn Prerequisites> {
        None
    }

    fn enabler(&self) -> Option<&dyn Enable> {
        None
    }
}

#[derive(Debug)]
pub enum PrerequisiteError {
    /// No package list is defined for this platform.
    UnsupportedPlatform { platform: String },
    Failed(anyhow::Error),
}

impl fmt::Display for PrerequisiteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrerequisiteError::UnsupportedPlatform { platform } => {
                write!(f, "no prerequisite packages defined for platform '{}'", platform)
            }
            PrerequisiteError::Failed(e) => write!(f, "{:#}", e),
        }
    }
}

impl std::error::Error for PrerequisiteError {}

impl From<anyhow::Error> for PrerequisiteError {
    fn from(e: anyhow::Error) -> Self {
        PrerequisiteError::Failed(e)
    }
}

pub trait Prerequisites {
    fn package_list(&self, ctx: &Context) -> Result<Vec<String>, PrerequisiteError>;
    fn install_prerequisites(&self, ctx: &Context) -> Result<()>;
}

pub trait Enable {
    fn enable(&self, ctx: &mut Context) -> Result<()>;
}

/// How a source materialization is retrieved and kept at the right revision.
pub trait Retrieve {
    fn kind(&self) -> &'static str;
    fn version_key(&self) -> Option<String>;
    fn retrieve(&self, ctx: &Context, dir: &Path) -> Result<()>;
    fn requires_clone(&self, dir: &Path) -> bool;
    fn is_using_specific_commit(&self) -> bool;
    fn make_sure_right_commit_is_checked_out(&self, ctx: &Context, dir: &Path) -> Result<()>;
}

/// Configure, compile and install a retrieved source tree. Every step must be re-runnable.
pub trait Build {
    fn setup(&self, ctx: &Context, source_dir: &Path) -> Result<()>;
    fn compile(&self, ctx: &Context, source_dir: &Path) -> Result<()>;
    fn install(&self, ctx: &Context, source_dir: &Path) -> Result<()>;
}
