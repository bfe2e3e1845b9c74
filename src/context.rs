//! Run context shared by the installer and every strategy.
//!
//! Holds the run options, resolved directories, detected platform and the
//! command environment. It is passed by reference; nothing here is global.

use crate::config::{RunOptions, Settings};
use crate::exec::{CommandEnv, PathSnapshot, StuckPrevention};
use crate::platform::{self, Os};
use crate::ui;
use anyhow::Result;
use std::cell::OnceCell;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub struct Context {
    pub options: RunOptions,
    pub settings: Settings,
    pub root: PathBuf,
    pub os: Os,
    pub env: CommandEnv,
    cmake_prefix_paths: Vec<PathBuf>,
    platform_id: OnceCell<String>,
}

impl Context {
    pub fn new(options: RunOptions, settings: Settings, root: PathBuf) -> Self {
        let mut ctx = Self {
            options,
            settings,
            root,
            os: Os::current(),
            env: CommandEnv::default(),
            cmake_prefix_paths: Vec::new(),
            platform_id: OnceCell::new(),
        };
        let prefix = ctx.install_prefix();
        ctx.cmake_prefix_paths.push(prefix);
        ctx
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn libraries_dir(&self) -> PathBuf {
        self.resolve(&self.settings.libraries_dir)
    }

    pub fn library_dir(&self, folder_name: &str) -> PathBuf {
        self.libraries_dir().join(folder_name)
    }

    pub fn install_prefix(&self) -> PathBuf {
        self.resolve(&self.settings.install_prefix)
    }

    pub fn precompiled_cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.settings.precompiled_cache {
            return self.resolve(dir);
        }
        dirs::cache_dir()
            .map(|dir| dir.join("depsetup").join("precompiled"))
            .unwrap_or_else(|| self.libraries_dir().join(".precompiled"))
    }

    /// Distribution (or `mac` / `windows`) used to pick package names. Detected on first use.
    pub fn platform_id(&self) -> Result<&str> {
        if let Some(id) = self.platform_id.get() {
            return Ok(id.as_str());
        }
        let id = platform::resolve_platform_id(
            self.os,
            self.settings.pretend_linux.as_deref(),
            self.options.skip_package_manager,
            &self.env,
        )?;
        Ok(self.platform_id.get_or_init(|| id).as_str())
    }

    pub fn stuck_prevention(&self) -> StuckPrevention {
        StuckPrevention {
            timeout: Duration::from_secs(self.settings.stuck_timeout_secs),
            retries: self.settings.stuck_retries,
            ..StuckPrevention::default()
        }
    }

    /// Threads for dependency builds.
    pub fn compile_threads(&self) -> usize {
        if self.options.full_parallel {
            self.full_parallel_threads()
        } else {
            self.options.compile_threads.max(1)
        }
    }

    /// Every CPU, capped by `full_parallel_limit`.
    pub fn full_parallel_threads(&self) -> usize {
        let cpus = num_cpus::get();
        match self.options.full_parallel_limit {
            Some(limit) => cpus.min(limit.max(1)),
            None => cpus,
        }
    }

    pub fn add_cmake_prefix_path(&mut self, path: PathBuf) {
        if !self.cmake_prefix_paths.contains(&path) {
            self.cmake_prefix_paths.push(path);
        }
    }

    pub fn cmake_prefix_paths(&self) -> &[PathBuf] {
        &self.cmake_prefix_paths
    }

    /// `CMAKE_PREFIX_PATH` value, entries separated by `;`.
    pub fn cmake_prefix_path_arg(&self) -> String {
        self.cmake_prefix_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Adds `entries` to the search path until the returned guard is dropped.
    pub fn scoped_path(&mut self, entries: &[PathBuf], prepend: bool) -> PathScope<'_> {
        let saved = self.env.save_path();
        if !entries.is_empty() {
            // Reverse so the first entry ends up searched first
            let ordered: Vec<&PathBuf> = if prepend {
                entries.iter().rev().collect()
            } else {
                entries.iter().collect()
            };
            for entry in ordered {
                self.env.add_path(entry.clone(), prepend);
            }
            ui::info(format!(
                "Setting path to: {}",
                self.env.search_path().to_string_lossy()
            ));
        }
        PathScope {
            ctx: self,
            saved: Some(saved),
            announce: !entries.is_empty(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(root: &Path) -> Self {
        let settings = Settings {
            pretend_linux: Some("fedora".to_string()),
            precompiled_cache: Some(PathBuf::from(".cache")),
            ..Settings::default()
        };
        Self::new(RunOptions::default(), settings, root.to_path_buf())
    }
}

/// Restores the search path on drop, including early returns and unwinding.
pub struct PathScope<'a> {
    ctx: &'a mut Context,
    saved: Option<PathSnapshot>,
    announce: bool,
}

impl Deref for PathScope<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        self.ctx
    }
}

impl DerefMut for PathScope<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        self.ctx
    }
}

impl Drop for PathScope<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.ctx.env.restore_path(saved);
            if self.announce {
                ui::info("Restored old path");
            }
        }
    }
}
