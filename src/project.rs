//! The main project: configured and built with CMake once its dependencies are ready.

use crate::config::ProjectConfig;
use crate::context::Context;
use crate::library::{self, PackageList};
use crate::ui;
use anyhow::{Context as _, Result};
use std::fs;
use std::path::PathBuf;

pub struct MainProject {
    config: ProjectConfig,
    /// Extra arguments for the configure step, taken from after `--`.
    extra_args: Vec<String>,
}

impl MainProject {
    pub fn new(config: ProjectConfig, extra_args: Vec<String>) -> Self {
        Self { config, extra_args }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn prerequisites(&self) -> Option<PackageList> {
        self.config.packages.clone().map(PackageList::new)
    }

    fn source_dir(&self, ctx: &Context) -> PathBuf {
        ctx.root.join(&self.config.source_dir)
    }

    fn build_dir(&self, ctx: &Context) -> PathBuf {
        ctx.root.join(&self.config.build_dir)
    }

    pub fn configure_args(&self, ctx: &Context) -> Vec<String> {
        library::configure_args(
            ctx,
            &self.source_dir(ctx),
            &self.config.cmake_options,
            &self.extra_args,
        )
    }

    pub fn build(&self, ctx: &Context, threads: usize) -> Result<()> {
        library::check_cmake(ctx)?;
        let build_dir = self.build_dir(ctx);
        fs::create_dir_all(&build_dir)
            .with_context(|| format!("Failed to create {}", build_dir.display()))?;

        ui::info(format!("Configuring {}", self.name()));
        library::run_cmake(ctx, &build_dir, &self.configure_args(ctx))?;

        ui::info(format!("Compiling {} with {} threads", self.name(), threads));
        library::run_cmake(ctx, &build_dir, &library::build_args(ctx, threads, None))
            .with_context(|| format!("Failed to compile {}", self.name()))?;

        ui::success(format!("{} is ready in {}", self.name(), build_dir.display()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;

    #[test]
    fn test_configure_args_include_hook_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Context::for_tests(dir.path());
        ctx.add_cmake_prefix_path(dir.path().join("sdk"));
        let config = parse_config(
            r#"
[project]
name = "game"
source_dir = "engine"
cmake_options = { USE_VULKAN = "ON" }
"#,
        )
        .unwrap();
        let project = MainProject::new(config.project.unwrap(), vec!["-GNinja".into()]);

        let args = project.configure_args(&ctx);
        assert_eq!(args[0], dir.path().join("engine").to_string_lossy());
        assert!(args.contains(&"-DUSE_VULKAN=ON".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-GNinja"));
        let prefix_arg = args.iter().find(|a| a.starts_with("-DCMAKE_PREFIX_PATH=")).unwrap();
        assert!(prefix_arg.contains(';'));
    }

    #[test]
    fn test_prerequisites_only_when_packages_listed() {
        let config = parse_config("[project]\nname = \"app\"\n").unwrap();
        let project = MainProject::new(config.project.unwrap(), Vec::new());
        assert!(project.prerequisites().is_none());
        assert_eq!(project.name(), "app");
    }
}
