use super::{
    ArchiveSource, Build, CMakeBuild, CopyInstall, Dependency, Enable, GitSource, PackageList, Pin,
    Prerequisites, Retrieve,
};
use crate::config::{BuildKind, LibraryConfig};
use crate::context::Context;
use crate::ui;
use anyhow::Result;
use std::path::{Path, PathBuf};

/// A library declared in the setup file.
pub struct ConfiguredLibrary {
    name: String,
    folder_name: String,
    source: Box<dyn Retrieve>,
    build: Box<dyn Build>,
    installed_files: Option<Vec<String>>,
    packages: Option<PackageList>,
    enable_paths: Vec<String>,
    tool_paths: Vec<String>,
}

impl ConfiguredLibrary {
    pub fn from_config(config: &LibraryConfig) -> Self {
        let source: Box<dyn Retrieve> = match (&config.git, &config.archive) {
            (_, Some(archive)) => Box::new(ArchiveSource::from_config(archive)),
            (url, None) => {
                let pin = if let Some(commit) = &config.commit {
                    Some(Pin::Commit(commit.clone()))
                } else if let Some(tag) = &config.tag {
                    Some(Pin::Tag(tag.clone()))
                } else {
                    config.branch.clone().map(Pin::Branch)
                };
                Box::new(GitSource::new(url.clone().unwrap_or_default(), pin))
            }
        };
        let build: Box<dyn Build> = match config.build {
            BuildKind::Cmake => Box::new(CMakeBuild::new(
                config.cmake_dir.clone(),
                config.options.clone(),
            )),
            BuildKind::Copy => Box::new(CopyInstall::new(
                config.installed_files.clone().unwrap_or_default(),
            )),
        };
        Self::new(config.name.clone(), config.folder_name().to_string(), source, build)
            .with_installed_files(config.installed_files.clone())
            .with_packages(config.packages.clone().map(PackageList::new))
            .with_enable_paths(config.enable_paths.clone())
            .with_tool_paths(config.tool_paths.clone())
    }

    pub fn new(
        name: String,
        folder_name: String,
        source: Box<dyn Retrieve>,
        build: Box<dyn Build>,
    ) -> Self {
        Self {
            name,
            folder_name,
            source,
            build,
            installed_files: None,
            packages: None,
            enable_paths: Vec::new(),
            tool_paths: Vec::new(),
        }
    }

    pub fn with_installed_files(mut self, files: Option<Vec<String>>) -> Self {
        self.installed_files = files;
        self
    }

    pub fn with_packages(mut self, packages: Option<PackageList>) -> Self {
        self.packages = packages;
        self
    }

    pub fn with_enable_paths(mut self, paths: Vec<String>) -> Self {
        self.enable_paths = paths;
        self
    }

    pub fn with_tool_paths(mut self, paths: Vec<String>) -> Self {
        self.tool_paths = paths;
        self
    }

    fn dir(&self, ctx: &Context) -> PathBuf {
        ctx.library_dir(&self.folder_name)
    }

    fn resolve_paths(&self, ctx: &Context, paths: &[String]) -> Vec<PathBuf> {
        let dir = self.dir(ctx);
        paths
            .iter()
            .map(|p| {
                let path = Path::new(p);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    dir.join(path)
                }
            })
            .collect()
    }

    /// Runs one build step with this library's tool paths on the search path.
    fn build_step(
        &self,
        ctx: &mut Context,
        step: impl FnOnce(&dyn Build, &Context, &Path) -> Result<()>,
    ) -> Result<()> {
        let dir = self.dir(ctx);
        let tools = self.resolve_paths(ctx, &self.tool_paths);
        let scope = ctx.scoped_path(&tools, true);
        step(self.build.as_ref(), &*scope, &dir)
    }

    fn report_missing_files(&self, ctx: &Context) {
        let Some(files) = &self.installed_files else {
            return;
        };
        let prefix = ctx.install_prefix();
        for file in files.iter().filter(|f| !prefix.join(f).exists()) {
            ui::warning(format!(
                "{} did not install '{}' into {}",
                self.name,
                file,
                prefix.display()
            ));
        }
    }
}

impl Dependency for ConfiguredLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn folder_name(&self) -> &str {
        &self.folder_name
    }

    fn source_kind(&self) -> &'static str {
        self.source.kind()
    }

    fn version_key(&self) -> Option<String> {
        self.source.version_key()
    }

    fn installed_files(&self) -> Option<&[String]> {
        self.installed_files.as_deref()
    }

    fn retrieve(&self, ctx: &Context) -> Result<()> {
        ui::info(format!("Retrieving {}", self.name));
        self.source.retrieve(ctx, &self.dir(ctx))
    }

    fn requires_clone(&self, ctx: &Context) -> bool {
        self.source.requires_clone(&self.dir(ctx))
    }

    fn is_using_specific_commit(&self) -> bool {
        self.source.is_using_specific_commit()
    }

    fn make_sure_right_commit_is_checked_out(&self, ctx: &Context) -> Result<()> {
        self.source
            .make_sure_right_commit_is_checked_out(ctx, &self.dir(ctx))
    }

    fn setup(&self, ctx: &mut Context) -> Result<()> {
        ui::info(format!("Configuring {}", self.name));
        self.build_step(ctx, |build, ctx, dir| build.setup(ctx, dir))
    }

    fn compile(&self, ctx: &mut Context) -> Result<()> {
        ui::info(format!("Compiling {}", self.name));
        self.build_step(ctx, |build, ctx, dir| build.compile(ctx, dir))
    }

    fn install(&self, ctx: &mut Context) -> Result<()> {
        ui::info(format!("Installing {}", self.name));
        self.build_step(ctx, |build, ctx, dir| build.install(ctx, dir))?;
        self.report_missing_files(ctx);
        Ok(())
    }

    fn prerequisites(&self) -> Option<&dyn Prerequisites> {
        self.packages.as_ref().map(|p| p as &dyn Prerequisites)
    }

    fn enabler(&self) -> Option<&dyn Enable> {
        Some(self)
    }
}

impl Enable for ConfiguredLibrary {
    /// Puts the prefix `bin` directory and any extra enable paths on the search path.
    fn enable(&self, ctx: &mut Context) -> Result<()> {
        let bin = ctx.install_prefix().join("bin");
        ctx.env.add_path(bin, true);
        for path in self.resolve_paths(ctx, &self.enable_paths) {
            ctx.add_cmake_prefix_path(path.clone());
            ctx.env.add_path(path, true);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct RecordingBuild {
        seen_paths: Rc<RefCell<Vec<bool>>>,
        tool: PathBuf,
    }

    impl Build for RecordingBuild {
        fn setup(&self, ctx: &Context, _source_dir: &Path) -> Result<()> {
            self.seen_paths
                .borrow_mut()
                .push(ctx.env.path_entries().contains(&self.tool));
            Ok(())
        }

        fn compile(&self, _ctx: &Context, _source_dir: &Path) -> Result<()> {
            anyhow::bail!("compiler crashed")
        }

        fn install(&self, _ctx: &Context, _source_dir: &Path) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_from_config_picks_strategies() {
        let config = parse_config(
            r#"
[[library]]
name = "fmt"
git = "https://github.com/fmtlib/fmt.git"
tag = "10.2.1"

[[library]]
name = "json"
folder = "nlohmann-json"
build = "copy"
installed_files = ["include/nlohmann/json.hpp"]

[library.archive]
url = "https://example.com/json.zip"
hash = "abc"
"#,
        )
        .unwrap();

        let fmt = ConfiguredLibrary::from_config(&config.libraries[0]);
        assert_eq!(fmt.source_kind(), "git");
        assert!(fmt.is_using_specific_commit());
        assert_eq!(fmt.version_key().as_deref(), Some("10.2.1"));
        assert!(fmt.prerequisites().is_none());

        let json = ConfiguredLibrary::from_config(&config.libraries[1]);
        assert_eq!(json.source_kind(), "archive");
        assert_eq!(json.folder_name(), "nlohmann-json");
        assert_eq!(json.installed_files().map(|f| f.len()), Some(1));
    }

    #[test]
    fn test_tool_paths_scoped_to_build_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Context::for_tests(dir.path());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let tool = ctx.library_dir("proto").join("tools");

        let lib = ConfiguredLibrary::new(
            "proto".into(),
            "proto".into(),
            Box::new(GitSource::new("https://example.invalid/proto.git", None)),
            Box::new(RecordingBuild {
                seen_paths: Rc::clone(&seen),
                tool: tool.clone(),
            }),
        )
        .with_tool_paths(vec!["tools".into()]);

        lib.setup(&mut ctx).unwrap();
        assert!(lib.compile(&mut ctx).is_err());
        assert_eq!(*seen.borrow(), vec![true]);
        assert!(!ctx.env.path_entries().contains(&tool));
    }

    #[test]
    fn test_enable_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Context::for_tests(dir.path());
        let lib = ConfiguredLibrary::new(
            "sdk".into(),
            "sdk".into(),
            Box::new(GitSource::new("https://example.invalid/sdk.git", None)),
            Box::new(CopyInstall::new(vec![])),
        )
        .with_enable_paths(vec!["cmake".into()]);

        let enabler = lib.enabler().unwrap();
        enabler.enable(&mut ctx).unwrap();
        let entries = ctx.env.path_entries();
        let prefixes = ctx.cmake_prefix_paths().to_vec();
        enabler.enable(&mut ctx).unwrap();

        assert_eq!(ctx.env.path_entries(), entries);
        assert_eq!(ctx.cmake_prefix_paths(), prefixes.as_slice());
        assert!(prefixes.contains(&ctx.library_dir("sdk").join("cmake")));
    }
}
