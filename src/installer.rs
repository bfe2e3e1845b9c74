//! The installer: drives every registered library through prerequisites,
//! retrieval, build and enabling, in that order.
//!
//! Libraries are processed one at a time in registration order. Any error
//! stops the run.

use crate::config::Selection;
use crate::context::Context;
use crate::library::{Dependency, PrerequisiteError, Prerequisites};
use crate::precompiled::{self, Precompiled, PrecompiledIndex, PrecompiledResolver};
use crate::ui;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Only dependencies were requested; nothing else should run.
    DependenciesOnly,
    /// Dependencies are in place, build the main project with this many threads.
    Ready { compile_threads: usize },
}

/// What happened to a library during the run, for the summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handling {
    Skipped,
    NotSelected,
    Built,
    Precompiled,
    /// Only the main project was processed.
    Untouched,
}

impl Handling {
    fn label(self) -> &'static str {
        match self {
            Handling::Skipped => "skipped",
            Handling::NotSelected => "not selected",
            Handling::Built => "built",
            Handling::Precompiled => "precompiled",
            Handling::Untouched => "untouched",
        }
    }
}

struct SelfLibrary {
    name: String,
    prerequisites: Box<dyn Prerequisites>,
}

pub struct Installer {
    ctx: Context,
    libraries: Vec<Box<dyn Dependency>>,
    self_library: Option<SelfLibrary>,
    resolver: Box<dyn PrecompiledResolver>,
    handled: Vec<(String, Handling)>,
}

impl Installer {
    pub fn new(ctx: Context, resolver: Box<dyn PrecompiledResolver>) -> Self {
        Self {
            ctx,
            libraries: Vec::new(),
            self_library: None,
            resolver,
            handled: Vec::new(),
        }
    }

    pub fn add_library(&mut self, library: Box<dyn Dependency>) {
        self.libraries.push(library);
    }

    /// Registers the main project so its own prerequisites get installed after the dependencies.
    pub fn register_self_as_library(
        &mut self,
        name: impl Into<String>,
        prerequisites: Box<dyn Prerequisites>,
    ) {
        self.self_library = Some(SelfLibrary {
            name: name.into(),
            prerequisites,
        });
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn into_context(self) -> Context {
        self.ctx
    }

    fn selection(&self, library: &dyn Dependency) -> Selection {
        self.ctx
            .options
            .selection(library.name(), library.folder_name())
    }

    /// Whether `library` takes part in this run. Logs the reason when it doesn't.
    pub fn is_enabled(&self, library: &dyn Dependency) -> bool {
        match self.selection(library) {
            Selection::Enabled => true,
            Selection::Skipped => {
                ui::info(format!("Dependency {} is in the skip list", library.name()));
                false
            }
            Selection::NotSelected => {
                ui::info(format!("Dependency {} is not in the only list", library.name()));
                false
            }
        }
    }

    fn enabled_indices(&mut self) -> Vec<usize> {
        let mut enabled = Vec::new();
        let mut handled = Vec::new();
        for (i, library) in self.libraries.iter().enumerate() {
            let handling = if self.is_enabled(library.as_ref()) {
                enabled.push(i);
                Handling::Untouched
            } else if self.selection(library.as_ref()) == Selection::Skipped {
                Handling::Skipped
            } else {
                Handling::NotSelected
            };
            handled.push((library.name().to_string(), handling));
        }
        self.handled = handled;
        enabled
    }

    fn mark(&mut self, name: &str, handling: Handling) {
        if let Some(entry) = self.handled.iter_mut().find(|(n, _)| n == name) {
            entry.1 = handling;
        }
    }

    pub fn run(&mut self) -> Result<RunOutcome> {
        ui::success("Starting dependency setup");
        let enabled = self.enabled_indices();
        let only_main_project = self.ctx.options.only_main_project;

        if !only_main_project {
            for &i in &enabled {
                let library = self.libraries[i].as_ref();
                if let Some(prerequisites) = library.prerequisites() {
                    do_prerequisite_installs(&self.ctx, library.name(), prerequisites)?;
                }
            }
        }

        let mut precompiled: BTreeMap<String, Box<dyn Precompiled>> = BTreeMap::new();
        for &i in &enabled {
            let library = self.libraries[i].as_ref();
            if let Some(package) = self.resolver.find(library, &self.ctx) {
                precompiled.insert(library.name().to_string(), package);
            }
        }
        ui::info(format!(
            "Using {} precompiled librar{}",
            precompiled.len(),
            if precompiled.len() == 1 { "y" } else { "ies" }
        ));

        self.retrieve_sources(&enabled, &precompiled)?;

        if !precompiled.is_empty() {
            ui::info("Retrieving precompiled libraries");
            for package in precompiled.values() {
                package.retrieve(&self.ctx)?;
            }
            ui::success("Precompiled libraries retrieved");
        }

        if !only_main_project {
            ui::info("Configuring and building dependencies");
            for &i in &enabled {
                let library = self.libraries[i].as_ref();
                let handling = match precompiled.get(library.name()) {
                    Some(package) => {
                        package.install(&self.ctx)?;
                        Handling::Precompiled
                    }
                    None => {
                        library.setup(&mut self.ctx)?;
                        library.compile(&mut self.ctx)?;
                        library.install(&mut self.ctx)?;
                        Handling::Built
                    }
                };
                if let Some(enabler) = library.enabler() {
                    enabler.enable(&mut self.ctx)?;
                }
                let name = library.name().to_string();
                self.mark(&name, handling);
            }
            ui::success("Dependencies done");
        }

        if self.ctx.options.only_dependencies {
            ui::success("All done. Skipping main project");
            return Ok(RunOutcome::DependenciesOnly);
        }

        let compile_threads = self.main_project_threads();

        if let Some(self_library) = &self.self_library {
            do_prerequisite_installs(
                &self.ctx,
                &self_library.name,
                self_library.prerequisites.as_ref(),
            )?;
        }

        for library in &self.libraries {
            if let Some(enabler) = library.enabler() {
                enabler.enable(&mut self.ctx)?;
            }
        }

        Ok(RunOutcome::Ready { compile_threads })
    }

    fn retrieve_sources(
        &self,
        enabled: &[usize],
        precompiled: &BTreeMap<String, Box<dyn Precompiled>>,
    ) -> Result<()> {
        let options = &self.ctx.options;
        let sources = enabled
            .iter()
            .map(|&i| self.libraries[i].as_ref())
            .filter(|library| !precompiled.contains_key(library.name()));

        if !options.skip_pull_updates && !options.only_main_project {
            ui::info("Retrieving dependencies");
            for library in sources {
                library.retrieve(&self.ctx)?;
            }
            ui::success("Successfully retrieved all dependencies. Beginning compile");
            return Ok(());
        }

        if options.skip_pull_updates {
            ui::warning("Not updating dependencies. This may or may not work");
        }
        for library in sources {
            if library.requires_clone(&self.ctx) {
                ui::info(format!("Dependency {} needs to be cloned", library.name()));
                library.retrieve(&self.ctx)?;
            } else if library.is_using_specific_commit() {
                ui::info(format!(
                    "Making sure {} has the right commit checked out",
                    library.name()
                ));
                library.make_sure_right_commit_is_checked_out(&self.ctx)?;
            }
        }
        Ok(())
    }

    fn main_project_threads(&self) -> usize {
        let options = &self.ctx.options;
        if options.full_parallel {
            let threads = self.ctx.full_parallel_threads();
            ui::info(format!(
                "Using fully parallel build for the main project, threads: {}",
                threads
            ));
            threads
        } else {
            options.compile_threads.max(1)
        }
    }

    /// Packages every enabled library that lists its installed files.
    pub fn create_precompiled(&self, out_dir: &Path) -> Result<PrecompiledIndex> {
        let libraries: Vec<&dyn Dependency> = self
            .libraries
            .iter()
            .map(|l| l.as_ref())
            .filter(|l| self.selection(*l) == Selection::Enabled)
            .collect();
        precompiled::create_packages(&libraries, &self.ctx, out_dir)
    }

    pub fn summary(&self) -> ui::Table {
        let mut table = ui::Table::new(&["Library", "Source", "Handled"]);
        for (library, (name, handling)) in self.libraries.iter().zip(&self.handled) {
            table.add_row(vec![
                name.clone(),
                library.source_kind().to_string(),
                handling.label().to_string(),
            ]);
        }
        table
    }
}

/// Installs the OS packages one library needs, or tells the user to when automatic installs are off.
pub fn do_prerequisite_installs(
    ctx: &Context,
    name: &str,
    prerequisites: &dyn Prerequisites,
) -> Result<()> {
    let packages = match prerequisites.package_list(ctx) {
        Ok(packages) => packages,
        Err(PrerequisiteError::UnsupportedPlatform { platform }) => {
            if ctx.os.requires_prerequisite_lists() {
                anyhow::bail!(
                    "Dependency {} prerequisites fetch failed: no package list for '{}'. \
                    This needs to work on non-windows platforms",
                    name,
                    platform
                );
            }
            return Ok(());
        }
        Err(PrerequisiteError::Failed(e)) => {
            return Err(e.context(format!("Failed to get prerequisites of {}", name)));
        }
    };

    if packages.is_empty() {
        ui::info(format!("{} needs no prerequisite packages", name));
        return Ok(());
    }

    if !ctx.options.allow_sudo || ctx.options.skip_package_manager {
        ui::warning(format!(
            "Automatic dependency installation is disabled!: please install: '{}' manually for {}",
            packages.join(" "),
            name
        ));
        return Ok(());
    }

    ui::info(format!("Installing prerequisites for {}...", name));
    prerequisites.install_prerequisites(ctx)?;
    ui::success("Prerequisites installed");
    Ok(())
}
