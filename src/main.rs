//! # depsetup CLI Entry Point
//!
//! Reads `setup.toml`, runs the installer over every configured library and
//! then builds the main project. Any error ends the run with exit status 1.

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::{Shell, generate};
use std::path::PathBuf;

use depsetup::config::{self, RunOptions, Settings};
use depsetup::context::Context;
use depsetup::installer::{Installer, RunOutcome};
use depsetup::library::ConfiguredLibrary;
use depsetup::precompiled::{IndexResolver, NoPrecompiled, PrecompiledResolver};
use depsetup::project::MainProject;
use depsetup::ui;

#[cfg(windows)]
#[link(name = "kernel32")]
unsafe extern "system" {
    fn SetConsoleOutputCP(wCodePageID: u32) -> i32;
}

#[cfg(windows)]
fn enable_windows_utf8_console() {
    unsafe {
        SetConsoleOutputCP(65001);
    }
}

#[cfg(not(windows))]
fn enable_windows_utf8_console() {}

#[derive(Parser)]
#[command(name = "depsetup")]
#[command(
    about = "Fetches, builds and installs the third-party libraries of a C/C++ project",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Setup file to read
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Allow running the package manager with sudo (default)
    #[arg(long, overrides_with = "no_sudo")]
    sudo: bool,

    /// Never use sudo, print the packages to install instead
    #[arg(long, overrides_with = "sudo")]
    no_sudo: bool,

    /// Skip dependencies, only process the main project
    #[arg(long)]
    only_project: bool,

    /// Process dependencies and stop before the main project
    #[arg(long)]
    only_deps: bool,

    /// Only process these libraries (name or folder, comma separated)
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    only: Vec<String>,

    /// Never process these libraries, wins over --only
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    skip: Vec<String>,

    /// Don't pull updates for already retrieved libraries
    #[arg(long)]
    no_updates: bool,

    /// Don't run the OS package manager
    #[arg(long)]
    skip_package_manager: bool,

    /// Use the package names of this linux distribution
    #[arg(long, value_name = "DISTRO")]
    pretend_linux: Option<String>,

    /// Compile threads for dependencies and the project
    #[arg(short, long, value_name = "N")]
    jobs: Option<usize>,

    /// Build the main project with every CPU
    #[arg(long)]
    full_parallel: bool,

    /// Upper bound for --full-parallel
    #[arg(long, value_name = "N")]
    parallel_limit: Option<usize>,

    /// CMake build type
    #[arg(long, value_name = "TYPE")]
    build_type: Option<String>,

    /// Package the installed libraries into DIR with an index.json
    #[arg(long, value_name = "DIR")]
    create_precompiled: Option<PathBuf>,

    /// Print shell completions and exit
    #[arg(long, value_name = "SHELL")]
    completions: Option<Shell>,

    /// Extra arguments for the main project's CMake configure
    #[arg(last = true)]
    project_args: Vec<String>,
}

impl Cli {
    fn settings(&self, mut settings: Settings) -> Settings {
        if let Some(build_type) = &self.build_type {
            settings.build_type = build_type.clone();
        }
        if let Some(distro) = &self.pretend_linux {
            settings.pretend_linux = Some(distro.clone());
        }
        settings
    }

    fn run_options(&self, settings: &Settings) -> RunOptions {
        let mut options = RunOptions::from_settings(settings);
        options.allow_sudo = self.sudo || !self.no_sudo;
        options.only_main_project = self.only_project;
        options.only_dependencies = self.only_deps;
        if !self.only.is_empty() {
            options.only = Some(self.only.clone());
        }
        options.skip = self.skip.clone();
        options.skip_pull_updates |= self.no_updates;
        options.skip_package_manager |= self.skip_package_manager;
        options.full_parallel |= self.full_parallel;
        if self.parallel_limit.is_some() {
            options.full_parallel_limit = self.parallel_limit;
        }
        if let Some(jobs) = self.jobs {
            options.compile_threads = jobs.max(1);
        }
        options
    }
}

fn main() {
    enable_windows_utf8_console();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        ui::fatal(&err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        let bin_name = cmd.get_name().to_string();
        generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        return Ok(());
    }

    let (setup, root) = config::load_config(&cli.config)?;
    if !cli.project_args.is_empty() && setup.project.is_none() {
        anyhow::bail!(
            "Unknown arguments. See --help. This was left unparsed: {} \
            ({} has no [project] to pass them to)",
            cli.project_args.join(" "),
            cli.config.display()
        );
    }

    let settings = cli.settings(setup.settings.clone());
    let options = cli.run_options(&settings);
    ui::info(format!("Project dir is '{}'", root.display()));
    ui::info(format!(
        "Using {} threads to compile, configuration: {}",
        options.compile_threads, settings.build_type
    ));

    let ctx = Context::new(options, settings, root);
    let resolver: Box<dyn PrecompiledResolver> = match &ctx.settings.precompiled_index {
        Some(location) => Box::new(IndexResolver::load(location, &ctx.root)?),
        None => Box::new(NoPrecompiled),
    };

    let mut installer = Installer::new(ctx, resolver);
    for library in &setup.libraries {
        installer.add_library(Box::new(ConfiguredLibrary::from_config(library)));
    }

    let project = setup
        .project
        .map(|config| MainProject::new(config, cli.project_args.clone()));
    if let Some(project) = &project
        && let Some(packages) = project.prerequisites()
    {
        installer.register_self_as_library(project.name(), Box::new(packages));
    }

    let outcome = installer.run()?;
    let summary = installer.summary();
    if !summary.is_empty() {
        ui::gap();
        summary.print();
    }

    if let Some(dir) = &cli.create_precompiled {
        let index = installer.create_precompiled(dir)?;
        ui::success(format!(
            "Wrote {} precompiled packages to {}",
            index.packages.len(),
            dir.display()
        ));
    }

    match (outcome, &project) {
        (RunOutcome::DependenciesOnly, _) => Ok(()),
        (RunOutcome::Ready { compile_threads }, Some(project)) => {
            project.build(installer.context(), compile_threads)
        }
        (RunOutcome::Ready { .. }, None) => {
            ui::success("Dependencies are ready. No [project] configured, nothing else to build");
            Ok(())
        }
    }
}
