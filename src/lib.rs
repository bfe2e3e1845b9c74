//! # depsetup - third-party dependency setup for C/C++ projects
//!
//! depsetup fetches the libraries a project depends on, builds them (or
//! installs precompiled packages instead), installs the OS packages they
//! need, and finally configures and builds the project itself.
//!
//! ## Quick Start
//!
//! ```bash
//! # Fetch and build everything listed in setup.toml, then the project
//! depsetup
//!
//! # Only rebuild the dependencies, never ask for sudo
//! depsetup --only-deps --no-sudo
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - `setup.toml` parsing and run options
//! - [`library`] - library descriptors with their retrieval and build strategies
//! - [`precompiled`] - precompiled package index, install and creation
//! - [`installer`] - the orchestrator that runs every library through its phases
//! - [`exec`] - subprocess execution, search path overlay, stuck prevention

/// Configuration file parsing (`setup.toml`).
pub mod config;

/// Run context shared by every phase.
pub mod context;

/// Verified downloads and archive extraction.
pub mod download;

/// Subprocess execution.
pub mod exec;

/// Orchestration of library installs.
pub mod installer;

/// Library descriptors, retrieval and build strategies.
pub mod library;

/// Platform detection and the package-manager shim.
pub mod platform;

/// Precompiled packages.
pub mod precompiled;

/// The main project build.
pub mod project;

/// Console output helpers.
pub mod ui;
