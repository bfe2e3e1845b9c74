//! Subprocess execution.
//!
//! Every external command is spawned with piped output. Stdout and stderr
//! are drained on their own threads so a chatty process can't block on a
//! full pipe while we wait for it. The readers are joined before a result
//! is returned.
//!
//! Commands are built through [`CommandEnv`], which carries the search path
//! and variables that installed libraries registered for later builds.

use crate::ui;
use anyhow::{Context, Result};
use colored::*;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

/// Environment handed to every spawned command.
#[derive(Debug, Clone, Default)]
pub struct CommandEnv {
    prepend: Vec<PathBuf>,
    append: Vec<PathBuf>,
    vars: BTreeMap<String, String>,
}

/// Saved search path, see [`CommandEnv::save_path`].
#[derive(Debug, Clone)]
pub struct PathSnapshot {
    prepend: Vec<PathBuf>,
    append: Vec<PathBuf>,
}

impl CommandEnv {
    pub fn add_path(&mut self, entry: impl Into<PathBuf>, prepend: bool) {
        let entry = entry.into();
        if self.prepend.contains(&entry) || self.append.contains(&entry) {
            return;
        }
        if prepend {
            // Newest entry is searched first
            self.prepend.insert(0, entry);
        } else {
            self.append.push(entry);
        }
    }

    pub fn set_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn save_path(&self) -> PathSnapshot {
        PathSnapshot {
            prepend: self.prepend.clone(),
            append: self.append.clone(),
        }
    }

    pub fn restore_path(&mut self, snapshot: PathSnapshot) {
        self.prepend = snapshot.prepend;
        self.append = snapshot.append;
    }

    /// All directories searched for programs, in order.
    pub fn path_entries(&self) -> Vec<PathBuf> {
        let system = std::env::var_os("PATH").unwrap_or_default();
        self.prepend
            .iter()
            .cloned()
            .chain(std::env::split_paths(&system))
            .chain(self.append.iter().cloned())
            .collect()
    }

    pub fn search_path(&self) -> OsString {
        std::env::join_paths(self.path_entries()).unwrap_or_else(|_| {
            // An entry contains the separator; fall back to the untouched system path
            std::env::var_os("PATH").unwrap_or_default()
        })
    }

    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("PATH", self.search_path());
        cmd.envs(&self.vars);
        cmd
    }

    pub fn has_command(&self, program: &str) -> bool {
        std::env::current_dir()
            .map(|cwd| which::which_in(program, Some(self.search_path()), cwd).is_ok())
            .unwrap_or(false)
    }

    /// Checks that `program` can be found, listing the searched directories if not.
    pub fn require_command(&self, program: &str) -> Result<PathBuf> {
        let as_path = Path::new(program);
        if program.starts_with("./") || (as_path.is_absolute() && as_path.exists()) {
            return Ok(as_path.to_path_buf());
        }

        let cwd = std::env::current_dir()?;
        match which::which_in(program, Some(self.search_path()), cwd) {
            Ok(found) => Ok(found),
            Err(_) => {
                ui::info(format!(
                    "The following paths were searched for '{}' but it wasn't found:",
                    program
                ));
                for entry in self.path_entries() {
                    println!("    {}", entry.display());
                }
                Err(anyhow::anyhow!(
                    "Required program / tool '{}' is not installed or missing from path.\n\
                    Please install it and make sure it is in path, then try again.",
                    program
                ))
            }
        }
    }
}

/// How the stderr lines of a command are echoed.
#[derive(Debug, Clone, Default)]
pub struct OutputStyle {
    pub error_prefix: String,
    pub red_errors: bool,
}

pub fn describe(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn spawn_piped(cmd: &mut Command) -> Result<std::process::Child> {
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start '{}'", describe(cmd)))
}

fn drain<R, F>(reader: Option<R>, mut on_line: F) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    F: FnMut(String) + Send + 'static,
{
    thread::spawn(move || {
        let Some(reader) = reader else {
            return;
        };
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    on_line(line.trim_end_matches(['\n', '\r']).to_string());
                }
            }
        }
    })
}

fn print_error_line(style: &OutputStyle) -> impl FnMut(String) + Send + 'static {
    let prefix = style.error_prefix.clone();
    let red = style.red_errors;
    move |line| {
        let line = format!("{}{}", prefix, line);
        if red {
            eprintln!("{}", line.red());
        } else {
            eprintln!("{}", line);
        }
    }
}

fn join(handles: [JoinHandle<()>; 2]) {
    for handle in handles {
        let _ = handle.join();
    }
}

/// Runs a command echoing its output, returns the exit status.
pub fn run(cmd: &mut Command, style: &OutputStyle) -> Result<ExitStatus> {
    let mut child = spawn_piped(cmd)?;
    let out = drain(child.stdout.take(), |line| println!("{}", line));
    let err = drain(child.stderr.take(), print_error_line(style));

    let status = child.wait()?;
    join([out, err]);
    Ok(status)
}

/// Runs a command, fails if it exits unsuccessfully.
pub fn run_checked(cmd: &mut Command, style: &OutputStyle) -> Result<()> {
    let status = run(cmd, style)?;
    if !status.success() {
        anyhow::bail!(
            "Running command failed ({}): {}",
            status,
            describe(cmd)
        );
    }
    Ok(())
}

/// Runs a command silently and returns its exit status with stdout followed by stderr.
pub fn run_capture(cmd: &mut Command) -> Result<(ExitStatus, String)> {
    let mut child = spawn_piped(cmd)?;
    let collect = |reader: Option<Box<dyn Read + Send>>| {
        thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut reader) = reader {
                let mut bytes = Vec::new();
                let _ = reader.read_to_end(&mut bytes);
                text = String::from_utf8_lossy(&bytes).into_owned();
            }
            text
        })
    };
    let out = collect(
        child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>),
    );
    let err = collect(
        child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>),
    );

    let status = child.wait()?;
    let mut output = out.join().unwrap_or_default();
    output.push_str(&err.join().unwrap_or_default());
    Ok((status, output))
}

/// Restart policy for commands that can hang without output (network installs).
#[derive(Debug, Clone, Copy)]
pub struct StuckPrevention {
    pub timeout: Duration,
    pub retries: u32,
    pub poll_interval: Duration,
    pub restart_delay: Duration,
}

impl Default for StuckPrevention {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            retries: 5,
            poll_interval: Duration::from_secs(1),
            restart_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub struct StuckRun {
    pub status: ExitStatus,
    pub restarts: u32,
}

/// Runs a command, killing and restarting it when it goes silent for too long.
///
/// `make` builds a fresh command for every attempt. Once the restarts are used
/// up the last attempt is waited on indefinitely.
pub fn run_stuck_prevention(
    make: &mut dyn FnMut() -> Command,
    style: &OutputStyle,
    policy: StuckPrevention,
) -> Result<StuckRun> {
    let mut restarts = 0;

    'attempt: loop {
        let mut cmd = make();
        let mut child = spawn_piped(&mut cmd)?;

        let started = Instant::now();
        let last_output = Arc::new(AtomicU64::new(0));
        let touch = {
            let last_output = Arc::clone(&last_output);
            move || last_output.store(started.elapsed().as_millis() as u64, Ordering::Relaxed)
        };
        let out = {
            let touch = touch.clone();
            drain(child.stdout.take(), move |line| {
                println!("{}", line);
                touch();
            })
        };
        let err = {
            let touch = touch.clone();
            let mut print = print_error_line(style);
            drain(child.stderr.take(), move |line| {
                print(line);
                touch();
            })
        };

        let status = loop {
            if let Some(status) = child.wait_timeout(policy.poll_interval)? {
                break status;
            }

            let silent = started
                .elapsed()
                .saturating_sub(Duration::from_millis(last_output.load(Ordering::Relaxed)));
            if silent < policy.timeout {
                continue;
            }
            ui::warning(format!(
                "Stuck prevention: {:.1}s elapsed since last output from command",
                silent.as_secs_f64()
            ));
            if restarts < policy.retries {
                ui::info("Restarting it");
                let _ = child.kill();
                let _ = child.wait();
                // Readers are left to finish on their own; a grandchild may still hold the pipe
                drop(out);
                drop(err);
                restarts += 1;
                thread::sleep(policy.restart_delay);
                continue 'attempt;
            }
            ui::warning("Restarts exhausted, going to wait until user interrupts us");
            touch();
        };

        join([out, err]);
        return Ok(StuckRun { status, restarts });
    }
}
