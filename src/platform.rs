//! Platform detection, sudo policy and the OS package-manager shim.

use crate::exec::{self, CommandEnv};
use crate::ui;
use anyhow::Result;
use regex::Regex;
use std::fs;
use std::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Os {
    Linux,
    Mac,
    Windows,
    Other,
}

impl Os {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Os::Linux,
            "macos" => Os::Mac,
            "windows" => Os::Windows,
            _ => Os::Other,
        }
    }

    /// Whether every library must declare its prerequisite packages here.
    pub fn requires_prerequisite_lists(self) -> bool {
        self != Os::Windows
    }
}

/// `<os>-<arch>`, used to match precompiled packages.
pub fn platform_tag() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Platform id that selects package names: `mac`, `windows` or the linux distribution.
pub fn resolve_platform_id(
    os: Os,
    pretend_linux: Option<&str>,
    skip_package_manager: bool,
    env: &CommandEnv,
) -> Result<String> {
    match os {
        Os::Mac => return Ok("mac".to_string()),
        Os::Windows => return Ok("windows".to_string()),
        Os::Linux | Os::Other => {}
    }

    if let Some(pretend) = pretend_linux {
        return Ok(pretend.to_lowercase());
    }

    // Nothing gets installed, any distribution's names will do
    if skip_package_manager {
        return Ok("fedora".to_string());
    }

    detect_linux_distribution(env)
}

fn detect_linux_distribution(env: &CommandEnv) -> Result<String> {
    if env.has_command("lsb_release") {
        let mut cmd = env.command("lsb_release");
        cmd.arg("-is");
        if let Ok((status, output)) = exec::run_capture(&mut cmd) {
            let id = output.trim().to_lowercase();
            if status.success() && !id.is_empty() {
                return Ok(id);
            }
        }
    }

    if let Ok(content) = fs::read_to_string("/etc/os-release")
        && let Some(id) = parse_os_release_id(&content)
    {
        return Ok(id);
    }

    Err(anyhow::anyhow!(
        "Failed to run 'lsb_release'. Make sure you have it installed \
        (or pass --pretend-linux <distro>)"
    ))
}

pub fn parse_os_release_id(content: &str) -> Option<String> {
    let re = Regex::new(r#"(?m)^ID="?([A-Za-z0-9._-]+)"?\s*$"#).ok()?;
    re.captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Decides whether a command that wants sudo actually gets it.
pub fn should_use_sudo(wants_sudo: bool, allow_sudo: bool, warn_if_mismatch: bool) -> bool {
    if !wants_sudo {
        return false;
    }
    if !allow_sudo {
        if warn_if_mismatch {
            ui::warning(
                "Sudo is globally disabled, but a command should be ran as sudo.\n  \
                If something breaks please rerun with sudo allowed.",
            );
        }
        return false;
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Dnf,
    Yum,
    Apt,
    Pacman,
    Zypper,
    Brew,
}

impl PackageManager {
    pub fn for_platform(platform_id: &str, env: &CommandEnv) -> Option<Self> {
        match platform_id {
            "fedora" | "centos" | "rhel" | "rocky" | "almalinux" => {
                if env.has_command("dnf") {
                    Some(PackageManager::Dnf)
                } else {
                    Some(PackageManager::Yum)
                }
            }
            "ubuntu" | "debian" | "linuxmint" | "pop" | "raspbian" => Some(PackageManager::Apt),
            "arch" | "manjaro" | "endeavouros" => Some(PackageManager::Pacman),
            "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "suse" => {
                Some(PackageManager::Zypper)
            }
            "mac" => Some(PackageManager::Brew),
            _ => None,
        }
    }

    pub fn program(self) -> &'static str {
        match self {
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Apt => "apt-get",
            PackageManager::Pacman => "pacman",
            PackageManager::Zypper => "zypper",
            PackageManager::Brew => "brew",
        }
    }

    pub fn wants_sudo(self) -> bool {
        self != PackageManager::Brew
    }

    pub fn install_args(self, packages: &[String]) -> Vec<String> {
        let mut args: Vec<String> = match self {
            PackageManager::Dnf | PackageManager::Yum | PackageManager::Apt => {
                vec!["install".into(), "-y".into()]
            }
            PackageManager::Pacman => vec!["-S".into(), "--needed".into(), "--noconfirm".into()],
            PackageManager::Zypper => vec!["--non-interactive".into(), "install".into()],
            PackageManager::Brew => vec!["install".into()],
        };
        args.extend(packages.iter().cloned());
        args
    }

    pub fn install_command(self, packages: &[String], use_sudo: bool, env: &CommandEnv) -> Command {
        if use_sudo {
            let mut cmd = env.command("sudo");
            cmd.arg(self.program()).args(self.install_args(packages));
            cmd
        } else {
            let mut cmd = env.command(self.program());
            cmd.args(self.install_args(packages));
            cmd
        }
    }
}
