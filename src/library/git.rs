use super::Retrieve;
use crate::context::Context;
use crate::ui;
use anyhow::{Context as _, Result};
use colored::*;
use git2::build::CheckoutBuilder;
use git2::{AutotagOption, FetchOptions, Oid, Repository};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::Path;

/// What a git source is held at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pin {
    Commit(String),
    Tag(String),
    Branch(String),
}

impl Pin {
    /// Commits and tags never move; branches follow upstream.
    pub fn is_specific(&self) -> bool {
        matches!(self, Pin::Commit(_) | Pin::Tag(_))
    }

    fn describe(&self) -> String {
        match self {
            Pin::Commit(c) => format!("commit {}", short_hash(c)),
            Pin::Tag(t) => format!("tag {}", t),
            Pin::Branch(b) => format!("branch {}", b),
        }
    }
}

pub struct GitSource {
    url: String,
    pin: Option<Pin>,
}

impl GitSource {
    pub fn new(url: impl Into<String>, pin: Option<Pin>) -> Self {
        Self {
            url: url.into(),
            pin,
        }
    }

    pub fn pin(&self) -> Option<&Pin> {
        self.pin.as_ref()
    }

    fn clone_into(&self, dir: &Path) -> Result<Repository> {
        if dir.exists() && fs::read_dir(dir)?.next().is_some() {
            anyhow::bail!(
                "{} exists but is not a git repository. Delete it to clone '{}'",
                dir.display(),
                self.url
            );
        }
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent)?;
        }

        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.blue} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⣾⣽⣻⢿⡿⣟⣯⣷"),
        );
        pb.set_message(format!("Cloning {}...", self.url));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        match Repository::clone(&self.url, dir) {
            Ok(repo) => {
                pb.finish_with_message(format!("{} Cloned {}", "✓".green(), self.url));
                Ok(repo)
            }
            Err(err) => {
                pb.finish_with_message(format!("{} Failed {}", "x".red(), self.url));
                Err(anyhow::anyhow!("Failed to clone '{}': {}", self.url, err))
            }
        }
    }

    /// Commit id of a commit or tag pin, fetching once if it is not known locally.
    fn resolve_pinned(&self, repo: &Repository, pin: &Pin) -> Result<Oid> {
        if let Some(oid) = lookup_pin(repo, pin) {
            return Ok(oid);
        }
        fetch_origin(repo)?;
        lookup_pin(repo, pin)
            .with_context(|| format!("'{}' has no {}", self.url, pin.describe()))
    }

    fn checkout_pinned(&self, repo: &Repository, pin: &Pin) -> Result<()> {
        let oid = self.resolve_pinned(repo, pin)?;
        let at_pin = repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
            .is_some_and(|commit| commit.id() == oid);
        if at_pin && !has_local_changes(repo)? {
            ui::info(format!("Already at {}", pin.describe()));
            return Ok(());
        }
        checkout_detached(repo, oid, &pin.describe())
    }

    fn pull(&self, repo: &Repository) -> Result<()> {
        fetch_origin(repo)?;
        let branch = match &self.pin {
            Some(Pin::Branch(branch)) => {
                checkout_branch(repo, branch)?;
                branch.clone()
            }
            _ => {
                let head = repo.head().context("Repository has no HEAD")?;
                if !head.is_branch() {
                    ui::warning(format!(
                        "{} is not on a branch, not pulling updates",
                        self.url
                    ));
                    return Ok(());
                }
                head.shorthand().unwrap_or("HEAD").to_string()
            }
        };
        fast_forward(repo, &branch)
    }
}

impl Retrieve for GitSource {
    fn kind(&self) -> &'static str {
        "git"
    }

    fn version_key(&self) -> Option<String> {
        match &self.pin {
            Some(Pin::Commit(c)) => Some(c.clone()),
            Some(Pin::Tag(t)) => Some(t.clone()),
            _ => None,
        }
    }

    fn retrieve(&self, _ctx: &Context, dir: &Path) -> Result<()> {
        if self.requires_clone(dir) {
            let repo = self.clone_into(dir)?;
            return match &self.pin {
                Some(pin @ (Pin::Commit(_) | Pin::Tag(_))) => self.checkout_pinned(&repo, pin),
                Some(Pin::Branch(branch)) => checkout_branch(&repo, branch),
                None => Ok(()),
            };
        }

        let repo = Repository::open(dir)
            .with_context(|| format!("Failed to open repository {}", dir.display()))?;
        match &self.pin {
            Some(pin) if pin.is_specific() => self.checkout_pinned(&repo, pin),
            _ => self.pull(&repo),
        }
    }

    fn requires_clone(&self, dir: &Path) -> bool {
        !dir.join(".git").exists()
    }

    fn is_using_specific_commit(&self) -> bool {
        self.pin.as_ref().is_some_and(Pin::is_specific)
    }

    fn make_sure_right_commit_is_checked_out(&self, _ctx: &Context, dir: &Path) -> Result<()> {
        let Some(pin) = self.pin.as_ref().filter(|pin| pin.is_specific()) else {
            return Ok(());
        };
        let repo = Repository::open(dir)
            .with_context(|| format!("Failed to open repository {}", dir.display()))?;
        self.checkout_pinned(&repo, pin)
    }
}

fn lookup_pin(repo: &Repository, pin: &Pin) -> Option<Oid> {
    let spec = match pin {
        Pin::Commit(c) => c.clone(),
        Pin::Tag(t) => format!("refs/tags/{}", t),
        Pin::Branch(b) => format!("refs/remotes/origin/{}", b),
    };
    repo.revparse_single(&spec)
        .ok()
        .and_then(|obj| obj.peel_to_commit().ok())
        .map(|commit| commit.id())
}

fn fetch_origin(repo: &Repository) -> Result<()> {
    let mut remote = repo
        .find_remote("origin")
        .context("Repository has no 'origin' remote")?;
    let mut options = FetchOptions::new();
    options.download_tags(AutotagOption::All);
    remote
        .fetch(&[] as &[&str], Some(&mut options), None)
        .context("Failed to fetch from origin")?;
    Ok(())
}

fn has_local_changes(repo: &Repository) -> Result<bool> {
    let mut options = git2::StatusOptions::new();
    options.include_untracked(false);
    let statuses = repo.statuses(Some(&mut options))?;
    Ok(!statuses.is_empty())
}

fn checkout_detached(repo: &Repository, oid: Oid, what: &str) -> Result<()> {
    repo.set_head_detached(oid)?;
    let obj = repo.find_object(oid, None)?;
    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_tree(&obj, Some(&mut checkout))
        .with_context(|| format!("Failed to checkout {}", what))?;
    println!("   {} Checked out {}", "📌".blue(), what);
    Ok(())
}

fn checkout_branch(repo: &Repository, branch: &str) -> Result<()> {
    let local_ref = format!("refs/heads/{}", branch);
    let commit = match repo.find_reference(&local_ref) {
        Ok(reference) => reference.peel_to_commit()?,
        Err(_) => {
            let commit = repo
                .find_reference(&format!("refs/remotes/origin/{}", branch))
                .with_context(|| format!("No branch '{}' on origin", branch))?
                .peel_to_commit()?;
            let mut created = repo.branch(branch, &commit, false)?;
            created.set_upstream(Some(format!("origin/{}", branch).as_str()))?;
            commit
        }
    };
    update_worktree(repo, commit.id())
        .with_context(|| format!("Failed to checkout branch {}", branch))?;
    repo.set_head(&local_ref)?;
    Ok(())
}

/// Moves the working tree to `oid` relative to the current HEAD.
///
/// Must run before any ref is moved, otherwise the new tree becomes the
/// baseline and nothing gets written.
fn update_worktree(repo: &Repository, oid: Oid) -> Result<()> {
    let obj = repo.find_object(oid, None)?;
    let mut checkout = CheckoutBuilder::new();
    checkout.safe();
    repo.checkout_tree(&obj, Some(&mut checkout))?;
    Ok(())
}

fn fast_forward(repo: &Repository, branch: &str) -> Result<()> {
    let Some(target) = lookup_pin(repo, &Pin::Branch(branch.to_string())) else {
        ui::warning(format!("No upstream for branch {}, not pulling", branch));
        return Ok(());
    };
    let annotated = repo.find_annotated_commit(target)?;
    let (analysis, _) = repo.merge_analysis(&[&annotated])?;

    if analysis.is_up_to_date() {
        return Ok(());
    }
    if !analysis.is_fast_forward() {
        ui::warning(format!(
            "Branch {} has diverged from origin, leaving it as is",
            branch
        ));
        return Ok(());
    }

    update_worktree(repo, target)
        .with_context(|| format!("Failed to update working tree of {}", branch))?;
    let local_ref = format!("refs/heads/{}", branch);
    let mut reference = repo.find_reference(&local_ref)?;
    reference.set_target(target, &format!("fast-forward {} to {}", branch, target))?;
    repo.set_head(&local_ref)?;
    ui::success(format!("Updated {} to {}", branch, short_hash(&target.to_string())));
    Ok(())
}

fn short_hash(rev: &str) -> &str {
    rev.get(..7).unwrap_or(rev)
}
