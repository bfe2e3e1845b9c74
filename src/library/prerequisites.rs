use super::{PrerequisiteError, Prerequisites};
use crate::context::Context;
use crate::exec::{self, OutputStyle};
use crate::platform::{self, Os, PackageManager};
use crate::ui;
use anyhow::Result;
use std::collections::BTreeMap;

/// OS packages keyed by platform id (`fedora`, `ubuntu`, `mac`, ...).
///
/// A `linux` key applies to any linux distribution without its own entry.
#[derive(Debug, Clone, Default)]
pub struct PackageList {
    packages: BTreeMap<String, Vec<String>>,
}

impl PackageList {
    pub fn new(packages: BTreeMap<String, Vec<String>>) -> Self {
        let packages = packages
            .into_iter()
            .map(|(platform, list)| (platform.to_lowercase(), list))
            .collect();
        Self { packages }
    }

    pub fn for_platform(&self, os: Os, platform_id: &str) -> Option<&[String]> {
        self.packages
            .get(platform_id)
            .or_else(|| match os {
                Os::Linux | Os::Other => self.packages.get("linux"),
                Os::Mac | Os::Windows => None,
            })
            .map(Vec::as_slice)
    }
}

impl Prerequisites for PackageList {
    fn package_list(&self, ctx: &Context) -> Result<Vec<String>, PrerequisiteError> {
        let platform = ctx.platform_id()?;
        self.for_platform(ctx.os, platform)
            .map(<[String]>::to_vec)
            .ok_or_else(|| PrerequisiteError::UnsupportedPlatform {
                platform: platform.to_string(),
            })
    }

    fn install_prerequisites(&self, ctx: &Context) -> Result<()> {
        let packages = self.package_list(ctx)?;
        if packages.is_empty() {
            return Ok(());
        }

        let platform = ctx.platform_id()?;
        let manager = PackageManager::for_platform(platform, &ctx.env).ok_or_else(|| {
            anyhow::anyhow!(
                "Don't know the package manager of '{}', install '{}' manually",
                platform,
                packages.join(" ")
            )
        })?;
        let use_sudo = platform::should_use_sudo(manager.wants_sudo(), ctx.options.allow_sudo, true);
        if use_sudo {
            ui::info("Running package installation with sudo. Be prepared to type your password");
        }

        let mut make = || manager.install_command(&packages, use_sudo, &ctx.env);
        let run = exec::run_stuck_prevention(&mut make, &OutputStyle::default(), ctx.stuck_prevention())?;
        if !run.status.success() {
            anyhow::bail!(
                "Installing packages '{}' with {} failed ({})",
                packages.join(" "),
                manager.program(),
                run.status
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> PackageList {
        let mut packages = BTreeMap::new();
        packages.insert("Fedora".to_string(), vec!["zlib-devel".to_string()]);
        packages.insert("linux".to_string(), vec!["zlib".to_string()]);
        packages.insert("windows".to_string(), vec![]);
        PackageList::new(packages)
    }

    #[test]
    fn test_exact_platform_wins_over_linux_fallback() {
        let packages = list();
        assert_eq!(
            packages.for_platform(Os::Linux, "fedora"),
            Some(&["zlib-devel".to_string()][..])
        );
        assert_eq!(
            packages.for_platform(Os::Linux, "arch"),
            Some(&["zlib".to_string()][..])
        );
    }

    #[test]
    fn test_missing_platform_is_unsupported() {
        let packages = list();
        assert_eq!(packages.for_platform(Os::Mac, "mac"), None);
        assert_eq!(packages.for_platform(Os::Windows, "windows"), Some(&[][..]));
    }

    #[test]
    fn test_package_list_reports_unsupported_platform() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::for_tests(dir.path());
        if ctx.os != Os::Linux {
            return;
        }
        let only_mac = PackageList::new(BTreeMap::from([(
            "mac".to_string(),
            vec!["cmake".to_string()],
        )]));
        match only_mac.package_list(&ctx) {
            Err(PrerequisiteError::UnsupportedPlatform { platform }) => assert_eq!(platform, "fedora"),
            other => panic!("expected unsupported platform, got {:?}", other),
        }
        assert_eq!(list().package_list(&ctx).unwrap(), vec!["zlib-devel".to_string()]);
    }
}
