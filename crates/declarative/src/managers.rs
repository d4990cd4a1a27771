//! Package manager strategies
//!
//! Each manager knows how to list what is installed and how to render
//! install/remove scripts. Adding a manager is one [`ManagerRegistry::register`]
//! call; diffing and apply never match on manager names.

use crate::error::{Error, Result};
use crate::types::PackageMap;
use remotekit::shell_quote;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Exit code the list commands use when the manager binary is missing.
pub const MANAGER_ABSENT_EXIT: i32 = 127;

/// A package to install or upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub name: String,
    pub version: Option<String>,
}

/// Strategy for one package manager.
pub trait PackageManager: Send + Sync {
    /// Registry key, e.g. "apt".
    fn name(&self) -> &'static str;

    /// Read-only command listing installed packages.
    ///
    /// Must exit [`MANAGER_ABSENT_EXIT`] when the manager is not installed.
    fn list_command(&self, target: Option<&str>) -> String;

    /// Parse the output of [`list_command`](Self::list_command).
    fn parse_installed(&self, stdout: &str) -> Result<PackageMap>;

    /// Shell lines installing or upgrading `packages` in one batch.
    fn render_install(&self, packages: &[InstallRequest], target: Option<&str>) -> Vec<String>;

    /// Shell lines removing `names`.
    ///
    /// With `best_effort`, each removal is tolerated individually.
    fn render_remove(&self, names: &[String], target: Option<&str>, best_effort: bool)
    -> Vec<String>;
}

/// Guard so a missing binary yields exit 127 instead of a shell error.
fn require(binary: &str) -> String {
    format!("command -v {binary} >/dev/null 2>&1 || exit {MANAGER_ABSENT_EXIT}; ")
}

fn join_args(items: impl IntoIterator<Item = String>) -> String {
    items
        .into_iter()
        .map(|s| shell_quote(&s))
        .collect::<Vec<_>>()
        .join(" ")
}

fn remove_lines(program: &str, names: &[String], best_effort: bool) -> Vec<String> {
    if names.is_empty() {
        return Vec::new();
    }
    if best_effort {
        names
            .iter()
            .map(|n| {
                format!(
                    "{program} {} || echo \"warning: could not remove {n}\" >&2",
                    shell_quote(n)
                )
            })
            .collect()
    } else {
        vec![format!("{program} {}", join_args(names.iter().cloned()))]
    }
}

fn parse_tab_separated(stdout: &str) -> PackageMap {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?.trim();
            let version = fields.next()?.trim();
            (!name.is_empty() && !version.is_empty()).then(|| (name.to_string(), version.to_string()))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct JsonPackage {
    name: String,
    version: String,
}

fn parse_json_list(stdout: &str, manager: &str) -> Result<PackageMap> {
    if stdout.trim().is_empty() {
        return Ok(PackageMap::new());
    }
    let entries: Vec<JsonPackage> = serde_json::from_str(stdout).map_err(|e| Error::Parse {
        what: format!("{manager} package list"),
        message: e.to_string(),
    })?;
    Ok(entries.into_iter().map(|p| (p.name, p.version)).collect())
}

/// Debian/Ubuntu packages via dpkg and apt-get.
pub struct Apt;

impl PackageManager for Apt {
    fn name(&self) -> &'static str {
        "apt"
    }

    fn list_command(&self, _target: Option<&str>) -> String {
        format!(
            "{}dpkg-query -W -f='${{Package}}\\t${{Version}}\\t${{Status}}\\n'",
            require("dpkg-query")
        )
    }

    fn parse_installed(&self, stdout: &str) -> Result<PackageMap> {
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split('\t').collect();
                match fields.as_slice() {
                    [name, version, status] if status.ends_with("installed") && !status.contains("not-installed") => {
                        Some(((*name).to_string(), (*version).to_string()))
                    }
                    _ => None,
                }
            })
            .collect())
    }

    fn render_install(&self, packages: &[InstallRequest], _target: Option<&str>) -> Vec<String> {
        let args = join_args(packages.iter().map(|p| match &p.version {
            Some(v) => format!("{}={v}", p.name),
            None => p.name.clone(),
        }));
        vec![
            "export DEBIAN_FRONTEND=noninteractive".to_string(),
            "apt-get update -y".to_string(),
            format!("apt-get install -y --no-install-recommends {args}"),
        ]
    }

    fn render_remove(&self, names: &[String], _target: Option<&str>, best_effort: bool) -> Vec<String> {
        let mut lines = vec!["export DEBIAN_FRONTEND=noninteractive".to_string()];
        lines.extend(remove_lines("apt-get remove -y", names, best_effort));
        lines
    }
}

/// RHEL/Fedora packages via rpm and dnf.
pub struct Dnf;

impl PackageManager for Dnf {
    fn name(&self) -> &'static str {
        "dnf"
    }

    fn list_command(&self, _target: Option<&str>) -> String {
        format!(
            "{}rpm -qa --qf '%{{NAME}}\\t%{{VERSION}}-%{{RELEASE}}\\n'",
            require("dnf")
        )
    }

    fn parse_installed(&self, stdout: &str) -> Result<PackageMap> {
        Ok(parse_tab_separated(stdout))
    }

    fn render_install(&self, packages: &[InstallRequest], _target: Option<&str>) -> Vec<String> {
        let args = join_args(packages.iter().map(|p| match &p.version {
            Some(v) => format!("{}-{v}", p.name),
            None => p.name.clone(),
        }));
        vec![format!("dnf install -y {args}")]
    }

    fn render_remove(&self, names: &[String], _target: Option<&str>, best_effort: bool) -> Vec<String> {
        remove_lines("dnf remove -y", names, best_effort)
    }
}

/// Conda environments. The target is an env name, or a prefix if it starts with `/`.
pub struct Conda;

impl Conda {
    fn env_flag(target: Option<&str>) -> String {
        match target {
            Some(t) if t.starts_with('/') => format!(" -p {}", shell_quote(t)),
            Some(t) => format!(" -n {}", shell_quote(t)),
            None => String::new(),
        }
    }
}

impl PackageManager for Conda {
    fn name(&self) -> &'static str {
        "conda"
    }

    fn list_command(&self, target: Option<&str>) -> String {
        format!("{}conda list --json{}", require("conda"), Self::env_flag(target))
    }

    fn parse_installed(&self, stdout: &str) -> Result<PackageMap> {
        parse_json_list(stdout, "conda")
    }

    fn render_install(&self, packages: &[InstallRequest], target: Option<&str>) -> Vec<String> {
        let args = join_args(packages.iter().map(|p| match &p.version {
            Some(v) => format!("{}={v}", p.name),
            None => p.name.clone(),
        }));
        vec![format!("conda install -y{} {args}", Self::env_flag(target))]
    }

    fn render_remove(&self, names: &[String], target: Option<&str>, best_effort: bool) -> Vec<String> {
        remove_lines(
            &format!("conda remove -y{}", Self::env_flag(target)),
            names,
            best_effort,
        )
    }
}

/// Python packages. The target is a virtualenv directory.
pub struct Pip;

impl Pip {
    fn python(target: Option<&str>) -> String {
        match target {
            Some(venv) => shell_quote(&format!("{}/bin/python", venv.trim_end_matches('/'))),
            None => "python3".to_string(),
        }
    }
}

impl PackageManager for Pip {
    fn name(&self) -> &'static str {
        "pip"
    }

    fn list_command(&self, target: Option<&str>) -> String {
        let python = Self::python(target);
        format!(
            "{python} -m pip --version >/dev/null 2>&1 || exit {MANAGER_ABSENT_EXIT}; \
             {python} -m pip list --format=json --disable-pip-version-check"
        )
    }

    fn parse_installed(&self, stdout: &str) -> Result<PackageMap> {
        // pip normalizes names case-insensitively
        Ok(parse_json_list(stdout, "pip")?
            .into_iter()
            .map(|(name, version)| (name.to_lowercase(), version))
            .collect())
    }

    fn render_install(&self, packages: &[InstallRequest], target: Option<&str>) -> Vec<String> {
        let args = join_args(packages.iter().map(|p| match &p.version {
            Some(v) => format!("{}=={v}", p.name),
            None => p.name.clone(),
        }));
        vec![format!(
            "{} -m pip install --disable-pip-version-check {args}",
            Self::python(target)
        )]
    }

    fn render_remove(&self, names: &[String], target: Option<&str>, best_effort: bool) -> Vec<String> {
        remove_lines(
            &format!("{} -m pip uninstall -y", Self::python(target)),
            names,
            best_effort,
        )
    }
}

/// Spack packages. The target is a spack environment.
pub struct Spack;

impl Spack {
    fn env_flag(target: Option<&str>) -> String {
        target
            .map(|t| format!(" -e {}", shell_quote(t)))
            .unwrap_or_default()
    }
}

impl PackageManager for Spack {
    fn name(&self) -> &'static str {
        "spack"
    }

    fn list_command(&self, target: Option<&str>) -> String {
        format!(
            "{}spack{} find --format '{{name}} {{version}}'",
            require("spack"),
            Self::env_flag(target)
        )
    }

    fn parse_installed(&self, stdout: &str) -> Result<PackageMap> {
        Ok(stdout
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                Some((fields.next()?.to_string(), fields.next()?.to_string()))
            })
            .collect())
    }

    fn render_install(&self, packages: &[InstallRequest], target: Option<&str>) -> Vec<String> {
        let args = join_args(packages.iter().map(|p| match &p.version {
            Some(v) => format!("{}@{v}", p.name),
            None => p.name.clone(),
        }));
        vec![format!("spack{} install {args}", Self::env_flag(target))]
    }

    fn render_remove(&self, names: &[String], target: Option<&str>, best_effort: bool) -> Vec<String> {
        remove_lines(
            &format!("spack{} uninstall -y", Self::env_flag(target)),
            names,
            best_effort,
        )
    }
}

/// Registry of package managers keyed by name.
#[derive(Clone, Default)]
pub struct ManagerRegistry {
    managers: BTreeMap<String, Arc<dyn PackageManager>>,
}

impl ManagerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with apt, dnf, conda, pip, and spack.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Apt);
        registry.register(Dnf);
        registry.register(Conda);
        registry.register(Pip);
        registry.register(Spack);
        registry
    }

    /// Add or replace a manager.
    pub fn register(&mut self, manager: impl PackageManager + 'static) {
        self.managers
            .insert(manager.name().to_string(), Arc::new(manager));
    }

    pub fn get(&self, name: &str) -> Option<&dyn PackageManager> {
        self.managers.get(name).map(AsRef::as_ref)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.managers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn PackageManager> {
        self.managers.values().map(AsRef::as_ref)
    }
}

impl std::fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
