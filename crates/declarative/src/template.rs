//! Desired configuration for an instance
//!
//! A [`DesiredTemplate`] is produced by an external resolver (inheritance,
//! includes, and parameters are already applied) and is never modified here.

use crate::error::{Error, Result};
use crate::managers::ManagerRegistry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Terminator used for heredocs in rendered scripts.
pub(crate) const HEREDOC_MARKER: &str = "RETROFIT_EOF";

static PACKAGE_SPEC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9][A-Za-z0-9._+\-]*)\s*(?:(==|>=|=|@)\s*([A-Za-z0-9][A-Za-z0-9._+\-:~]*))?$")
        .expect("static regex")
});

static ACCOUNT_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("static regex"));

/// Packages one manager should provide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSet {
    /// Manager-specific target: conda env name or prefix, venv path, spack env
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Package specs: `name`, `name=ver`, `name==ver`, `name>=ver`, `name@ver`
    #[serde(default)]
    pub install: Vec<String>,
    /// Packages this template owns and wants gone
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

/// A systemd service the template manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    /// Port the service listens on once started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Lines of the managed drop-in (e.g. `[Service]`, `Environment=...`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<String>,
    #[serde(default = "default_true")]
    pub enable: bool,
}

fn default_true() -> bool {
    true
}

/// A user account the template manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// Fully-resolved target configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredTemplate {
    pub id: String,
    pub version: String,
    /// Package requirements keyed by manager name
    #[serde(default)]
    pub packages: BTreeMap<String, PackageSet>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub users: Vec<UserSpec>,
    /// Ports that must be reachable, in addition to service ports
    #[serde(default)]
    pub ports: Vec<u16>,
}

/// A parsed package requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: String,
    /// Minimum (and pinned install) version
    pub version: Option<String>,
}

impl PackageSpec {
    /// Parse a spec string like `numpy>=1.26`.
    pub fn parse(raw: &str) -> Result<Self> {
        let caps = PACKAGE_SPEC
            .captures(raw.trim())
            .ok_or_else(|| Error::template(format!("malformed package spec '{raw}'")))?;
        Ok(Self {
            name: caps[1].to_string(),
            version: caps.get(3).map(|m| m.as_str().to_string()),
        })
    }
}

impl DesiredTemplate {
    /// Per-manager targets, for inspecting the right environments.
    pub fn targets(&self) -> BTreeMap<String, Option<String>> {
        self.packages
            .iter()
            .map(|(manager, set)| (manager.clone(), set.target.clone()))
            .collect()
    }

    /// Every port the template needs open: explicit ports plus service ports.
    pub fn required_ports(&self) -> BTreeSet<u16> {
        self.ports
            .iter()
            .copied()
            .chain(self.services.iter().filter_map(|s| s.port))
            .collect()
    }

    /// Reject malformed input before any diffing happens.
    pub fn validate(&self, registry: &ManagerRegistry) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::template("template id is empty"));
        }
        if self.version.trim().is_empty() {
            return Err(Error::template(format!("template {} has no version", self.id)));
        }

        for (manager, set) in &self.packages {
            if registry.get(manager).is_none() {
                return Err(Error::template(format!(
                    "unknown package manager '{manager}' (known: {})",
                    registry.names().collect::<Vec<_>>().join(", ")
                )));
            }
            let mut installs = BTreeSet::new();
            for raw in &set.install {
                installs.insert(PackageSpec::parse(raw)?.name);
            }
            for raw in &set.remove {
                let spec = PackageSpec::parse(raw)?;
                if installs.contains(&spec.name) {
                    return Err(Error::template(format!(
                        "{manager}: '{}' is both installed and removed",
                        spec.name
                    )));
                }
            }
        }

        let mut service_names = BTreeSet::new();
        let mut service_ports = BTreeMap::new();
        for service in &self.services {
            if service.name.trim().is_empty() || service.name.contains('/') {
                return Err(Error::template(format!(
                    "invalid service name '{}'",
                    service.name
                )));
            }
            if !service_names.insert(service.name.as_str()) {
                return Err(Error::template(format!(
                    "service '{}' declared twice",
                    service.name
                )));
            }
            if let Some(port) = service.port {
                if port == 0 {
                    return Err(Error::template(format!("service '{}' has port 0", service.name)));
                }
                if let Some(other) = service_ports.insert(port, service.name.as_str()) {
                    return Err(Error::template(format!(
                        "port {port} declared by both '{other}' and '{}'",
                        service.name
                    )));
                }
            }
            if service.config.iter().any(|l| l.trim() == HEREDOC_MARKER) {
                return Err(Error::template(format!(
                    "service '{}' config contains a reserved line",
                    service.name
                )));
            }
        }

        let mut user_names = BTreeSet::new();
        for user in &self.users {
            if !ACCOUNT_NAME.is_match(&user.name) {
                return Err(Error::template(format!("invalid user name '{}'", user.name)));
            }
            if !user_names.insert(user.name.as_str()) {
                return Err(Error::template(format!("user '{}' declared twice", user.name)));
            }
            if let Some(group) = user.groups.iter().find(|g| !ACCOUNT_NAME.is_match(g)) {
                return Err(Error::template(format!(
                    "user '{}' has invalid group '{group}'",
                    user.name
                )));
            }
            if let Some(shell) = &user.shell
                && !shell.starts_with('/')
            {
                return Err(Error::template(format!(
                    "user '{}' shell must be an absolute path",
                    user.name
                )));
            }
        }

        if self.ports.contains(&0) {
            return Err(Error::template("port 0 is not a valid port"));
        }

        Ok(())
    }
}
