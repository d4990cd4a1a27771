//! Diff computation between an instance and a template
//!
//! [`compute_diff`] is a pure function of one `(InstanceState,
//! DesiredTemplate)` pair. It never decides to remove something the template
//! did not explicitly claim, and it always reports conflicts, even when the
//! caller intends to override them.

use crate::error::Result;
use crate::managers::ManagerRegistry;
use crate::settings::EngineSettings;
use crate::template::{DesiredTemplate, PackageSpec, ServiceSpec};
use crate::types::{InstanceState, PackageMap, config_digest};
use crate::version::is_newer;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// One package to install, upgrade, or remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageChange {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
}

/// Package changes for one manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install: Vec<PackageChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upgrade: Vec<PackageChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<PackageChange>,
}

impl ManagerDiff {
    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.upgrade.is_empty() && self.remove.is_empty()
    }
}

/// Drop-in and enablement to write for a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfigChange {
    pub name: String,
    /// Drop-in lines; empty means only enablement changes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<String>,
    pub enable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserAction {
    Create,
    Modify,
}

/// An account to create, or groups to add to an existing account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserChange {
    pub name: String,
    pub action: UserAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    /// Login shell, for new accounts only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    /// Groups to add; existing memberships are never revoked
    #[serde(default)]
    pub add_groups: Vec<String>,
}

/// Conflict categories; each can be overridden independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictCategory {
    /// The same package is claimed by more than one manager
    PackageOwnership,
    /// A desired port is bound by an undeclared process
    Port,
    /// A desired account collides with an existing one
    User,
}

impl ConflictCategory {
    pub const ALL: [Self; 3] = [Self::PackageOwnership, Self::Port, Self::User];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PackageOwnership => "package-ownership",
            Self::Port => "port",
            Self::User => "user",
        }
    }
}

impl fmt::Display for ConflictCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "package-ownership" | "package" | "packages" => Ok(Self::PackageOwnership),
            "port" | "ports" => Ok(Self::Port),
            "user" | "users" => Ok(Self::User),
            other => Err(format!(
                "unknown conflict category '{other}' (expected package-ownership, port, or user)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub category: ConflictCategory,
    /// Package, port, or account the conflict is about
    pub subject: String,
    pub description: String,
}

/// Change set moving an instance toward a template, plus conflicts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub template_id: String,
    pub template_version: String,
    /// Package changes keyed by manager; managers with nothing to do are absent
    pub packages: BTreeMap<String, ManagerDiff>,
    pub services_to_configure: Vec<ServiceConfigChange>,
    pub services_to_start: Vec<String>,
    pub services_to_restart: Vec<String>,
    pub users_to_create: Vec<UserChange>,
    pub users_to_modify: Vec<UserChange>,
    pub groups_to_create: Vec<String>,
    /// Ports an external collaborator must open; never touched here
    pub ports_to_open: Vec<u16>,
    pub conflicts: Vec<Conflict>,
}

impl Diff {
    /// Whether applying this diff would change the instance.
    pub fn has_changes(&self) -> bool {
        !self.packages.values().all(ManagerDiff::is_empty)
            || !self.services_to_configure.is_empty()
            || !self.services_to_start.is_empty()
            || !self.services_to_restart.is_empty()
            || !self.users_to_create.is_empty()
            || !self.users_to_modify.is_empty()
            || !self.groups_to_create.is_empty()
    }

    /// No changes, no ports to open, and no conflicts.
    pub fn is_empty(&self) -> bool {
        !self.has_changes() && self.ports_to_open.is_empty() && self.conflicts.is_empty()
    }

    pub fn has_removals(&self) -> bool {
        self.packages.values().any(|m| !m.remove.is_empty())
    }

    /// Conflicts whose category was not overridden.
    pub fn blocking_conflicts(&self, overrides: &BTreeSet<ConflictCategory>) -> Vec<&Conflict> {
        self.conflicts
            .iter()
            .filter(|c| !overrides.contains(&c.category))
            .collect()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        for (manager, changes) in &self.packages {
            let names = |list: &[PackageChange]| {
                list.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", ")
            };
            if !changes.install.is_empty() {
                parts.push(format!("{manager} install: {}", names(&changes.install)));
            }
            if !changes.upgrade.is_empty() {
                parts.push(format!("{manager} upgrade: {}", names(&changes.upgrade)));
            }
            if !changes.remove.is_empty() {
                parts.push(format!("{manager} remove: {}", names(&changes.remove)));
            }
        }
        if !self.groups_to_create.is_empty() {
            parts.push(format!("create groups: {}", self.groups_to_create.join(", ")));
        }
        let users = |list: &[UserChange]| {
            list.iter().map(|u| u.name.as_str()).collect::<Vec<_>>().join(", ")
        };
        if !self.users_to_create.is_empty() {
            parts.push(format!("create users: {}", users(&self.users_to_create)));
        }
        if !self.users_to_modify.is_empty() {
            parts.push(format!("modify users: {}", users(&self.users_to_modify)));
        }
        if !self.services_to_configure.is_empty() {
            let names: Vec<&str> = self
                .services_to_configure
                .iter()
                .map(|s| s.name.as_str())
                .collect();
            parts.push(format!("configure: {}", names.join(", ")));
        }
        if !self.services_to_start.is_empty() {
            parts.push(format!("start: {}", self.services_to_start.join(", ")));
        }
        if !self.services_to_restart.is_empty() {
            parts.push(format!("restart: {}", self.services_to_restart.join(", ")));
        }
        if !self.ports_to_open.is_empty() {
            let ports: Vec<String> = self.ports_to_open.iter().map(u16::to_string).collect();
            parts.push(format!("open ports: {}", ports.join(", ")));
        }
        if !self.conflicts.is_empty() {
            parts.push(format!("{} conflict(s)", self.conflicts.len()));
        }
        if parts.is_empty() {
            "no changes".to_string()
        } else {
            parts.join("; ")
        }
    }
}

/// Contents of the managed drop-in for a service.
pub fn render_service_dropin(spec: &ServiceSpec) -> String {
    let mut out = spec.config.join("\n");
    out.push('\n');
    out
}

fn lookup<'a>(installed: Option<&'a PackageMap>, name: &str) -> Option<&'a String> {
    let installed = installed?;
    installed
        .get(name)
        .or_else(|| installed.get(&name.to_lowercase()))
}

/// Compute the diff from `state` to `template`.
///
/// Fails only when the template itself is malformed.
pub fn compute_diff(
    state: &InstanceState,
    template: &DesiredTemplate,
    registry: &ManagerRegistry,
    settings: &EngineSettings,
) -> Result<Diff> {
    template.validate(registry)?;

    let mut diff = Diff {
        template_id: template.id.clone(),
        template_version: template.version.clone(),
        ..Default::default()
    };

    diff_packages(state, template, &mut diff)?;
    diff_users(state, template, settings, &mut diff);
    diff_services(state, template, &mut diff);
    diff_ports(state, template, &mut diff);

    log::debug!("diff for {}: {}", template.id, diff.summary());
    Ok(diff)
}

fn diff_packages(state: &InstanceState, template: &DesiredTemplate, diff: &mut Diff) -> Result<()> {
    let mut owners: BTreeMap<String, Vec<&str>> = BTreeMap::new();

    for (manager, set) in &template.packages {
        let installed = state.packages.get(manager);
        let mut changes = ManagerDiff {
            target: set.target.clone(),
            ..Default::default()
        };

        for raw in &set.install {
            let spec = PackageSpec::parse(raw)?;
            owners.entry(spec.name.clone()).or_default().push(manager);
            match lookup(installed, &spec.name) {
                None => changes.install.push(PackageChange {
                    name: spec.name,
                    current_version: None,
                    target_version: spec.version,
                }),
                Some(current) => {
                    if let Some(target) = spec.version
                        && is_newer(&target, current)
                    {
                        changes.upgrade.push(PackageChange {
                            name: spec.name,
                            current_version: Some(current.clone()),
                            target_version: Some(target),
                        });
                    }
                }
            }
        }

        for raw in &set.remove {
            let spec = PackageSpec::parse(raw)?;
            if let Some(current) = lookup(installed, &spec.name) {
                changes.remove.push(PackageChange {
                    name: spec.name,
                    current_version: Some(current.clone()),
                    target_version: None,
                });
            }
        }

        if !changes.is_empty() {
            diff.packages.insert(manager.clone(), changes);
        }
    }

    for (package, managers) in owners {
        if managers.len() > 1 {
            diff.conflicts.push(Conflict {
                category: ConflictCategory::PackageOwnership,
                description: format!("{package} is claimed by {}", managers.join(" and ")),
                subject: package,
            });
        }
    }
    Ok(())
}

fn diff_users(
    state: &InstanceState,
    template: &DesiredTemplate,
    settings: &EngineSettings,
    diff: &mut Diff,
) {
    let mut new_groups = BTreeSet::new();

    for user in &template.users {
        for group in &user.groups {
            if !state.groups.contains(group) {
                new_groups.insert(group.clone());
            }
        }

        if let Some(uid) = user.uid
            && let Some(owner) = state.uid_owner(uid)
            && owner != user.name
        {
            diff.conflicts.push(Conflict {
                category: ConflictCategory::User,
                subject: user.name.clone(),
                description: format!("uid {uid} for {} is already owned by {owner}", user.name),
            });
        }

        if let Some(existing) = state.users.get(&user.name) {
            let missing: Vec<String> = user
                .groups
                .iter()
                .filter(|g| !existing.groups.contains(*g))
                .cloned()
                .collect();
            if !missing.is_empty() {
                diff.users_to_modify.push(UserChange {
                    name: user.name.clone(),
                    action: UserAction::Modify,
                    uid: None,
                    shell: None,
                    add_groups: missing,
                });
            }
        } else if let Some(uid) = state.system_accounts.get(&user.name) {
            diff.conflicts.push(Conflict {
                category: ConflictCategory::User,
                subject: user.name.clone(),
                description: format!(
                    "{} already exists as a system account (uid {uid}, outside the managed range)",
                    user.name
                ),
            });
            // With the conflict overridden, only missing groups are added
            let current = state.system_account_groups.get(&user.name);
            let missing: Vec<String> = user
                .groups
                .iter()
                .filter(|g| !current.is_some_and(|have| have.contains(*g)))
                .cloned()
                .collect();
            if !missing.is_empty() {
                diff.users_to_modify.push(UserChange {
                    name: user.name.clone(),
                    action: UserAction::Modify,
                    uid: None,
                    shell: None,
                    add_groups: missing,
                });
            }
        } else {
            diff.users_to_create.push(UserChange {
                name: user.name.clone(),
                action: UserAction::Create,
                uid: user.uid,
                shell: Some(
                    user.shell
                        .clone()
                        .unwrap_or_else(|| settings.default_shell.clone()),
                ),
                add_groups: user.groups.clone(),
            });
        }
    }

    diff.groups_to_create = new_groups.into_iter().collect();
}

fn diff_services(state: &InstanceState, template: &DesiredTemplate, diff: &mut Diff) {
    for spec in &template.services {
        let configure = ServiceConfigChange {
            name: spec.name.clone(),
            config: spec.config.clone(),
            enable: spec.enable,
        };

        let Some(current) = state.services.get(&spec.name) else {
            diff.services_to_configure.push(configure);
            diff.services_to_start.push(spec.name.clone());
            continue;
        };

        let config_changed = !spec.config.is_empty()
            && current.config_digest.as_deref()
                != Some(config_digest(&render_service_dropin(spec)).as_str());
        let enable_needed = spec.enable && !current.enabled;

        if config_changed || enable_needed {
            diff.services_to_configure.push(configure);
        }
        if !current.active {
            diff.services_to_start.push(spec.name.clone());
        } else if config_changed {
            diff.services_to_restart.push(spec.name.clone());
        }
    }
}

fn diff_ports(state: &InstanceState, template: &DesiredTemplate, diff: &mut Diff) {
    let mut declaring: BTreeMap<u16, &ServiceSpec> = BTreeMap::new();
    for service in &template.services {
        if let Some(port) = service.port {
            declaring.insert(port, service);
        }
    }

    for port in template.required_ports() {
        let Some(owner) = state.ports.get(&port) else {
            diff.ports_to_open.push(port);
            continue;
        };
        let Some(service) = declaring.get(&port) else {
            continue;
        };
        let active = state.services.get(&service.name).is_some_and(|s| s.active);
        let owned_by_service = owner
            .as_deref()
            .is_some_and(|p| p.contains(&service.name) || service.name.contains(p));
        if !active && !owned_by_service {
            diff.conflicts.push(Conflict {
                category: ConflictCategory::Port,
                subject: port.to_string(),
                description: format!(
                    "port {port} for {} is already bound by {}",
                    service.name,
                    owner.as_deref().unwrap_or("an unknown process")
                ),
            });
        }
    }
}
