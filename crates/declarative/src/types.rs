//! Point-in-time view of an instance

use crate::history::ApplicationRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Installed packages of one manager: name → version.
pub type PackageMap = BTreeMap<String, String>;

/// Observed state of a systemd service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    /// `ActiveState` is `active`
    pub active: bool,
    /// Unit file state is `enabled`
    pub enabled: bool,
    /// blake3 of the managed drop-in, when one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,
}

/// blake3 digest of a config file, ignoring trailing whitespace.
///
/// Inspection reads files through `cat`, which can add or drop a final
/// newline; both sides are normalized the same way before hashing.
pub fn config_digest(contents: &str) -> String {
    let normalized: Vec<&str> = contents.trim_end().lines().map(str::trim_end).collect();
    blake3::hash(normalized.join("\n").as_bytes()).to_hex().to_string()
}

/// A managed user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub name: String,
    pub uid: u32,
    /// Primary and supplementary groups
    pub groups: BTreeSet<String>,
    pub shell: String,
}

/// Snapshot of an instance's packages, services, accounts, ports, and history.
///
/// Recomputed on every inspection; never cached across operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Installed packages per manager; managers missing on the instance have no entry
    #[serde(default)]
    pub packages: BTreeMap<String, PackageMap>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceState>,
    /// Accounts in the managed UID range
    #[serde(default)]
    pub users: BTreeMap<String, UserAccount>,
    /// Accounts outside the managed range: name → uid
    #[serde(default)]
    pub system_accounts: BTreeMap<String, u32>,
    /// Supplementary and primary groups of system accounts
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub system_account_groups: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    /// Listening TCP ports → owning process, when known
    #[serde(default)]
    pub ports: BTreeMap<u16, Option<String>>,
    #[serde(default)]
    pub history: Vec<ApplicationRecord>,
    pub inspected_at: DateTime<Utc>,
    /// Sub-inspections that failed without aborting the whole inspection
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self {
            packages: BTreeMap::new(),
            services: BTreeMap::new(),
            users: BTreeMap::new(),
            system_accounts: BTreeMap::new(),
            system_account_groups: BTreeMap::new(),
            groups: BTreeSet::new(),
            ports: BTreeMap::new(),
            history: Vec::new(),
            inspected_at: Utc::now(),
            warnings: Vec::new(),
        }
    }
}

impl InstanceState {
    /// Installed version of `name` under `manager`.
    pub fn package_version(&self, manager: &str, name: &str) -> Option<&str> {
        self.packages
            .get(manager)
            .and_then(|pkgs| pkgs.get(name))
            .map(String::as_str)
    }

    /// Account (managed or system) that owns `uid`.
    pub fn uid_owner(&self, uid: u32) -> Option<&str> {
        self.users
            .values()
            .find(|u| u.uid == uid)
            .map(|u| u.name.as_str())
            .or_else(|| {
                self.system_accounts
                    .iter()
                    .find(|(_, id)| **id == uid)
                    .map(|(name, _)| name.as_str())
            })
    }

    /// Total number of installed packages across managers.
    pub fn package_count(&self) -> usize {
        self.packages.values().map(BTreeMap::len).sum()
    }
}
