//! Engine settings shared by inspection, checkpoints, and apply.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the template application engine.
///
/// Deserializes from the `[engine]` table of the CLI config; every field has
/// a default so an empty table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Lowest UID treated as a managed (template-owned) account
    pub managed_uid_floor: u32,
    /// UIDs at or above this are system accounts again (`nobody` and friends)
    pub managed_uid_ceiling: u32,
    /// On-instance path of the application history file
    pub history_path: String,
    /// On-instance directory holding checkpoints
    pub checkpoint_dir: String,
    /// Files backed up verbatim in every checkpoint
    pub managed_config_files: Vec<String>,
    /// Environment variables captured in every checkpoint
    pub env_allowlist: Vec<String>,
    /// Name of the systemd drop-in written for configured services
    pub dropin_name: String,
    /// Lease expiry, in seconds
    pub lease_ttl_secs: u64,
    /// Login shell for created users that do not declare one
    pub default_shell: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            managed_uid_floor: 5000,
            managed_uid_ceiling: 60000,
            history_path: "/var/lib/retrofit/history.json".to_string(),
            checkpoint_dir: "/var/lib/retrofit/checkpoints".to_string(),
            managed_config_files: [
                "/etc/passwd",
                "/etc/group",
                "/etc/shadow",
                "/etc/gshadow",
                "/etc/sudoers",
                "/etc/environment",
            ]
            .map(String::from)
            .to_vec(),
            env_allowlist: [
                "PATH",
                "LD_LIBRARY_PATH",
                "PYTHONPATH",
                "CONDA_DEFAULT_ENV",
                "VIRTUAL_ENV",
                "JAVA_HOME",
                "GOPATH",
                "SPACK_ROOT",
            ]
            .map(String::from)
            .to_vec(),
            dropin_name: "retrofit".to_string(),
            lease_ttl_secs: 30 * 60,
            default_shell: "/bin/bash".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Whether `uid` falls in the managed range.
    pub fn is_managed_uid(&self, uid: u32) -> bool {
        uid >= self.managed_uid_floor && uid < self.managed_uid_ceiling
    }

    /// Path of the managed drop-in for a service.
    pub fn dropin_path(&self, service: &str) -> String {
        format!(
            "/etc/systemd/system/{service}.service.d/{}.conf",
            self.dropin_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_uid_range() {
        let settings = EngineSettings::default();
        assert!(!settings.is_managed_uid(200));
        assert!(settings.is_managed_uid(5000));
        assert!(settings.is_managed_uid(5001));
        assert!(!settings.is_managed_uid(65534));
    }

    #[test]
    fn test_partial_table_keeps_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"managed_uid_floor": 1000}"#).unwrap();
        assert_eq!(settings.managed_uid_floor, 1000);
        assert_eq!(settings.dropin_name, "retrofit");
        assert_eq!(
            settings.dropin_path("jupyter"),
            "/etc/systemd/system/jupyter.service.d/retrofit.conf"
        );
    }
}
