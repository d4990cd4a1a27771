//! CLI configuration: engine settings, transports, and known instances.
//!
//! ```toml
//! [engine]
//! managed_uid_floor = 5000
//!
//! [ssh]
//! identity_file = "~/.ssh/lab"
//! user = "admin"
//!
//! [relay]
//! endpoint = "https://relay.internal/v1"
//! token_env = "RETROFIT_RELAY_TOKEN"
//!
//! [instances.lab-1]
//! address = "10.0.0.7"
//!
//! [instances.gpu-2]
//! address = "i-0abc123"
//! transport = "relay"
//! ```

use anyhow::{Context, Result, bail};
use declarative::{DesiredTemplate, EngineSettings};
use remotekit::{InstanceRef, RelayExecutor, RemoteExecutor, RetryConfig, SshExecutor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineSettings,
    pub ssh: SshConfig,
    pub relay: Option<RelayConfig>,
    pub retry: RetrySettings,
    pub instances: BTreeMap<String, InstanceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub identity_file: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub connect_timeout_secs: u64,
    pub strict_host_key_checking: bool,
    pub ssh_program: String,
    pub scp_program: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            identity_file: None,
            user: None,
            port: None,
            connect_timeout_secs: 15,
            strict_host_key_checking: true,
            ssh_program: "ssh".to_string(),
            scp_program: "scp".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub endpoint: String,
    /// Environment variable holding the bearer token
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_poll_ms() -> u64 {
    1000
}

fn default_command_timeout() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Ssh,
    Relay,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceEntry {
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub transport: Transport,
}

impl Config {
    /// Load the config file; a missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => paths::config_file()?,
        };
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Resolve a CLI instance argument: a configured name, or `[user@]host`.
    pub fn resolve_instance(&self, arg: &str) -> (InstanceRef, Transport) {
        if let Some(entry) = self.instances.get(arg) {
            let mut instance = InstanceRef::new(arg);
            if let Some(address) = &entry.address {
                instance = instance.with_address(address);
            }
            if let Some(user) = &entry.user {
                instance = instance.with_user(user);
            }
            return (instance, entry.transport);
        }
        match arg.split_once('@') {
            Some((user, host)) if !user.is_empty() && !host.is_empty() => {
                (InstanceRef::new(host).with_user(user), Transport::Ssh)
            }
            _ => (InstanceRef::new(arg), Transport::Ssh),
        }
    }

    /// Build the executor for a transport.
    pub fn executor(&self, transport: Transport) -> Result<Arc<dyn RemoteExecutor>> {
        self.executor_with(transport, |key| std::env::var(key).ok())
    }

    fn executor_with(
        &self,
        transport: Transport,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Arc<dyn RemoteExecutor>> {
        let retry = self.retry.to_retry_config();
        match transport {
            Transport::Ssh => {
                let mut ssh = SshExecutor::new()
                    .with_programs(&self.ssh.ssh_program, &self.ssh.scp_program);
                ssh.identity_file = self
                    .ssh
                    .identity_file
                    .as_deref()
                    .map(paths::expand);
                ssh.default_user.clone_from(&self.ssh.user);
                ssh.port = self.ssh.port;
                ssh.connect_timeout = Duration::from_secs(self.ssh.connect_timeout_secs);
                ssh.strict_host_key_checking = self.ssh.strict_host_key_checking;
                ssh.retry = retry;
                Ok(Arc::new(ssh))
            }
            Transport::Relay => {
                let Some(relay) = &self.relay else {
                    bail!("instance uses the relay transport but [relay] is not configured");
                };
                let mut executor = RelayExecutor::new(&relay.endpoint);
                if let Some(var) = &relay.token_env {
                    let token = env(var).with_context(|| {
                        format!("relay token variable {var} is not set")
                    })?;
                    executor = executor.with_token(token);
                }
                executor.poll_interval = Duration::from_millis(relay.poll_interval_ms.max(1));
                executor.command_timeout = Duration::from_secs(relay.command_timeout_secs);
                executor.retry = retry;
                Ok(Arc::new(executor))
            }
        }
    }
}

/// Load a resolved template; `.toml` files are TOML, everything else JSON.
pub fn load_template(path: &Path) -> Result<DesiredTemplate> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Could not read template {}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let template = if is_toml {
        toml::from_str(&content)
            .with_context(|| format!("Invalid template {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid template {}", path.display()))?
    };
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[engine]
managed_uid_floor = 2000
lease_ttl_secs = 60

[ssh]
user = "admin"
port = 2222

[relay]
endpoint = "https://relay.example/v1"
token_env = "LAB_RELAY_TOKEN"

[retry]
max_attempts = 2

[instances.lab-1]
address = "10.0.0.7"
user = "ops"

[instances.gpu-2]
address = "i-0abc123"
transport = "relay"
"#;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_missing_config_is_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert!(config.instances.is_empty());
        assert_eq!(config.engine, EngineSettings::default());
    }

    #[test]
    fn test_load_sample() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.toml", SAMPLE);
        let config = Config::load(Some(&path)).unwrap();

        assert_eq!(config.engine.managed_uid_floor, 2000);
        assert_eq!(config.engine.lease_ttl_secs, 60);
        // Unset engine fields keep their defaults
        assert_eq!(config.engine.dropin_name, "retrofit");
        assert_eq!(config.ssh.port, Some(2222));
        assert!(config.ssh.strict_host_key_checking);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.instances["gpu-2"].transport, Transport::Relay);
        assert_eq!(config.instances["lab-1"].transport, Transport::Ssh);
    }

    #[test]
    fn test_malformed_config_names_file() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "config.toml", "[engine\nbroken");
        let err = Config::load(Some(&path)).unwrap_err();
        assert!(format!("{err}").contains("config.toml"));
    }

    #[test]
    fn test_resolve_instance() {
        let config: Config = toml::from_str(SAMPLE).unwrap();

        let (lab, transport) = config.resolve_instance("lab-1");
        assert_eq!(lab.name, "lab-1");
        assert_eq!(lab.target(), "10.0.0.7");
        assert_eq!(lab.user.as_deref(), Some("ops"));
        assert_eq!(transport, Transport::Ssh);

        let (adhoc, _) = config.resolve_instance("root@10.1.1.1");
        assert_eq!(adhoc.name, "10.1.1.1");
        assert_eq!(adhoc.user.as_deref(), Some("root"));

        let (bare, _) = config.resolve_instance("box");
        assert_eq!(bare.target(), "box");
        assert!(bare.user.is_none());
    }

    #[test]
    fn test_relay_executor_requires_token() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert!(config.executor_with(Transport::Relay, |_| None).is_err());
        assert!(
            config
                .executor_with(Transport::Relay, |_| Some("secret".to_string()))
                .is_ok()
        );
        assert!(config.executor_with(Transport::Ssh, |_| None).is_ok());
    }

    #[test]
    fn test_relay_without_section_fails() {
        let config = Config::default();
        let err = config.executor_with(Transport::Relay, |_| None).err().unwrap();
        assert!(err.to_string().contains("[relay]"));
    }

    #[test]
    fn test_load_template_json_and_toml() {
        let dir = TempDir::new().unwrap();
        let json = write(
            &dir,
            "ml.json",
            r#"{"id": "ml", "version": "1.0.0",
                "packages": {"conda": {"target": "base", "install": ["numpy>=1.26"]}},
                "services": [{"name": "jupyter", "port": 8888}]}"#,
        );
        let toml_path = write(
            &dir,
            "ml.toml",
            r#"
id = "ml"
version = "1.0.0"

[packages.conda]
target = "base"
install = ["numpy>=1.26"]

[[services]]
name = "jupyter"
port = 8888
"#,
        );

        let from_json = load_template(&json).unwrap();
        let from_toml = load_template(&toml_path).unwrap();
        assert_eq!(from_json, from_toml);
        assert_eq!(from_json.required_ports().into_iter().collect::<Vec<_>>(), vec![8888]);
    }

    #[test]
    fn test_load_template_bad_input() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "broken.json", "{");
        let err = load_template(&path).unwrap_err();
        assert!(err.to_string().contains("broken.json"));
        assert!(load_template(&dir.path().join("absent.json")).is_err());
    }
}
