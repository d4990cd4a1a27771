//! Instance state inspection
//!
//! Runs a fixed battery of read-only commands and parses the results into an
//! [`InstanceState`]. The five sub-inspections (packages, services, users,
//! ports, history) are independent and run concurrently on the rayon pool.
//! A failing sub-inspection becomes a warning; only a total failure is fatal.

use crate::error::{Error, Result};
use crate::history::{ApplicationRecord, HistoryStore};
use crate::managers::{MANAGER_ABSENT_EXIT, ManagerRegistry};
use crate::settings::EngineSettings;
use crate::types::{InstanceState, PackageMap, ServiceState, UserAccount, config_digest};
use chrono::Utc;
use remotekit::{ExecContext, ExecOutput, InstanceRef, RemoteExecutor, shell_quote};
use std::collections::{BTreeMap, BTreeSet};

const LIST_UNITS: &str = "systemctl list-units --type=service --all --plain --no-legend --no-pager";
const LIST_UNIT_FILES: &str = "systemctl list-unit-files --type=service --no-legend --no-pager";
const LIST_PORTS: &str = "ss -H -tlnp 2>/dev/null || netstat -tlnp 2>/dev/null";
const DROPIN_MARKER: &str = "### ";

/// Per-manager inspection targets (conda env, venv path, spack env).
pub type Targets = BTreeMap<String, Option<String>>;

/// Parsed `getent passwd` / `getent group` data.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Accounts {
    pub users: BTreeMap<String, UserAccount>,
    pub system_accounts: BTreeMap<String, u32>,
    pub system_account_groups: BTreeMap<String, BTreeSet<String>>,
    pub groups: BTreeSet<String>,
}

/// Gathers [`InstanceState`] through a [`RemoteExecutor`].
pub struct Inspector<'a> {
    executor: &'a dyn RemoteExecutor,
    registry: &'a ManagerRegistry,
    settings: &'a EngineSettings,
}

type SubResult<T> = std::result::Result<T, String>;

impl<'a> Inspector<'a> {
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        registry: &'a ManagerRegistry,
        settings: &'a EngineSettings,
    ) -> Self {
        Self {
            executor,
            registry,
            settings,
        }
    }

    /// Take a fresh snapshot of the instance.
    pub fn inspect(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        targets: &Targets,
    ) -> Result<InstanceState> {
        log::debug!("{instance}: inspecting via {}", self.executor.name());

        let mut packages = None;
        let mut services = None;
        let mut accounts = None;
        let mut ports = None;
        let mut history = None;

        rayon::scope(|s| {
            s.spawn(|_| {
                packages = Some(
                    self.inspect_packages(ctx, instance, targets)
                        .map_err(|e| format!("packages: {e}")),
                );
            });
            s.spawn(|_| {
                services = Some(
                    self.inspect_services(ctx, instance)
                        .map_err(|e| format!("services: {e}")),
                );
            });
            s.spawn(|_| {
                accounts = Some(
                    self.inspect_accounts(ctx, instance)
                        .map_err(|e| format!("users: {e}")),
                );
            });
            s.spawn(|_| {
                ports = Some(
                    self.inspect_ports(ctx, instance)
                        .map_err(|e| format!("ports: {e}")),
                );
            });
            s.spawn(|_| {
                history = Some(self.inspect_history(ctx, instance));
            });
        });

        if ctx.is_cancelled() {
            return Err(Error::Inspection {
                instance: instance.name.clone(),
                message: "cancelled".to_string(),
            });
        }

        let mut state = InstanceState {
            inspected_at: Utc::now(),
            ..Default::default()
        };
        let mut failures = Vec::new();

        match unwrap_slot(packages) {
            Ok((pkgs, warnings)) => {
                state.packages = pkgs;
                state.warnings.extend(warnings);
            }
            Err(e) => failures.push(e),
        }
        match unwrap_slot(services) {
            Ok(svcs) => state.services = svcs,
            Err(e) => failures.push(e),
        }
        match unwrap_slot(accounts) {
            Ok(acc) => {
                state.users = acc.users;
                state.system_accounts = acc.system_accounts;
                state.system_account_groups = acc.system_account_groups;
                state.groups = acc.groups;
            }
            Err(e) => failures.push(e),
        }
        match unwrap_slot(ports) {
            Ok(p) => state.ports = p,
            Err(e) => failures.push(e),
        }
        match unwrap_slot(history) {
            Ok((records, warning)) => {
                state.history = records;
                state.warnings.extend(warning);
            }
            Err(e) => failures.push(e),
        }

        if failures.len() == 5 {
            return Err(Error::Inspection {
                instance: instance.name.clone(),
                message: failures.join("; "),
            });
        }
        for failure in &failures {
            log::warn!("{instance}: {failure}");
        }
        state.warnings.extend(failures);

        log::debug!(
            "{instance}: {} packages, {} services, {} managed users, {} ports, {} history records",
            state.package_count(),
            state.services.len(),
            state.users.len(),
            state.ports.len(),
            state.history.len()
        );
        Ok(state)
    }

    /// Installed packages per registered manager.
    ///
    /// Managers missing on the instance get no entry. A manager whose list
    /// command fails, or whose call errors, is reported as a warning. The
    /// sub-inspection fails only when no manager call got through at all.
    pub fn inspect_packages(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
        targets: &Targets,
    ) -> Result<(BTreeMap<String, PackageMap>, Vec<String>)> {
        let mut packages = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut first_error = None;
        let mut answered = false;

        for manager in self.registry.iter() {
            let target = targets.get(manager.name()).and_then(Option::as_deref);
            let out = match self
                .executor
                .execute(ctx, instance, &manager.list_command(target))
            {
                Ok(out) => out,
                Err(e) => {
                    log::warn!("{instance}: listing {} failed: {e}", manager.name());
                    warnings.push(format!("{} list failed: {e}", manager.name()));
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            answered = true;
            if out.exit_code == MANAGER_ABSENT_EXIT {
                log::debug!("{instance}: {} not present", manager.name());
                continue;
            }
            if !out.success() {
                warnings.push(format!(
                    "{} list failed (exit {}): {}",
                    manager.name(),
                    out.exit_code,
                    out.stderr_tail()
                ));
                continue;
            }
            match manager.parse_installed(&out.stdout) {
                Ok(pkgs) => {
                    packages.insert(manager.name().to_string(), pkgs);
                }
                Err(e) => warnings.push(e.to_string()),
            }
        }
        if !answered && let Some(e) = first_error {
            return Err(e.into());
        }
        Ok((packages, warnings))
    }

    /// Service active/enabled state plus managed drop-in digests.
    pub fn inspect_services(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
    ) -> Result<BTreeMap<String, ServiceState>> {
        let units = checked(self.executor.execute(ctx, instance, LIST_UNITS)?, LIST_UNITS)?;
        let files = checked(
            self.executor.execute(ctx, instance, LIST_UNIT_FILES)?,
            LIST_UNIT_FILES,
        )?;
        let mut services = parse_services(&units.stdout, &files.stdout);

        let dropins = self.executor.execute(ctx, instance, &self.dropin_command())?;
        for (service, contents) in parse_dropins(&dropins.stdout) {
            services.entry(service).or_default().config_digest = Some(config_digest(&contents));
        }
        Ok(services)
    }

    fn dropin_command(&self) -> String {
        let name = shell_quote(&format!("{}.conf", self.settings.dropin_name));
        format!(
            "for f in /etc/systemd/system/*.service.d/{name}; do \
             [ -f \"$f\" ] || continue; echo \"{DROPIN_MARKER}$f\"; cat \"$f\"; echo; done"
        )
    }

    fn inspect_accounts(&self, ctx: &ExecContext, instance: &InstanceRef) -> Result<Accounts> {
        let passwd = checked(
            self.executor.execute(ctx, instance, "getent passwd")?,
            "getent passwd",
        )?;
        let group = checked(
            self.executor.execute(ctx, instance, "getent group")?,
            "getent group",
        )?;
        Ok(parse_accounts(&passwd.stdout, &group.stdout, self.settings))
    }

    fn inspect_ports(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
    ) -> Result<BTreeMap<u16, Option<String>>> {
        let out = checked(self.executor.execute(ctx, instance, LIST_PORTS)?, "ss/netstat")?;
        Ok(parse_listening(&out.stdout))
    }

    fn inspect_history(
        &self,
        ctx: &ExecContext,
        instance: &InstanceRef,
    ) -> SubResult<(Vec<ApplicationRecord>, Option<String>)> {
        HistoryStore::new(self.executor, &self.settings.history_path)
            .load(ctx, instance)
            .map_err(|e| format!("history: {e}"))
    }
}

fn unwrap_slot<T>(slot: Option<SubResult<T>>) -> SubResult<T> {
    slot.unwrap_or_else(|| Err("sub-inspection did not run".to_string()))
}

fn checked(out: ExecOutput, what: &str) -> Result<ExecOutput> {
    if out.success() {
        Ok(out)
    } else {
        Err(Error::Parse {
            what: what.to_string(),
            message: format!("exit {}: {}", out.exit_code, out.stderr_tail()),
        })
    }
}

/// Merge `list-units` and `list-unit-files` output.
pub fn parse_services(units: &str, unit_files: &str) -> BTreeMap<String, ServiceState> {
    let mut services: BTreeMap<String, ServiceState> = BTreeMap::new();

    for line in units.lines() {
        let mut fields = line.split_whitespace().skip_while(|f| *f == "●" || *f == "*");
        let (Some(unit), Some(_load), Some(active)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if let Some(name) = unit.strip_suffix(".service") {
            services.entry(name.to_string()).or_default().active = active == "active";
        }
    }

    for line in unit_files.lines() {
        let mut fields = line.split_whitespace();
        let (Some(unit), Some(state)) = (fields.next(), fields.next()) else {
            continue;
        };
        if let Some(name) = unit.strip_suffix(".service") {
            // Template units (foo@.service) are not services by themselves
            if name.ends_with('@') {
                continue;
            }
            services.entry(name.to_string()).or_default().enabled = state == "enabled";
        }
    }
    services
}

/// Split the drop-in listing into (service, contents) pairs.
pub fn parse_dropins(stdout: &str) -> Vec<(String, String)> {
    let mut found = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in stdout.lines() {
        if let Some(path) = line.strip_prefix(DROPIN_MARKER) {
            if let Some((service, lines)) = current.take() {
                found.push((service, lines.join("\n")));
            }
            current = service_of_dropin(path).map(|s| (s.to_string(), Vec::new()));
        } else if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((service, lines)) = current {
        found.push((service, lines.join("\n")));
    }
    found
}

fn service_of_dropin(path: &str) -> Option<&str> {
    path.rsplit('/').nth(1)?.strip_suffix(".service.d")
}

/// Split accounts into managed users and system accounts.
pub fn parse_accounts(passwd: &str, group: &str, settings: &EngineSettings) -> Accounts {
    let mut accounts = Accounts::default();
    let mut group_names: BTreeMap<u32, String> = BTreeMap::new();
    let mut memberships: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

    for line in group.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        let [name, _, gid, members, ..] = fields.as_slice() else {
            continue;
        };
        accounts.groups.insert((*name).to_string());
        if let Ok(gid) = gid.parse() {
            group_names.insert(gid, (*name).to_string());
        }
        for member in members.split(',').filter(|m| !m.is_empty()) {
            memberships
                .entry(member.to_string())
                .or_default()
                .insert((*name).to_string());
        }
    }

    for line in passwd.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        let [name, _, uid, gid, _, _, shell, ..] = fields.as_slice() else {
            continue;
        };
        let Ok(uid) = uid.parse::<u32>() else {
            continue;
        };
        let mut groups = memberships.remove(*name).unwrap_or_default();
        if let Some(primary) = gid.parse::<u32>().ok().and_then(|g| group_names.get(&g)) {
            groups.insert(primary.clone());
        }
        if !settings.is_managed_uid(uid) {
            accounts.system_accounts.insert((*name).to_string(), uid);
            if !groups.is_empty() {
                accounts.system_account_groups.insert((*name).to_string(), groups);
            }
            continue;
        }
        accounts.users.insert(
            (*name).to_string(),
            UserAccount {
                name: (*name).to_string(),
                uid,
                groups,
                shell: (*shell).to_string(),
            },
        );
    }
    accounts
}

/// Parse `ss -H -tlnp` or `netstat -tlnp` output into port → process.
pub fn parse_listening(stdout: &str) -> BTreeMap<u16, Option<String>> {
    let mut ports = BTreeMap::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let (local, process) = match fields.first() {
            Some(&"LISTEN") if fields.len() >= 4 => {
                (fields[3], fields.get(5).and_then(|p| ss_process(p)))
            }
            Some(proto) if proto.starts_with("tcp") && fields.len() >= 4 => {
                (fields[3], fields.get(6).and_then(|p| netstat_process(p)))
            }
            _ => continue,
        };
        let Some(port) = local.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()) else {
            continue;
        };
        let entry = ports.entry(port).or_insert(None);
        if entry.is_none() {
            *entry = process;
        }
    }
    ports
}

fn ss_process(field: &str) -> Option<String> {
    let rest = field.strip_prefix("users:((\"")?;
    rest.split('"').next().map(String::from)
}

fn netstat_process(field: &str) -> Option<String> {
    let (_, name) = field.split_once('/')?;
    (!name.is_empty()).then(|| name.to_string())
}
