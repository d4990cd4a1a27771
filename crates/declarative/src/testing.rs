//! Fixtures shared by the engine tests.

use crate::template::{DesiredTemplate, PackageSet, ServiceSpec, UserSpec};
use remotekit::{ExecOutput, InstanceRef, ScriptedExecutor};
use std::collections::BTreeMap;

pub(crate) fn instance() -> InstanceRef {
    InstanceRef::new("lab-1")
}

/// conda numpy/pandas/scipy, a jupyter service on 8888, and one research user.
pub(crate) fn template() -> DesiredTemplate {
    let mut packages = BTreeMap::new();
    packages.insert(
        "conda".to_string(),
        PackageSet {
            target: None,
            install: vec!["numpy".into(), "pandas".into(), "scipy".into()],
            remove: vec![],
        },
    );
    DesiredTemplate {
        id: "ml-research".into(),
        version: "1.2.0".into(),
        packages,
        services: vec![ServiceSpec {
            name: "jupyter".into(),
            port: Some(8888),
            config: vec!["[Service]".into(), "Environment=JUPYTER_PORT=8888".into()],
            enable: true,
        }],
        users: vec![UserSpec {
            name: "researcher".into(),
            uid: None,
            groups: vec!["research".into()],
            shell: None,
        }],
        ports: vec![],
    }
}

/// Standard `getent passwd` output for a fresh Ubuntu box.
pub(crate) const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
ubuntu:x:1000:1000:Ubuntu:/home/ubuntu:/bin/bash
nobody:x:65534:65534:nobody:/nonexistent:/usr/sbin/nologin
";

pub(crate) const GROUP: &str = "\
root:x:0:
sudo:x:27:ubuntu
ubuntu:x:1000:
";

/// Executor answering the read-only inspection battery for a box that has
/// conda (empty), no jupyter, no research user, and only sshd listening.
/// `/etc/passwd` and `/etc/group` exist on its filesystem.
pub(crate) fn fresh_instance() -> ScriptedExecutor {
    let exec = ScriptedExecutor::new();
    exec.on_command_output("dpkg-query", ExecOutput::failed(127, ""))
        .on_command_output("rpm -qa", ExecOutput::failed(127, ""))
        .on_command_output("pip list", ExecOutput::failed(127, ""))
        .on_command_output("spack", ExecOutput::failed(127, ""))
        .on_command("conda list --json", "[]")
        .on_command(
            "list-units",
            "ssh.service loaded active running OpenBSD Secure Shell server\n",
        )
        .on_command("list-unit-files", "ssh.service enabled enabled\n")
        .on_command("getent passwd", PASSWD)
        .on_command("getent group", GROUP)
        .on_command(
            "ss -H -tlnp",
            "LISTEN 0 128 0.0.0.0:22 0.0.0.0:* users:((\"sshd\",pid=812,fd=3))\n",
        )
        .put_remote_file("/etc/passwd", PASSWD)
        .put_remote_file("/etc/group", GROUP);
    exec
}
