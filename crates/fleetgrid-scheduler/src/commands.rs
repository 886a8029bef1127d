//! Shell command builders for remote lifecycle steps.
//!
//! Every server runs as a systemd unit named `server-<id>` whose working
//! tree lives under the servers root. Paths are always quoted.

use fleetgrid_state::SshTarget;

/// Printed by [`liveness`] when the server is up.
pub const RUNNING_MARKER: &str = "RUNNING";
/// Printed by [`liveness`] when it is not.
pub const STOPPED_MARKER: &str = "STOPPED";

/// Quote `s` for POSIX sh.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Escape a command for a double-quoted systemd `ExecStart=` argument.
fn systemd_escape(s: &str) -> String {
    s.replace('\\', r"\\")
        .replace('"', "\\\"")
        .replace('$', "$$")
        .replace('%', "%%")
}

pub fn unit_name(server_id: &str) -> String {
    format!("server-{server_id}")
}

fn unit_path(server_id: &str) -> String {
    format!("/etc/systemd/system/{}.service", unit_name(server_id))
}

pub fn server_dir(root: &str, server_id: &str) -> String {
    format!("{}/{server_id}", root.trim_end_matches('/'))
}

pub fn backup_dir(root: &str, server_id: &str) -> String {
    format!("{}/{server_id}", root.trim_end_matches('/'))
}

pub fn prepare_dir(dir: &str) -> String {
    format!("mkdir -p {}", shell_quote(dir))
}

/// Run a rendered install or update snippet inside the server directory.
pub fn in_dir(dir: &str, script: &str) -> String {
    format!("cd {} && {script}", shell_quote(dir))
}

/// Write the unit file and reload systemd. The unit is enabled, not started.
pub fn write_unit(server_id: &str, dir: &str, start: &str, stop: Option<&str>) -> String {
    let mut unit = format!(
        "[Unit]\nDescription=Game server {server_id}\nAfter=network-online.target\n\n\
         [Service]\nType=simple\nWorkingDirectory={dir}\n\
         ExecStart=/bin/sh -c \"{}\"\n",
        systemd_escape(start)
    );
    if let Some(stop) = stop {
        unit.push_str(&format!("ExecStop=/bin/sh -c \"{}\"\n", systemd_escape(stop)));
    }
    unit.push_str("Restart=on-failure\nRestartSec=10\n\n[Install]\nWantedBy=multi-user.target\n");

    format!(
        "printf '%s' {} > {} && systemctl daemon-reload && systemctl enable {}",
        shell_quote(&unit),
        unit_path(server_id),
        unit_name(server_id)
    )
}

pub fn start_unit(server_id: &str) -> String {
    format!("systemctl start {}", unit_name(server_id))
}

pub fn stop_unit(server_id: &str) -> String {
    format!("systemctl stop {}", unit_name(server_id))
}

/// Prints [`RUNNING_MARKER`] if the unit is active or the primary port is
/// listening, else [`STOPPED_MARKER`]. Always exits 0 on a reachable host.
pub fn liveness(server_id: &str, port: Option<u16>) -> String {
    let unit = format!("systemctl is-active --quiet {}", unit_name(server_id));
    let check = match port {
        Some(port) => format!(
            "{unit} || (ss -ltnuH 2>/dev/null || netstat -ltnu 2>/dev/null) | grep -qE ':{port}([^0-9]|$)'"
        ),
        None => unit,
    };
    format!("if {check}; then echo {RUNNING_MARKER}; else echo {STOPPED_MARKER}; fi")
}

/// Archive the server tree to `archive` and print its size in bytes.
pub fn backup(dir: &str, backups: &str, archive: &str) -> String {
    format!(
        "mkdir -p {b} && tar -czf {a} -C {d} . && stat -c %s {a}",
        b = shell_quote(backups),
        a = shell_quote(archive),
        d = shell_quote(dir),
    )
}

/// Stop and unregister the unit, then remove the server tree. Backups stay.
pub fn remove(server_id: &str, dir: &str) -> String {
    let unit = unit_name(server_id);
    format!(
        "systemctl stop {unit} 2>/dev/null; systemctl disable {unit} 2>/dev/null; \
         rm -f {path} && systemctl daemon-reload && rm -rf {dir}",
        path = unit_path(server_id),
        dir = shell_quote(dir),
    )
}

/// ssh invocation from one fleet host to another.
fn hop(target: &SshTarget) -> String {
    let mut cmd = format!("ssh -p {}", target.port);
    if let Some(key) = &target.key_path {
        cmd.push_str(&format!(" -i {}", shell_quote(key)));
    }
    cmd.push_str(" -o BatchMode=yes -o StrictHostKeyChecking=accept-new");
    cmd
}

/// Copy `src` (on the host this runs on) to `dst` on `target`.
///
/// Tries rsync first and falls back to streaming a tarball over ssh.
pub fn transfer(src: &str, target: &SshTarget, dst: &str) -> String {
    let hop = hop(target);
    let dest = target.destination();
    let (src_q, dst_q) = (shell_quote(src), shell_quote(dst));
    format!(
        "{hop} {dest} {mkdir} && \
         ( rsync -az --delete -e {rsh} {src_slash} {dest}:{dst_slash} || \
           ( cd {src_q} && tar czf - . | {hop} {dest} {untar} ) )",
        mkdir = shell_quote(&format!("mkdir -p {dst_q}")),
        rsh = shell_quote(&hop),
        src_slash = shell_quote(&format!("{src}/")),
        dst_slash = shell_quote(&format!("{dst}/")),
        untar = shell_quote(&format!("cd {dst_q} && tar xzf -")),
    )
}

/// Like [`transfer`] but a missing source directory is a no-op.
pub fn transfer_if_exists(src: &str, target: &SshTarget, dst: &str) -> String {
    format!(
        "if [ -d {} ]; then {}; fi",
        shell_quote(src),
        transfer(src, target, dst)
    )
}
