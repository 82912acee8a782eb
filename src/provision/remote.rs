//! Shell snippets run on the machine being provisioned.
//!
//! Every snippet is idempotent: running it twice leaves the host as running
//! it once would.

use camino::Utf8Path;
use shell_escape::unix::escape;

/// Outcome of placing a file on the remote host.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Placement {
    /// The installed file already had the same content.
    Unchanged,
    /// The file was created or replaced.
    Changed,
}

impl Placement {
    /// Reads the marker echoed by [`place_file`].
    #[must_use]
    pub fn from_output(stdout: &str) -> Self {
        if stdout.contains("unchanged") {
            Self::Unchanged
        } else {
            Self::Changed
        }
    }
}

fn quote(value: &str) -> String {
    escape(value.into()).into_owned()
}

/// Stages `contents` next to `path`, then moves it into place only when it
/// differs from the installed file. Echoes `changed` or `unchanged`.
#[must_use]
pub fn place_file(path: &str, contents: &str, mode: &str) -> String {
    let parent = Utf8Path::new(path)
        .parent()
        .map_or_else(|| String::from("/"), |dir| dir.as_str().to_owned());
    let target = quote(path);
    let staged = quote(&format!("{path}.new"));
    format!(
        "sudo mkdir -p {dir} && printf '%s' {body} | sudo tee {staged} >/dev/null && \
         sudo chmod {mode} {staged} && \
         if sudo cmp -s {target} {staged}; then sudo rm -f {staged}; echo unchanged; \
         else sudo mv -f {staged} {target}; echo changed; fi",
        dir = quote(&parent),
        body = quote(contents),
    )
}

/// Sets the hostname and keeps the `127.0.1.1` line of `/etc/hosts` in step.
#[must_use]
pub fn set_hostname(name: &str) -> String {
    let host = quote(name);
    let entry = quote(&format!("127.0.1.1 {name}"));
    let sed = quote(&format!("s/^127.0.1.1.*/127.0.1.1 {name}/"));
    format!(
        "sudo hostname {host} && echo {host} | sudo tee /etc/hostname >/dev/null && \
         if grep -q '^127.0.1.1' /etc/hosts; then sudo sed -i {sed} /etc/hosts; \
         else echo {entry} | sudo tee -a /etc/hosts >/dev/null; fi"
    )
}

/// Installs the runtime through `install_url` unless it is already present.
#[must_use]
pub fn install_runtime(install_url: &str) -> String {
    format!(
        "command -v docker >/dev/null 2>&1 || curl -fsSL {} | sudo sh",
        quote(install_url)
    )
}

/// Reinstalls the runtime through `install_url` and restarts it.
#[must_use]
pub fn upgrade_runtime(install_url: &str) -> String {
    format!(
        "curl -fsSL {} | sudo sh && {RESTART_RUNTIME}",
        quote(install_url)
    )
}

/// Reloads units and restarts the runtime.
pub const RESTART_RUNTIME: &str =
    "sudo systemctl daemon-reload && sudo systemctl enable docker && sudo systemctl restart docker";

/// Trivial command proving the SSH session works.
pub const PING: &str = "exit 0";

/// Prints the OS identification file.
pub const OS_RELEASE: &str = "cat /etc/os-release";

/// Prints the filesystem type backing `/var/lib`.
pub const VAR_LIB_FILESYSTEM: &str = "stat -f -c %T /var/lib";

/// Prints the filesystem type of `/`.
pub const ROOT_FILESYSTEM: &str = "df --output=fstype / | tail -n 1";

/// Lists listening TCP sockets.
pub const LISTENING_SOCKETS: &str = "ss -tln 2>/dev/null || netstat -tln";

/// Prints the runtime server version.
pub const RUNTIME_VERSION: &str = "sudo docker version --format '{{.Server.Version}}'";

/// Text the package managers print while another process holds their lock.
pub const LOCK_BUSY: &str = "Could not get lock";

/// Installs the prerequisites through `apt-get`.
pub const APT_INSTALL: &str = "sudo -E DEBIAN_FRONTEND=noninteractive apt-get update -qq && \
     sudo -E DEBIAN_FRONTEND=noninteractive apt-get install -y -qq curl ca-certificates";

/// Installs the prerequisites through `yum`.
pub const YUM_INSTALL: &str = "sudo -E yum install -y curl";
