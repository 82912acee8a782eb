//! Systemd drop-in rendering for the container runtime.

use crate::options::{AuthOptions, EngineOptions};

/// Inputs of one unit rendering.
#[derive(Clone, Copy, Debug)]
pub struct UnitContext<'a> {
    /// Runtime configuration.
    pub engine: &'a EngineOptions,
    /// Remote certificate locations.
    pub auth: &'a AuthOptions,
    /// Driver name, recorded as the `provider` label.
    pub driver_name: &'a str,
    /// Storage driver already decided by the provisioner.
    pub storage_driver: &'a str,
    /// Disables `pivot_root` for hosts whose root is `rootfs`.
    pub no_pivot: bool,
}

/// Escapes `%` so systemd does not expand specifiers, and wraps the value in
/// double quotes so whitespace survives.
#[must_use]
pub fn escape_environment(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('%', "%%");
    format!("\"{escaped}\"")
}

fn daemon_command(context: &UnitContext<'_>) -> String {
    let engine = context.engine;
    let auth = context.auth;
    let mut parts = vec![
        String::from("/usr/bin/dockerd"),
        format!("-H tcp://0.0.0.0:{}", engine.tls_port),
        String::from("-H unix:///var/run/docker.sock"),
        String::from("--default-ulimit=nofile=1048576:1048576"),
    ];
    if engine.tls_verify {
        parts.push(String::from("--tlsverify"));
    }
    parts.push(format!("--tlscacert {}", auth.ca_cert_remote_path));
    parts.push(format!("--tlscert {}", auth.server_cert_remote_path));
    parts.push(format!("--tlskey {}", auth.server_key_remote_path));
    let provider = format!("provider={}", context.driver_name);
    parts.extend(
        engine
            .labels
            .iter()
            .filter(|label| **label != provider)
            .chain(std::iter::once(&provider))
            .map(|label| format!("--label {label}")),
    );
    parts.extend(
        engine
            .insecure_registry
            .iter()
            .map(|registry| format!("--insecure-registry {registry}")),
    );
    parts.extend(
        engine
            .registry_mirror
            .iter()
            .map(|mirror| format!("--registry-mirror {mirror}")),
    );
    if !context.storage_driver.is_empty() {
        parts.push(format!("--storage-driver {}", context.storage_driver));
    }
    parts.extend(
        engine
            .arbitrary_flags
            .iter()
            .map(|flag| format!("--{}", flag.trim_start_matches('-'))),
    );
    parts.join(" ").replace('%', "%%")
}

/// Renders the drop-in unit.
#[must_use]
pub fn render(context: &UnitContext<'_>) -> String {
    let mut unit = String::from("[Service]\nType=notify\nRestart=on-failure\n");
    if context.no_pivot {
        unit.push_str("Environment=DOCKER_RAMDISK=yes\n");
    }
    for entry in &context.engine.env {
        unit.push_str("Environment=");
        unit.push_str(&escape_environment(entry));
        unit.push('\n');
    }
    unit.push_str("\nExecStart=\nExecStart=");
    unit.push_str(&daemon_command(context));
    unit.push('\n');
    unit.push_str(
        "ExecReload=/bin/kill -s HUP $MAINPID\n\
         LimitNOFILE=infinity\n\
         LimitNPROC=infinity\n\
         LimitCORE=infinity\n\
         TasksMax=infinity\n\
         TimeoutStartSec=0\n\
         Delegate=yes\n\
         KillMode=process\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
    );
    unit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::CertPaths;
    use camino::Utf8Path;
    use rstest::rstest;

    fn auth() -> AuthOptions {
        AuthOptions::for_machine(
            &CertPaths::in_dir(Utf8Path::new("/certs")),
            Utf8Path::new("/machines/m1"),
        )
    }

    #[rstest]
    #[case("FOO=bar", "\"FOO=bar\"")]
    #[case("GREETING=hello world", "\"GREETING=hello world\"")]
    #[case("PROMPT=%i %h", "\"PROMPT=%%i %%h\"")]
    #[case("QUOTE=say \"hi\"", "\"QUOTE=say \\\"hi\\\"\"")]
    fn environment_values_are_escaped(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(escape_environment(raw), expected);
    }

    #[test]
    fn unit_carries_tls_labels_and_storage() {
        let engine = EngineOptions {
            labels: vec![String::from("env=test")],
            insecure_registry: vec![String::from("registry.local:5000")],
            registry_mirror: vec![String::from("https://mirror.example")],
            arbitrary_flags: vec![String::from("debug")],
            env: vec![String::from("HTTP_PROXY=http://proxy:3128")],
            ..EngineOptions::default()
        };
        let auth = auth();
        let unit = render(&UnitContext {
            engine: &engine,
            auth: &auth,
            driver_name: "generic",
            storage_driver: "overlay2",
            no_pivot: false,
        });

        assert!(unit.starts_with("[Service]\n"));
        assert!(unit.contains("\nExecStart=\nExecStart=/usr/bin/dockerd -H tcp://0.0.0.0:2376 -H unix:///var/run/docker.sock"));
        assert!(unit.contains("--tlsverify --tlscacert /etc/docker/ca.pem --tlscert /etc/docker/server.pem --tlskey /etc/docker/server-key.pem"));
        assert!(unit.contains("--label env=test --label provider=generic"));
        assert!(unit.contains("--insecure-registry registry.local:5000"));
        assert!(unit.contains("--registry-mirror https://mirror.example"));
        assert!(unit.contains("--storage-driver overlay2"));
        assert!(unit.contains(" --debug\n"));
        assert!(unit.contains("Environment=\"HTTP_PROXY=http://proxy:3128\"\n"));
        for limit in [
            "LimitNOFILE=infinity",
            "TasksMax=infinity",
            "Delegate=yes",
            "KillMode=process",
        ] {
            assert!(unit.contains(limit), "missing {limit}");
        }
        assert!(!unit.contains("DOCKER_RAMDISK"));
    }

    #[test]
    fn rootfs_hosts_disable_pivot_root() {
        let engine = EngineOptions::default();
        let auth = auth();
        let unit = render(&UnitContext {
            engine: &engine,
            auth: &auth,
            driver_name: "none",
            storage_driver: "",
            no_pivot: true,
        });
        assert!(unit.contains("Environment=DOCKER_RAMDISK=yes\n"));
        assert!(!unit.contains("--storage-driver"));
    }

    #[test]
    fn rendering_is_stable_and_does_not_duplicate_the_provider_label() {
        let engine = EngineOptions {
            labels: vec![String::from("provider=generic")],
            ..EngineOptions::default()
        };
        let auth = auth();
        let context = UnitContext {
            engine: &engine,
            auth: &auth,
            driver_name: "generic",
            storage_driver: "overlay2",
            no_pivot: false,
        };
        let first = render(&context);
        assert_eq!(first, render(&context));
        assert_eq!(first.matches("provider=generic").count(), 1);
    }
}
