//! Cloud-init user-data for new Scaleway instances.
//!
//! The payload is sent in the creation request of a stopped server and is
//! consumed by cloud-init on the first boot, installing the machine key for
//! the SSH user before the driver starts polling the port.

/// Renders a `#cloud-config` document authorising `public_key` for `user`.
pub(crate) fn authorized_key_user_data(user: &str, public_key: &str) -> String {
    let key = public_key.trim();
    if user == "root" {
        return format!("#cloud-config\ndisable_root: false\nssh_authorized_keys:\n  - {key}\n");
    }
    format!(
        "#cloud-config\nusers:\n  - default\n  - name: {user}\n    sudo: ALL=(ALL) NOPASSWD:ALL\n    shell: /bin/bash\n    ssh_authorized_keys:\n      - {key}\n"
    )
}
