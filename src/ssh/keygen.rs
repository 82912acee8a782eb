//! SSH key pair generation through `ssh-keygen`.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use super::SshError;
use crate::command::CommandRunner;

const KEYGEN_BIN: &str = "ssh-keygen";

/// Returns the public key path paired with `private_key`.
#[must_use]
pub fn public_key_path(private_key: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{private_key}.pub"))
}

/// Generates an RSA key pair at `private_key` unless one already exists.
///
/// # Errors
///
/// Returns [`SshError::KeyGeneration`] when the directory cannot be created
/// or `ssh-keygen` fails.
pub async fn generate_key_pair<R: CommandRunner>(
    runner: &R,
    private_key: &Utf8Path,
) -> Result<(), SshError> {
    let failure = |message: String| SshError::KeyGeneration {
        path: private_key.to_path_buf(),
        message,
    };

    if tokio::fs::try_exists(private_key)
        .await
        .map_err(|err| failure(err.to_string()))?
    {
        debug!(path = %private_key, "reusing existing SSH key");
        return Ok(());
    }

    if let Some(parent) = private_key.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| failure(err.to_string()))?;
    }

    let args = [
        OsString::from("-q"),
        OsString::from("-t"),
        OsString::from("rsa"),
        OsString::from("-b"),
        OsString::from("2048"),
        OsString::from("-N"),
        OsString::from(""),
        OsString::from("-C"),
        OsString::from("machina"),
        OsString::from("-f"),
        OsString::from(private_key.as_str()),
    ];
    let output = runner.run(KEYGEN_BIN, &args).await?;
    if output.is_success() {
        return Ok(());
    }
    Err(failure(format!(
        "ssh-keygen exited with {}: {}",
        output.status_text(),
        output.stderr.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use tempfile::TempDir;

    fn key_in(dir: &TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join("machines/m1/id_rsa"))
            .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()))
    }

    #[tokio::test]
    async fn invokes_ssh_keygen_for_new_keys() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let key = key_in(&tmp);
        let runner = ScriptedRunner::new();
        runner.push_success();

        generate_key_pair(&runner, &key)
            .await
            .unwrap_or_else(|err| panic!("keygen: {err}"));

        let invocations = runner.invocations();
        let rendered = invocations
            .first()
            .map(crate::test_support::CommandInvocation::command_string)
            .unwrap_or_default();
        assert!(rendered.starts_with("ssh-keygen -q -t rsa -b 2048"), "{rendered}");
        assert!(rendered.ends_with(&format!("-f {key}")), "{rendered}");
        assert_eq!(public_key_path(&key), Utf8PathBuf::from(format!("{key}.pub")));
    }

    #[tokio::test]
    async fn existing_keys_are_reused() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let key = key_in(&tmp);
        std::fs::create_dir_all(key.parent().unwrap_or(&key))
            .unwrap_or_else(|err| panic!("mkdir: {err}"));
        std::fs::write(&key, "private").unwrap_or_else(|err| panic!("write key: {err}"));
        let runner = ScriptedRunner::new();

        generate_key_pair(&runner, &key)
            .await
            .unwrap_or_else(|err| panic!("keygen: {err}"));

        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn keygen_failures_are_reported() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let key = key_in(&tmp);
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "bad key type");

        let Err(err) = generate_key_pair(&runner, &key).await else {
            panic!("keygen failure should surface");
        };
        assert!(matches!(err, SshError::KeyGeneration { .. }), "{err}");
    }
}
