//! In-process SSH client built on `russh`.

use std::sync::Arc;

use russh::ChannelMsg;
use russh::client::{self, Handle};
use russh_keys::key;
use tokio::io::AsyncWriteExt;

use super::{ExternalSshClient, SshClient, SshError, SshFuture, SshTarget};
use crate::command::CommandOutput;

struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// SSH client speaking the protocol in-process.
#[derive(Clone, Debug)]
pub struct NativeSshClient {
    target: SshTarget,
}

impl NativeSshClient {
    /// Creates a client for `target`.
    #[must_use]
    pub const fn new(target: SshTarget) -> Self {
        Self { target }
    }

    fn connect_error(&self, message: impl ToString) -> SshError {
        SshError::Connect {
            host: self.target.host.clone(),
            message: message.to_string(),
        }
    }

    async fn session(&self) -> Result<Handle<AcceptAnyHostKey>, SshError> {
        let config = Arc::new(client::Config::default());
        let addr = (self.target.host.as_str(), self.target.port);
        let mut handle = client::connect(config, addr, AcceptAnyHostKey)
            .await
            .map_err(|err| self.connect_error(err))?;

        let Some(key_path) = &self.target.key_path else {
            return Err(self.connect_error("no private key configured"));
        };
        let key_pair =
            russh_keys::load_secret_key(key_path, None).map_err(|err| self.connect_error(err))?;
        let authenticated = handle
            .authenticate_publickey(self.target.user.as_str(), Arc::new(key_pair))
            .await
            .map_err(|err| self.connect_error(err))?;
        if !authenticated {
            return Err(self.connect_error("public key authentication rejected"));
        }
        Ok(handle)
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, SshError> {
        let handle = self.session().await?;
        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|err| self.connect_error(err))?;
        channel
            .exec(true, command)
            .await
            .map_err(|err| self.connect_error(err))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut code = None;
        while let Some(message) = channel.wait().await {
            match message {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => {
                    code = i32::try_from(exit_status).ok();
                }
                _ => {}
            }
        }

        Ok(CommandOutput {
            code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

impl SshClient for NativeSshClient {
    fn output<'a>(&'a self, command: &'a str) -> SshFuture<'a, CommandOutput> {
        Box::pin(async move { self.exec(command).await })
    }

    fn shell<'a>(&'a self, args: &'a [String]) -> SshFuture<'a, Option<i32>> {
        Box::pin(async move {
            if args.is_empty() {
                // Interactive terminals need a local PTY; reuse the system client.
                return ExternalSshClient::new(self.target.clone()).shell(args).await;
            }
            let output = self.exec(&args.join(" ")).await?;
            let mut stdout = tokio::io::stdout();
            let mut stderr = tokio::io::stderr();
            stdout.write_all(output.stdout.as_bytes()).await.ok();
            stderr.write_all(output.stderr.as_bytes()).await.ok();
            Ok(output.code)
        })
    }
}
