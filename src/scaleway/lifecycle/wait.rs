//! Readiness and teardown wait helpers for the Scaleway driver.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use super::super::{ScalewayDriver, ScalewayDriverError};
use super::InstanceSnapshot;

const SSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

impl ScalewayDriver {
    pub(in crate::scaleway) async fn fetch_instance(
        &self,
    ) -> Result<Option<InstanceSnapshot>, ScalewayDriverError> {
        let mut servers = self
            .api()
            .list_instances(&self.zone)
            .servers(&self.server_id)
            .per_page(1)
            .run_async()
            .await?;

        Ok(servers.pop().map(InstanceSnapshot::from))
    }

    pub(in crate::scaleway) async fn wait_for_public_ip(
        &self,
    ) -> Result<IpAddr, ScalewayDriverError> {
        let deadline = Instant::now() + self.timing.wait_timeout;
        let mut saw_running = false;

        while Instant::now() <= deadline {
            let Some(server) = self.fetch_instance().await? else {
                sleep(self.timing.poll_interval).await;
                continue;
            };

            if server.state.as_str() != "running" {
                debug!(server = %self.server_id, state = %server.state.as_str(), "waiting for server to run");
                sleep(self.timing.poll_interval).await;
                continue;
            }

            saw_running = true;

            if let Some(address) = server
                .public_ip
                .as_ref()
                .and_then(|ip| IpAddr::from_str(ip).ok())
            {
                return Ok(address);
            }

            sleep(self.timing.poll_interval).await;
        }

        if saw_running {
            return Err(ScalewayDriverError::MissingPublicIp {
                instance_id: self.server_id.clone(),
            });
        }

        Err(ScalewayDriverError::Timeout {
            action: "wait_for_ready".to_owned(),
            instance_id: self.server_id.clone(),
        })
    }

    pub(in crate::scaleway) async fn wait_for_ssh_ready(
        &self,
        address: IpAddr,
    ) -> Result<(), ScalewayDriverError> {
        let deadline = Instant::now() + self.timing.wait_timeout;
        while Instant::now() <= deadline {
            let addr = (address, self.base.ssh_port());
            let connect = timeout(SSH_CONNECT_TIMEOUT, TcpStream::connect(addr)).await;
            if matches!(connect, Ok(Ok(_))) {
                return Ok(());
            }
            sleep(self.timing.poll_interval).await;
        }

        Err(ScalewayDriverError::Timeout {
            action: String::from("wait_for_ssh_ready"),
            instance_id: self.server_id.clone(),
        })
    }

    pub(in crate::scaleway) async fn wait_until_gone(&self) -> Result<(), ScalewayDriverError> {
        let deadline = Instant::now() + self.timing.wait_timeout;
        while Instant::now() <= deadline {
            if self.fetch_instance().await?.is_none() {
                return Ok(());
            }
            sleep(self.timing.poll_interval).await;
        }

        Err(ScalewayDriverError::ResidualResource {
            instance_id: self.server_id.clone(),
        })
    }
}
