//! Instance creation and teardown helpers for the Scaleway driver.
//!
//! Scaleway instances must receive cloud-init user-data before first boot.
//! The creation request sets `stopped: true` so the payload is available when
//! the instance is powered on.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::super::{ScalewayDriver, ScalewayDriverError};
use super::InstanceSnapshot;

const MACHINE_TAG: &str = "machina";

#[derive(Serialize)]
struct CreateServerRequest {
    name: String,
    commercial_type: String,
    image: String,
    project: String,
    routed_ip_enabled: bool,
    dynamic_ip_required: bool,
    tags: Vec<String>,
    stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    cloud_init: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    organization: Option<String>,
}

#[derive(Deserialize)]
struct CreateServerResponse {
    server: scaleway_rs::ScalewayInstance,
}

impl ScalewayDriver {
    pub(in crate::scaleway) fn is_instance_type_error(
        &self,
        api_err: &scaleway_rs::ScalewayApiError,
    ) -> bool {
        matches!(api_err.resource.as_deref(), Some("commercial_type"))
            || api_err
                .resource_id
                .as_deref()
                .is_some_and(|id| id == self.instance_type)
            || (api_err.etype == "invalid_arguments"
                && api_err
                    .message
                    .to_ascii_lowercase()
                    .contains("commercial_type"))
    }

    pub(in crate::scaleway) async fn power_on_if_needed(
        &self,
        snapshot: &InstanceSnapshot,
    ) -> Result<(), ScalewayDriverError> {
        if snapshot.state.as_str() == "running" {
            return Ok(());
        }

        if snapshot
            .allowed_actions
            .iter()
            .any(|action| action.as_str() == "poweron")
        {
            self.api()
                .perform_instance_action_async(&self.zone, snapshot.id.as_str(), "poweron")
                .await?;
            return Ok(());
        }

        Err(ScalewayDriverError::PowerOnNotAllowed {
            instance_id: snapshot.id.as_str().to_owned(),
            state: snapshot.state.as_str().to_owned(),
        })
    }

    /// Creates a Scaleway instance in a stopped state.
    ///
    /// # Errors
    ///
    /// Returns [`ScalewayDriverError`] when the Scaleway API request fails or
    /// the provider rejects the requested instance type or image.
    pub(in crate::scaleway) async fn create_instance_stopped(
        &self,
        image_id: &str,
        user_data: String,
    ) -> Result<scaleway_rs::ScalewayInstance, ScalewayDriverError> {
        let url = format!("{}/zones/{}/servers", super::SCALEWAY_INSTANCE_API_BASE, self.zone);
        let payload = CreateServerRequest {
            name: self.base.machine_name.clone(),
            commercial_type: self.instance_type.clone(),
            image: image_id.to_owned(),
            project: self.project_id.clone(),
            routed_ip_enabled: true,
            dynamic_ip_required: true,
            tags: vec![String::from(MACHINE_TAG), self.base.machine_name.clone()],
            stopped: true,
            cloud_init: Some(user_data),
            organization: self.organization_id.clone(),
        };

        let provider = |err: reqwest::Error| ScalewayDriverError::Provider {
            message: err.to_string(),
        };
        let response = super::HTTP_CLIENT
            .post(&url)
            .header("X-Auth-Token", &self.secret_key)
            .json(&payload)
            .send()
            .await
            .map_err(provider)?;

        let status = response.status();
        let body = response.bytes().await.map_err(provider)?;

        if status.is_success() {
            let parsed: CreateServerResponse =
                serde_json::from_slice(&body).map_err(|err| ScalewayDriverError::Provider {
                    message: err.to_string(),
                })?;
            return Ok(parsed.server);
        }

        let message = String::from_utf8_lossy(&body).into_owned();
        if let Ok(api_err) = serde_json::from_slice::<scaleway_rs::ScalewayApiError>(&body)
            && self.is_instance_type_error(&api_err)
        {
            return Err(ScalewayDriverError::InstanceTypeUnavailable {
                instance_type: self.instance_type.clone(),
                zone: self.zone.clone(),
            });
        }

        Err(ScalewayDriverError::Provider { message })
    }

    /// Deletes the server and waits until the API no longer lists it.
    ///
    /// A running server is terminated, which also releases its volumes and
    /// IP. A server that is already gone counts as released.
    pub(in crate::scaleway) async fn release(&self) -> Result<(), ScalewayDriverError> {
        if self.server_id.is_empty() {
            return Ok(());
        }
        let Some(snapshot) = self.fetch_instance().await? else {
            info!(server = %self.server_id, "server already gone");
            return Ok(());
        };

        let api = self.api();
        if snapshot.state.as_str() == "running" {
            api.perform_instance_action_async(&self.zone, &self.server_id, "terminate")
                .await?;
        } else {
            api.delete_instance_async(&self.zone, &self.server_id).await?;
        }
        self.wait_until_gone().await
    }

    /// Runs [`Self::release`] after a failed create, describing anything
    /// left behind.
    pub(in crate::scaleway) async fn release_after_failure(&mut self) -> Option<String> {
        if self.server_id.is_empty() {
            return None;
        }
        match self.release().await {
            Ok(()) => {
                self.server_id.clear();
                None
            }
            Err(err) => {
                warn!(server = %self.server_id, error = %err, "failed to release server after create failure");
                Some(format!(
                    "server {} in zone {} may still exist: {err}",
                    self.server_id, self.zone
                ))
            }
        }
    }
}
