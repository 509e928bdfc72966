//! Message bus client for provisioning and deprovisioning requests.
//!
//! [`MessageBus::publish`] returns `bool`, not a `Result`: callers must
//! check the return value and treat `false` as "could not even start
//! provisioning". Messages go out at QoS 1 (at-least-once) and the
//! client waits for the broker's acknowledgment under a bounded timeout
//! before disconnecting.
//!
//! Transport selection is an explicit configuration choice between the
//! direct MQTT connection and a degraded CLI mode that shells out to the
//! broker's own publish tool. There is no automatic probing.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::process::Command;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{BusTransport, Config};
use crate::error::{ProvisionError, Result};
use crate::models::ProvisioningPayload;

// ---

/// Username/password-authenticated client for the provisioning topic.
#[derive(Debug, Clone)]
pub struct MessageBus {
    transport: BusTransport,
    host: String,
    port: u16,
    username: String,
    password: String,
    pub_command: String,
    ack_timeout: Duration,
}

impl MessageBus {
    pub fn from_config(cfg: &Config) -> Self {
        // ---
        Self {
            transport: cfg.bus_transport,
            host: cfg.mqtt_host.clone(),
            port: cfg.mqtt_port,
            username: cfg.mqtt_user.clone(),
            password: cfg.mqtt_password.clone(),
            pub_command: cfg.mqtt_pub_command.clone(),
            ack_timeout: Duration::from_secs(cfg.publish_timeout_secs as u64),
        }
    }

    /// Publish a provisioning payload.
    ///
    /// Returns `false` on any failure (serialization, connection,
    /// rejection, ack timeout); the failure itself is logged here.
    pub async fn publish(&self, topic: &str, payload: &ProvisioningPayload) -> bool {
        // ---
        let body = match serde_json::to_string(payload) {
            Ok(body) => body,
            Err(e) => {
                error!(topic, error = %e, "failed to serialize provisioning payload");
                return false;
            }
        };

        match self.publish_raw(topic, &body).await {
            Ok(()) => {
                info!(topic, uuid = %payload.uuid, "published provisioning message");
                true
            }
            Err(e) => {
                error!(topic, uuid = %payload.uuid, error = %e, "publish failed");
                false
            }
        }
    }

    /// Best-effort deprovisioning notification for a deleted thing.
    ///
    /// Returns whether the notification was delivered. Failures are
    /// logged here and never abort anything: by the time this is sent
    /// the local deletion has already happened.
    pub async fn publish_deprovision(&self, topic: &str, uuid: Uuid) -> bool {
        // ---
        let body = serde_json::json!({ "uuid": uuid, "action": "delete" }).to_string();
        match self.publish_raw(topic, &body).await {
            Ok(()) => {
                debug!(topic, %uuid, "published deprovision notification");
                true
            }
            Err(e) => {
                error!(topic, %uuid, error = %e, "deprovision notification failed");
                false
            }
        }
    }

    async fn publish_raw(&self, topic: &str, body: &str) -> Result<()> {
        match self.transport {
            BusTransport::Mqtt => self.publish_mqtt(topic, body).await,
            BusTransport::Cli => self.publish_cli(topic, body).await,
        }
    }

    /// Direct protocol path: connect, publish at QoS 1, wait for the
    /// broker's PubAck, disconnect.
    async fn publish_mqtt(&self, topic: &str, body: &str) -> Result<()> {
        // ---
        let client_id = format!("provisioner-{}", Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, self.host.as_str(), self.port);
        options.set_credentials(self.username.clone(), self.password.clone());
        options.set_keep_alive(Duration::from_secs(5));

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        client
            .publish(topic, QoS::AtLeastOnce, false, body.as_bytes())
            .await
            .map_err(|e| ProvisionError::Publish(format!("enqueue failed: {e}")))?;

        // Drive the event loop until the broker acknowledges the publish.
        let wait_for_ack = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::PubAck(_))) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) => {
                        return Err(ProvisionError::Publish(format!("connection failed: {e}")))
                    }
                }
            }
        };

        let acked = tokio::time::timeout(self.ack_timeout, wait_for_ack)
            .await
            .map_err(|_| {
                ProvisionError::Publish(format!(
                    "no broker acknowledgment within {:?}",
                    self.ack_timeout
                ))
            })?;

        // Disconnect regardless of ack outcome; connection is per-publish.
        let _ = client.disconnect().await;
        acked
    }

    /// Degraded mode: invoke the broker's publish tool locally.
    async fn publish_cli(&self, topic: &str, body: &str) -> Result<()> {
        // ---
        let port = self.port.to_string();
        let status = Command::new(&self.pub_command)
            .args([
                "-h",
                self.host.as_str(),
                "-p",
                port.as_str(),
                "-u",
                self.username.as_str(),
                "-P",
                self.password.as_str(),
                "-q",
                "1",
                "-t",
                topic,
                "-m",
                body,
            ])
            .status()
            .await
            .map_err(|e| {
                ProvisionError::Publish(format!("failed to spawn {}: {e}", self.pub_command))
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(ProvisionError::Publish(format!(
                "{} exited with {status}",
                self.pub_command
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn cli_bus(command: &str) -> MessageBus {
        MessageBus {
            transport: BusTransport::Cli,
            host: "localhost".into(),
            port: 1883,
            username: "bus".into(),
            password: "secret".into(),
            pub_command: command.into(),
            ack_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn cli_transport_reports_missing_binary_as_publish_error() {
        let bus = cli_bus("definitely-not-a-real-publish-tool");
        let err = bus.publish_raw("frontend_thing_update", "{}").await;
        assert!(matches!(err, Err(ProvisionError::Publish(_))));
    }

    #[tokio::test]
    async fn cli_transport_succeeds_when_tool_exits_zero() {
        // `true` ignores its arguments and exits 0, standing in for the
        // broker's publish tool.
        let bus = cli_bus("true");
        assert!(bus.publish_raw("frontend_thing_update", "{}").await.is_ok());
    }

    #[tokio::test]
    async fn cli_transport_fails_on_nonzero_exit() {
        let bus = cli_bus("false");
        let err = bus.publish_raw("frontend_thing_update", "{}").await;
        assert!(matches!(err, Err(ProvisionError::Publish(_))));
    }

    #[tokio::test]
    async fn deprovision_reports_delivery_without_erroring() {
        // ---
        let uuid = Uuid::new_v4();
        assert!(cli_bus("true").publish_deprovision("frontend_thing_update", uuid).await);
        assert!(!cli_bus("false").publish_deprovision("frontend_thing_update", uuid).await);
    }
}
