use async_trait::async_trait;
use log::{error, info, warn};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{BridgeEvent, Subscriber};
use crate::config::MqttOutputConfig;
use crate::utils::error::BridgeError;

pub fn availability_topic(topic_prefix: &str) -> String {
    format!("{}/bridge/state", topic_prefix)
}

fn qos_from_config(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Thin wrapper around the rumqttc client: availability announcements plus
/// serialize-and-publish. Best effort from the core's perspective; a failed
/// publish surfaces as an error the bus logs and drops.
pub struct MqttPublisher {
    client: AsyncClient,
    topic_prefix: String,
    qos: QoS,
}

impl MqttPublisher {
    /// Create the client and hand back the event loop for
    /// [`spawn_event_loop`]; connecting starts on the first poll.
    pub fn connect(config: &MqttOutputConfig) -> (Self, rumqttc::EventLoop) {
        let mut options = MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_last_will(LastWill::new(
            availability_topic(&config.topic_prefix),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, eventloop) = AsyncClient::new(options, 128);

        (
            Self {
                client,
                topic_prefix: config.topic_prefix.clone(),
                qos: qos_from_config(config.qos),
            },
            eventloop,
        )
    }

    pub fn topic_prefix(&self) -> &str {
        &self.topic_prefix
    }

    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        retain: bool,
    ) -> Result<(), BridgeError> {
        let body = serde_json::to_vec(payload)?;
        self.client
            .publish(topic, self.qos, retain, body)
            .await
            .map_err(|e| BridgeError::CommunicationError(format!("MQTT publish error: {}", e)))
    }

    pub async fn publish_raw(
        &self,
        topic: &str,
        payload: &str,
        retain: bool,
    ) -> Result<(), BridgeError> {
        self.client
            .publish(topic, self.qos, retain, payload.as_bytes().to_vec())
            .await
            .map_err(|e| BridgeError::CommunicationError(format!("MQTT publish error: {}", e)))
    }

    pub async fn announce_online(&self) -> Result<(), BridgeError> {
        self.publish_raw(&availability_topic(&self.topic_prefix), "online", true).await
    }

    pub async fn announce_offline(&self) -> Result<(), BridgeError> {
        self.publish_raw(&availability_topic(&self.topic_prefix), "offline", true).await
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("⚠️  MQTT disconnect failed: {}", e);
        }
    }
}

/// Drive the rumqttc event loop until the shutdown flag flips. Connection
/// errors back off and retry; the broker being down never fails a poll
/// cycle.
pub fn spawn_event_loop(
    mut eventloop: rumqttc::EventLoop,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("🛑 MQTT event loop stopping");
                        break;
                    }
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("📻 Connected to MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        error!("❌ MQTT connection error: {}, retrying in 5s", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    })
}

/// Topic and payload for every message an event expands to. Pure so the
/// per-field paths stay testable without a broker.
pub fn event_payloads(
    topic_prefix: &str,
    event: &BridgeEvent,
) -> Result<Vec<(String, serde_json::Value, bool)>, BridgeError> {
    let mut messages = Vec::new();

    match event {
        BridgeEvent::UnitSnapshots(snapshots) => {
            let unit = &snapshots.unit.key;
            messages.push((
                format!("{}/{}/inverter", topic_prefix, unit),
                serde_json::to_value(&snapshots.inverter)?,
                false,
            ));
            for (slot, meter) in &snapshots.meters {
                messages.push((
                    format!("{}/{}/meter/{}", topic_prefix, unit, slot),
                    serde_json::to_value(meter)?,
                    false,
                ));
            }
            for (slot, battery) in &snapshots.batteries {
                messages.push((
                    format!("{}/{}/battery/{}", topic_prefix, unit, slot),
                    serde_json::to_value(battery)?,
                    false,
                ));
            }
        }
        BridgeEvent::UnitPowerflow(flow) => {
            messages.push((
                format!("{}/powerflow/{}", topic_prefix, flow.unit.key),
                serde_json::to_value(flow.as_ref())?,
                false,
            ));
        }
        BridgeEvent::CumulatedPowerflow(flow) => {
            messages.push((
                format!("{}/powerflow", topic_prefix),
                serde_json::to_value(flow.as_ref())?,
                false,
            ));
        }
        BridgeEvent::StorageControl(control) => {
            messages.push((
                format!("{}/storage", topic_prefix),
                serde_json::to_value(control.as_ref())?,
                false,
            ));
        }
    }

    Ok(messages)
}

/// Bus subscriber forwarding every event to its MQTT topics.
pub struct MqttSender {
    publisher: std::sync::Arc<MqttPublisher>,
}

impl MqttSender {
    pub fn new(publisher: std::sync::Arc<MqttPublisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl Subscriber for MqttSender {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn handle(&self, event: BridgeEvent) -> Result<(), BridgeError> {
        for (topic, payload, retain) in event_payloads(self.publisher.topic_prefix(), &event)? {
            self.publisher.publish(&topic, &payload, retain).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::snapshots::{UnitIdentity, UnitRole};
    use crate::powerflow::{BatteryFlow, ConsumerFlow, GridFlow, InverterFlow, Powerflow};
    use chrono::Utc;
    use std::sync::Arc;

    fn flow(key: &str, role: UnitRole) -> Powerflow {
        Powerflow {
            unit: UnitIdentity { index: 0, role, key: key.to_string() },
            timestamp: Utc::now(),
            inverter: InverterFlow { pv_production: 833.0, ..Default::default() },
            grid: GridFlow::default(),
            battery: BatteryFlow::default(),
            consumer: ConsumerFlow::default(),
            suspect: false,
        }
    }

    #[test]
    fn test_unit_powerflow_topic_is_per_unit() {
        let event = BridgeEvent::UnitPowerflow(Arc::new(flow("leader", UnitRole::Leader)));
        let messages = event_payloads("solar", &event).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "solar/powerflow/leader");
        assert_eq!(messages[0].1["inverter"]["pv_production"], 833.0);
    }

    #[test]
    fn test_cumulated_powerflow_topic_is_stable() {
        let event =
            BridgeEvent::CumulatedPowerflow(Arc::new(flow("cumulated", UnitRole::Cumulated)));
        let messages = event_payloads("solar", &event).unwrap();

        assert_eq!(messages[0].0, "solar/powerflow");
    }

    #[test]
    fn test_availability_topic() {
        assert_eq!(availability_topic("solar"), "solar/bridge/state");
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_config(0), QoS::AtMostOnce);
        assert_eq!(qos_from_config(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_config(2), QoS::ExactlyOnce);
        assert_eq!(qos_from_config(9), QoS::AtLeastOnce);
    }
}
