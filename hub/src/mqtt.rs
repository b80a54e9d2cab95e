use crate::errors::{Error, Result};
use crate::ingest::{IngestChannel, IngestUpdate};
use crate::metrics::INVALID_MESSAGES_TOTAL;
use crate::model::{Slot, TelemetrySnapshot, Topic, TopicValue};
use crate::subscription::{Delivery, Subscription};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
}

impl MqttSettings {
    fn topic(&self, topic: Topic) -> String {
        format!("{}/{}", self.topic_prefix, topic)
    }
}

/// Bridges the broker and the hub: device and camera publishes are ingested,
/// and every committed control configuration is republished retained on
/// `<prefix>/controls` for the device to pick up.
pub async fn run_mqtt(
    settings: MqttSettings,
    ingest: IngestChannel,
    mut controls: Subscription,
) -> Result<()> {
    info!(
        "Connecting to MQTT broker at {}:{}",
        settings.broker, settings.port
    );

    let mut mqtt_options =
        MqttOptions::new(settings.client_id.clone(), settings.broker.clone(), settings.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);
    // Camera frames are far larger than the 10 KiB default
    mqtt_options.set_max_packet_size(4 * 1024 * 1024, 4 * 1024 * 1024);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    for topic in [Topic::Metrics, Topic::Stream] {
        let filter = settings.topic(topic);
        client.subscribe(&filter, QoS::AtLeastOnce).await?;
        info!("Subscribed to {} with QoS 1", filter);
    }

    let controls_topic = settings.topic(Topic::Controls);

    loop {
        tokio::select! {
            notification = eventloop.poll() => {
                match notification {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        debug!(
                            "Received message on topic {}, size: {} bytes",
                            publish.topic,
                            publish.payload.len()
                        );

                        match decode_message(&settings.topic_prefix, &publish.topic, &publish.payload) {
                            Ok(update) => {
                                ingest.publish(update).await;
                            }
                            Err(e) => {
                                warn!("Discarding message on {}: {}", publish.topic, e);
                                INVALID_MESSAGES_TOTAL.inc();
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {}", e);
                        // rumqttc reconnects on the next poll
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }

            delivery = controls.next() => {
                let delivery = delivery?;
                forward_controls(&client, &controls_topic, &delivery);
            }
        }
    }
}

/// Maps a broker message to an ingest update.
pub fn decode_message(prefix: &str, topic: &str, payload: &[u8]) -> Result<IngestUpdate> {
    let suffix = topic
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .ok_or_else(|| Error::UnknownTopic(topic.to_string()))?;

    match suffix.parse::<Topic>()? {
        Topic::Metrics => {
            let snapshot = serde_json::from_slice::<TelemetrySnapshot>(payload)
                .map_err(|e| Error::InvalidPayload(format!("JSON parse error: {}", e)))?;
            Ok(IngestUpdate::Metrics(snapshot))
        }
        Topic::Stream => Ok(IngestUpdate::Stream {
            payload: payload.to_vec(),
            received_at: Utc::now(),
        }),
        Topic::Controls => Err(Error::InvalidPayload(
            "controls can only be changed through a commit".to_string(),
        )),
    }
}

fn forward_controls(client: &AsyncClient, topic: &str, delivery: &Delivery) {
    let config = match &delivery.slot {
        Slot::Ready(versioned) => match &versioned.value {
            TopicValue::Controls(config) => config,
            _ => return,
        },
        Slot::Uninitialized => return,
    };

    let payload = match serde_json::to_vec(config) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to serialize controls: {}", e);
            return;
        }
    };

    match client.try_publish(topic, QoS::AtLeastOnce, true, payload) {
        Ok(()) => info!(
            "Forwarded controls revision {} to {}",
            delivery.slot.revision(),
            topic
        ),
        Err(e) => warn!("Failed to forward controls to device: {}", e),
    }
}
