use crate::errors::{Error, Result};
use crate::ingest::report_drop;
use crate::metrics::MESSAGES_TOTAL;
use crate::workers::Dispatcher;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub topic: String,
}

/// Consumes the telemetry topic until the task is cancelled.
///
/// Delivery is at-most-once: nothing is acknowledged back or redelivered,
/// and a message that fails at any stage is logged and dropped.
pub async fn run_mqtt(settings: MqttSettings, dispatcher: Dispatcher) -> Result<()> {
    info!(
        "Connecting to MQTT broker at {}:{}",
        settings.broker, settings.port
    );

    let mut mqtt_options = MqttOptions::new(settings.client_id, settings.broker, settings.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client
        .subscribe(settings.topic.as_str(), QoS::AtMostOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 0", settings.topic);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                MESSAGES_TOTAL.inc();

                debug!(
                    "Received message on topic {}, size: {} bytes",
                    publish.topic,
                    publish.payload.len()
                );

                if let Err(e) = dispatcher.dispatch(&publish.payload).await {
                    report_drop(&e);
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // A clean session loses subscriptions on reconnect
                if let Err(e) = client
                    .subscribe(settings.topic.as_str(), QoS::AtMostOnce)
                    .await
                {
                    error!("Failed to resubscribe to {}: {}", settings.topic, e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll, so we just log and continue
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
