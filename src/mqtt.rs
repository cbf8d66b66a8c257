use anyhow::{Context, Result};
use log::{debug, error, info};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use std::time::Duration;

use crate::bridge::Bridge;
use crate::config::Config;
use crate::sink::MqttSink;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connect to the broker and feed every received message to the bridge.
/// Messages are handled one at a time in arrival order; this only returns
/// if subscribing fails.
pub fn run(config: &Config) -> Result<()> {
    let mut opts = MqttOptions::new(&config.mqtt_client_id, &config.mqtt_host, config.mqtt_port);
    opts.set_keep_alive(Duration::from_secs(60));

    let (client, mut connection) = Client::new(opts, config.mqtt_capacity);
    let sink = MqttSink::new(client.clone(), &config.publish_prefix);
    let mut bridge = Bridge::new(config.clone(), sink);
    let topics = bridge.profile().subscriptions();

    info!(
        "Connecting to {}:{} as {}",
        config.mqtt_host, config.mqtt_port, config.mqtt_client_id
    );

    let mut connected_before = false;

    // rumqttc reconnects on the next poll after an error
    for event in connection.iter() {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                for topic in topics {
                    client
                        .try_subscribe(*topic, QoS::AtMostOnce)
                        .with_context(|| format!("Failed to subscribe to {}", topic))?;
                    info!("Subscribed to {}", topic);
                }
                // The broker may have restarted without its retained store.
                if connected_before {
                    bridge.republish();
                }
                connected_before = true;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("Received {} bytes on {}", publish.payload.len(), publish.topic);
                bridge.handle(&publish.topic, &publish.payload);
            }
            Ok(_) => continue,
            Err(e) => {
                error!("MQTT connection error: {}", e);
                std::thread::sleep(RECONNECT_DELAY);
            }
        }
    }

    Ok(())
}
