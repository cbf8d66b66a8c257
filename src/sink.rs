use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use rumqttc::{Client, QoS};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};

/// Destination for meter field values.
pub trait PublicationSink {
    /// Make a meter addressable under `service` before any field is set.
    fn register(&mut self, identity: u32, service: &str) -> Result<()>;

    fn set_field(&mut self, identity: u32, path: &str, value: &Value) -> Result<()>;

    /// Withdraw everything published for a meter.
    fn release(&mut self, identity: u32) -> Result<()>;
}

struct Registration {
    service: String,
    paths: BTreeSet<String>,
}

/// Publishes each field as a retained `{"value": ...}` message on
/// `{prefix}/{service}{path}`.
pub struct MqttSink {
    client: Client,
    prefix: String,
    services: HashMap<u32, Registration>,
}

impl MqttSink {
    pub fn new(client: Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.trim_end_matches('/').to_string(),
            services: HashMap::new(),
        }
    }

    fn topic(&self, service: &str, path: &str) -> String {
        format!("{}/{}{}", self.prefix, service, path)
    }
}

impl PublicationSink for MqttSink {
    fn register(&mut self, identity: u32, service: &str) -> Result<()> {
        debug!("Registering {} as instance {}", service, identity);
        self.services.insert(
            identity,
            Registration {
                service: service.to_string(),
                paths: BTreeSet::new(),
            },
        );
        Ok(())
    }

    fn set_field(&mut self, identity: u32, path: &str, value: &Value) -> Result<()> {
        let registration = self
            .services
            .get(&identity)
            .ok_or_else(|| anyhow!("Instance {} is not registered", identity))?;
        let topic = self.topic(&registration.service, path);
        let payload = serde_json::to_vec(&json!({ "value": value }))
            .context("Failed to serialize field value")?;

        // try_publish: blocking here would stall the connection loop that drains the queue
        self.client
            .try_publish(topic.as_str(), QoS::AtMostOnce, true, payload)
            .with_context(|| format!("Failed to queue MQTT publish to {}", topic))?;

        if let Some(registration) = self.services.get_mut(&identity) {
            registration.paths.insert(path.to_string());
        }
        Ok(())
    }

    fn release(&mut self, identity: u32) -> Result<()> {
        let Some(registration) = self.services.get(&identity) else {
            return Ok(());
        };
        debug!("Releasing {}", registration.service);
        // An empty retained payload deletes the retained message on the broker.
        let mut failed = 0;
        for path in &registration.paths {
            let topic = self.topic(&registration.service, path);
            if let Err(e) = self
                .client
                .try_publish(topic.as_str(), QoS::AtMostOnce, true, Vec::new())
            {
                warn!("Failed to clear retained {}: {}", topic, e);
                failed += 1;
            }
        }
        let total = registration.paths.len();
        self.services.remove(&identity);
        if failed > 0 {
            bail!("{} of {} retained topic(s) left on the broker", failed, total);
        }
        Ok(())
    }
}
