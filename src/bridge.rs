use anyhow::Result;
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::aggregate;
use crate::channel::{of_role, ChannelDescriptor, ReadingBatch, Role};
use crate::config::Config;
use crate::meter::{allocate, Meter};
use crate::profile::Profile;
use crate::protocol::{parse_message, Inbound};
use crate::sink::PublicationSink;

const PRODUCT_ID: u32 = 0xFFFF;

/// Owns the live meter set of one device and feeds it to a sink.
pub struct Bridge<S: PublicationSink> {
    config: Config,
    profile: Profile,
    sink: S,
    meters: Vec<Meter>,
}

impl<S: PublicationSink> Bridge<S> {
    pub fn new(config: Config, sink: S) -> Self {
        let profile = config.device_profile();
        let mut bridge = Self {
            config,
            profile,
            sink,
            meters: Vec::new(),
        };
        if let Some(channels) = bridge.profile.builtin_channels() {
            bridge.configure(&channels);
        }
        bridge
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn meters(&self) -> &[Meter] {
        &self.meters
    }

    #[cfg(test)]
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Handle one inbound message. Errors never escape: a bad payload is
    /// logged and leaves the live meter set as it was.
    pub fn handle(&mut self, topic: &str, payload: &[u8]) {
        match parse_message(&self.profile, topic, payload) {
            Ok(Some(Inbound::ChannelConfig(channels))) => self.configure(&channels),
            Ok(Some(Inbound::Realtime(batch))) => self.update(&batch),
            Ok(None) => debug!("Ignoring message on {}", topic),
            Err(e) => warn!("Dropping message on {}: {:#}", topic, e),
        }
    }

    /// Replace the whole meter set from a channel configuration snapshot.
    pub fn configure(&mut self, channels: &[ChannelDescriptor]) {
        let mut next = allocate(
            Role::Consumption.label(),
            Role::Consumption,
            &of_role(channels, Role::Consumption),
            Some(self.config.consumption_meters),
            self.config.consumption_instance,
        );
        next.extend(allocate(
            Role::Production.label(),
            Role::Production,
            &of_role(channels, Role::Production),
            self.config.production_meters,
            self.config.production_instance,
        ));

        for old in std::mem::take(&mut self.meters) {
            if let Err(e) = self.sink.release(old.identity) {
                warn!("Failed to release instance {}: {:#}", old.identity, e);
            }
        }

        for meter in next.iter_mut() {
            if let Err(e) = self.announce(meter) {
                warn!("Failed to register instance {}: {:#}", meter.identity, e);
            }
        }

        info!(
            "Allocated {} meter(s) from {} channel(s): {}",
            next.len(),
            channels.len(),
            next.iter()
                .map(|m| format!("{}#{}[{}]", m.name, m.identity, m.channel_list()))
                .collect::<Vec<_>>()
                .join(" ")
        );
        self.meters = next;
    }

    /// Apply a realtime batch. Without a configuration there is nothing to update.
    pub fn update(&mut self, batch: &ReadingBatch) {
        if self.meters.is_empty() {
            debug!("No meters configured yet, ignoring realtime data");
            return;
        }
        let writes = aggregate::apply(batch, &mut self.meters, &self.profile, &mut self.sink);
        debug!("Realtime update: {} field(s) changed", writes);
    }

    /// Push every cached field of every meter again. Used after a reconnect,
    /// when the broker may have lost the retained values.
    pub fn republish(&mut self) {
        let resent: usize = self
            .meters
            .iter_mut()
            .map(|meter| meter.republish(&mut self.sink))
            .sum();
        info!("Republished {} field(s) for {} meter(s)", resent, self.meters.len());
    }

    pub fn service_name(&self, meter: &Meter) -> String {
        format!(
            "{}.{}.{}_{:02}",
            self.config.service_base,
            meter.role.service_class(),
            self.profile.service_tag,
            meter.identity
        )
    }

    fn announce(&mut self, meter: &mut Meter) -> Result<()> {
        let service = self.service_name(meter);
        self.sink.register(meter.identity, &service)?;

        let fields: [(&str, Value); 10] = [
            ("/Management/ProcessName", json!(env!("CARGO_PKG_NAME"))),
            ("/Management/ProcessVersion", json!(env!("CARGO_PKG_VERSION"))),
            ("/Management/Connection", json!(self.config.mqtt_host)),
            ("/DeviceInstance", json!(meter.identity)),
            ("/ProductId", json!(PRODUCT_ID)),
            ("/ProductName", json!(self.profile.product_name_for(meter.role))),
            ("/FirmwareVersion", Value::Null),
            ("/Serial", Value::Null),
            ("/Connected", json!(1)),
            ("/Debug/Cts", json!(meter.channel_list())),
        ];
        for (path, value) in fields {
            meter.set_field(&mut self.sink, path, value)?;
        }
        Ok(())
    }
}
