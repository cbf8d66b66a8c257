use anyhow::Result;
use log::warn;
use serde_json::Value;
use std::collections::HashMap;

use crate::channel::{group_by_phase, ChannelDescriptor, ChannelId, Role, PHASES};
use crate::sink::PublicationSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterState {
    /// Created from a configuration snapshot, nothing aggregated yet.
    Allocated,
    /// Has received at least one realtime batch.
    Live,
}

/// Scaled values of one phase slot from the last batch that carried it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SlotValues {
    pub power: f64,
    pub current: f64,
    pub forward: f64,
    pub reverse: f64,
}

impl SlotValues {
    fn add(&mut self, other: &SlotValues) {
        self.power += other.power;
        self.current += other.current;
        self.forward += other.forward;
        self.reverse += other.reverse;
    }
}

/// A logical metering point built from up to one channel per phase.
#[derive(Debug, Clone)]
pub struct Meter {
    pub identity: u32,
    pub role: Role,
    pub name: String,
    /// Slot index is the phase index; `None` where the pairing had no channel.
    pub channel_ids: [Option<ChannelId>; PHASES],
    fields: HashMap<String, Value>,
    last_slot: [Option<SlotValues>; PHASES],
    state: MeterState,
}

impl Meter {
    fn new(
        identity: u32,
        role: Role,
        name: &str,
        channel_ids: [Option<ChannelId>; PHASES],
    ) -> Self {
        Self {
            identity,
            role,
            name: name.to_string(),
            channel_ids,
            fields: HashMap::new(),
            last_slot: [None; PHASES],
            state: MeterState::Allocated,
        }
    }

    pub fn state(&self) -> MeterState {
        self.state
    }

    pub(crate) fn mark_live(&mut self) {
        self.state = MeterState::Live;
    }

    /// Remember the values a slot reported in the current batch.
    pub(crate) fn record_slot(&mut self, slot: usize, values: SlotValues) {
        self.last_slot[slot] = Some(values);
    }

    /// Sum over every slot's last-known values. Slots that never reported
    /// contribute nothing.
    pub fn slot_totals(&self) -> SlotValues {
        let mut totals = SlotValues::default();
        for values in self.last_slot.iter().flatten() {
            totals.add(values);
        }
        totals
    }

    /// Send every cached field to the sink again, e.g. after the broker
    /// lost its retained messages. Fields the sink rejects drop out of the
    /// cache so the next batch retries them. Returns the number resent.
    pub fn republish(&mut self, sink: &mut dyn PublicationSink) -> usize {
        let mut resent = 0;
        for (path, value) in std::mem::take(&mut self.fields) {
            match self.set_field(sink, &path, value) {
                Ok(_) => resent += 1,
                Err(e) => warn!(
                    "Failed to republish {} for instance {}: {:#}",
                    path, self.identity, e
                ),
            }
        }
        resent
    }

    /// Last value successfully published for `path`.
    pub fn field(&self, path: &str) -> Option<&Value> {
        self.fields.get(path)
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channel_ids.iter().flatten().copied()
    }

    /// Comma separated channel ids, for `/Debug/Cts`.
    pub fn channel_list(&self) -> String {
        self.channels()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Publish `value` on `path` unless it equals the last published value.
    /// Returns whether a write was sent. The cached value only moves when
    /// the sink accepts the write.
    pub fn set_field(
        &mut self,
        sink: &mut dyn PublicationSink,
        path: &str,
        value: Value,
    ) -> Result<bool> {
        if self.fields.get(path) == Some(&value) {
            return Ok(false);
        }
        sink.set_field(self.identity, path, &value)?;
        self.fields.insert(path.to_string(), value);
        Ok(true)
    }
}

/// Pair channels of one role across phases into meters.
///
/// The k-th channel discovered on each phase is taken to belong to meter k.
/// Phases with fewer channels leave that slot empty. At most `max_count`
/// meters are produced, numbered `k + instance_offset`; allocation stops
/// early rather than let a number run past `u32::MAX`.
pub fn allocate(
    name: &str,
    role: Role,
    channels: &[ChannelDescriptor],
    max_count: Option<usize>,
    instance_offset: u32,
) -> Vec<Meter> {
    let buckets = group_by_phase(channels);
    let longest = buckets.iter().map(Vec::len).max().unwrap_or(0);

    let mut meters = Vec::new();
    for k in 0..longest {
        if max_count.is_some_and(|n| meters.len() >= n) {
            break;
        }

        let Some(identity) = u32::try_from(k)
            .ok()
            .and_then(|k| instance_offset.checked_add(k))
        else {
            warn!(
                "{} meter {} would exceed the instance range from {}, not allocated",
                name, k, instance_offset
            );
            break;
        };

        let mut slots = [None; PHASES];
        for (slot, bucket) in slots.iter_mut().zip(buckets.iter()) {
            if k < bucket.len() {
                *slot = Some(bucket[k].id);
            }
        }

        meters.push(Meter::new(identity, role, name, slots));
    }
    meters
}
