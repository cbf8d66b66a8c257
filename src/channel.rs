use anyhow::{bail, Result};
use std::collections::HashMap;
use std::fmt;

/// Number of electrical phases a meter can span.
pub const PHASES: usize = 3;

/// Opaque CT input identifier as reported by the monitor (`ctInput`).
pub type ChannelId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    L1 = 0,
    L2 = 1,
    L3 = 2,
}

impl Phase {
    pub const ALL: [Phase; PHASES] = [Phase::L1, Phase::L2, Phase::L3];

    pub fn index(self) -> usize {
        self as usize
    }

    /// 1-based line number used in published paths (`/Ac/L1/...`).
    pub fn line(self) -> usize {
        self.index() + 1
    }
}

impl TryFrom<u8> for Phase {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Phase::L1),
            1 => Ok(Phase::L2),
            2 => Ok(Phase::L3),
            other => bail!("Phase {} out of range (expected 0..=2)", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Consumption,
    Production,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::Consumption => "Consumption",
            Role::Production => "Production",
        }
    }

    /// Service class a meter of this role is published under.
    pub fn service_class(self) -> &'static str {
        match self {
            Role::Consumption => "grid",
            Role::Production => "pvinverter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One physical current-transformer input on the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub id: ChannelId,
    pub phase: Phase,
    pub role: Role,
}

impl ChannelDescriptor {
    pub fn new(id: ChannelId, phase: Phase, role: Role) -> Self {
        Self { id, phase, role }
    }
}

/// Channels of a single role, in their original order.
pub fn of_role(channels: &[ChannelDescriptor], role: Role) -> Vec<ChannelDescriptor> {
    channels.iter().filter(|c| c.role == role).copied().collect()
}

/// Stable partition of `channels` into one bucket per phase. Buckets for
/// phases without channels are empty, never missing.
pub fn group_by_phase(channels: &[ChannelDescriptor]) -> [Vec<ChannelDescriptor>; PHASES] {
    let mut buckets: [Vec<ChannelDescriptor>; PHASES] = Default::default();
    for channel in channels {
        buckets[channel.phase.index()].push(*channel);
    }
    buckets
}

/// Raw per-channel values as reported by the device, before scaling.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ReadingSample {
    pub current: f64,
    pub power: f64,
    pub import_energy: f64,
    pub export_energy: f64,
}

/// One realtime message, indexed for lookup by the aggregator.
#[derive(Debug, Clone, Default)]
pub struct ReadingBatch {
    pub voltages_by_phase: HashMap<Phase, f64>,
    pub readings_by_channel: HashMap<ChannelId, ReadingSample>,
    pub frequency: Option<f64>,
    pub firmware_version: Option<String>,
    pub serial: Option<String>,
}
