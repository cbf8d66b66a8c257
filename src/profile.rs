use clap::ValueEnum;

use crate::channel::{ChannelDescriptor, Phase, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceKind {
    /// Smappee multi-channel CT monitor (servicelocation/+/... topics)
    Smappee,
    /// PZEM-004T single-phase meter publishing on the `pzem` topic
    Pzem,
}

/// Which set of paths a meter is published with. Fixed per device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterShape {
    /// Per-line breakdown plus totals.
    ThreePhase,
    /// Totals only, no per-line paths.
    SingleAggregate,
}

/// Divisors turning raw device units into A, W, V, Hz and kWh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleFactors {
    pub current: f64,
    pub power: f64,
    pub voltage: f64,
    pub frequency: f64,
    pub energy: f64,
}

impl ScaleFactors {
    /// Same divisor for every instantaneous value, separate one for energy.
    pub fn uniform(value: f64, energy: f64) -> Self {
        Self {
            current: value,
            power: value,
            voltage: value,
            frequency: value,
            energy,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub kind: DeviceKind,
    pub shape: MeterShape,
    pub scale: ScaleFactors,
    /// Decimal places kept on published energy values.
    pub energy_precision: u32,
    pub product_name: &'static str,
    pub service_tag: &'static str,
}

impl Profile {
    pub fn for_kind(kind: DeviceKind) -> Self {
        match kind {
            // Energy counters are reported in joules.
            DeviceKind::Smappee => Self {
                kind,
                shape: MeterShape::ThreePhase,
                scale: ScaleFactors::uniform(1.0, 3_600_000.0),
                energy_precision: 1,
                product_name: "Smappee",
                service_tag: "smappee",
            },
            // Deci-units, energy in Wh.
            DeviceKind::Pzem => Self {
                kind,
                shape: MeterShape::SingleAggregate,
                scale: ScaleFactors::uniform(10.0, 1000.0),
                energy_precision: 3,
                product_name: "PZEM",
                service_tag: "pzem",
            },
        }
    }

    pub fn subscriptions(&self) -> &'static [&'static str] {
        match self.kind {
            DeviceKind::Smappee => &[
                "servicelocation/+/realtime",
                "servicelocation/+/channelConfig",
            ],
            DeviceKind::Pzem => &["pzem"],
        }
    }

    /// Channel layout for devices that never send a configuration message.
    pub fn builtin_channels(&self) -> Option<Vec<ChannelDescriptor>> {
        match self.kind {
            DeviceKind::Smappee => None,
            DeviceKind::Pzem => Some(vec![ChannelDescriptor::new(
                PZEM_CHANNEL,
                Phase::L1,
                Role::Consumption,
            )]),
        }
    }

    pub fn product_name_for(&self, role: Role) -> String {
        match self.kind {
            DeviceKind::Smappee => format!("{} - {}", self.product_name, role),
            DeviceKind::Pzem => self.product_name.to_string(),
        }
    }
}

/// Channel id the single PZEM reading is filed under.
pub const PZEM_CHANNEL: u32 = 0;

pub fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}
