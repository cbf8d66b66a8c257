use anyhow::{bail, Result};
use clap::Parser;

use crate::profile::{DeviceKind, Profile, ScaleFactors};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ctbridge",
    version,
    about = "Republish energy monitor CT channels as logical three-phase meters"
)]
pub struct Config {
    /// MQTT broker hostname
    #[arg(long, default_value = "127.0.0.1")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// MQTT client ID
    #[arg(long, default_value = "ctbridge")]
    pub mqtt_client_id: String,

    /// Outgoing request queue size; writes beyond it are dropped and retried
    #[arg(long, default_value_t = 512)]
    pub mqtt_capacity: usize,

    /// Topic prefix meter fields are published under
    #[arg(long, default_value = "ctbridge")]
    pub publish_prefix: String,

    /// Base service name meters are published as
    #[arg(long, default_value = "com.victronenergy")]
    pub service_base: String,

    /// Device the telemetry comes from
    #[arg(long, value_enum, default_value_t = DeviceKind::Smappee)]
    pub profile: DeviceKind,

    /// Maximum number of consumption (grid) meters
    #[arg(long, default_value_t = 1)]
    pub consumption_meters: usize,

    /// Device instance of the first consumption meter
    #[arg(long, default_value_t = 50)]
    pub consumption_instance: u32,

    /// Maximum number of production (pvinverter) meters (unbounded if omitted)
    #[arg(long)]
    pub production_meters: Option<usize>,

    /// Device instance of the first production meter
    #[arg(long, default_value_t = 51)]
    pub production_instance: u32,

    /// Divisor applied to raw energy counters to get kWh (profile default if omitted)
    #[arg(long)]
    pub energy_divisor: Option<f64>,

    /// Divisor applied to raw current, power, voltage and frequency (profile default if omitted)
    #[arg(long)]
    pub value_divisor: Option<f64>,

    /// Decimal places kept on published energy values (profile default if omitted)
    #[arg(long)]
    pub energy_precision: Option<u32>,
}

impl Config {
    /// Check settings clap cannot express on its own.
    pub fn validate(&self) -> Result<()> {
        for (name, divisor) in [
            ("energy-divisor", self.energy_divisor),
            ("value-divisor", self.value_divisor),
        ] {
            if let Some(d) = divisor {
                if !(d.is_finite() && d > 0.0) {
                    bail!("--{} must be a positive number, got {}", name, d);
                }
            }
        }

        // Highest instance of a bounded range is instance + meters - 1.
        // Unbounded production ranges are cut short by `allocate` instead.
        let ranges = [
            ("consumption", self.consumption_instance, Some(self.consumption_meters)),
            ("production", self.production_instance, self.production_meters),
        ];
        for (name, instance, meters) in ranges {
            if let Some(n) = meters {
                if instance as u64 + n as u64 > u32::MAX as u64 + 1 {
                    bail!(
                        "{} {} meter(s) from instance {} exceed the instance range",
                        n,
                        name,
                        instance
                    );
                }
            }
        }

        let consumption = self.consumption_instance as u64;
        let production = self.production_instance as u64;
        let disjoint = if consumption <= production {
            consumption + self.consumption_meters as u64 <= production
        } else {
            match self.production_meters {
                Some(n) => production + n as u64 <= consumption,
                None => false,
            }
        };
        if !disjoint {
            bail!(
                "Consumption instances from {} and production instances from {} overlap",
                self.consumption_instance,
                self.production_instance
            );
        }
        Ok(())
    }

    /// Device profile with any command line overrides applied.
    pub fn device_profile(&self) -> Profile {
        let mut profile = Profile::for_kind(self.profile);
        if let Some(value) = self.value_divisor {
            profile.scale = ScaleFactors::uniform(value, profile.scale.energy);
        }
        if let Some(energy) = self.energy_divisor {
            profile.scale.energy = energy;
        }
        if let Some(digits) = self.energy_precision {
            profile.energy_precision = digits;
        }
        profile
    }
}
