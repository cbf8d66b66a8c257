use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;

use crate::channel::{ChannelDescriptor, ChannelId, Phase, ReadingBatch, ReadingSample, Role};
use crate::profile::{DeviceKind, Profile, PZEM_CHANNEL};

/// A decoded inbound message.
#[derive(Debug)]
pub enum Inbound {
    ChannelConfig(Vec<ChannelDescriptor>),
    Realtime(ReadingBatch),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelConfigMessage {
    input_channels: Vec<InputChannel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputChannel {
    ct_input: ChannelId,
    phase: u8,
    input_channel_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeMessage {
    #[serde(default)]
    voltages: Vec<PhaseVoltage>,
    #[serde(default)]
    channel_powers: Vec<ChannelPower>,
    firmware_version: Option<String>,
    serial_nr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhaseVoltage {
    phase_id: u8,
    voltage: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelPower {
    ct_input: ChannelId,
    current: f64,
    power: f64,
    import_energy: f64,
    export_energy: f64,
}

#[derive(Debug, Deserialize)]
struct PzemMessage {
    power: f64,
    energy: f64,
    current: f64,
    voltage: f64,
    frequency: Option<f64>,
}

/// Decode a message received on `topic`. `Ok(None)` for topics this profile
/// does not handle; `Err` for payloads that do not match the expected shape.
pub fn parse_message(profile: &Profile, topic: &str, payload: &[u8]) -> Result<Option<Inbound>> {
    match profile.kind {
        DeviceKind::Smappee => {
            if topic.ends_with("/channelConfig") {
                parse_channel_config(payload).map(|c| Some(Inbound::ChannelConfig(c)))
            } else if topic.ends_with("/realtime") {
                parse_realtime(payload).map(|b| Some(Inbound::Realtime(b)))
            } else {
                Ok(None)
            }
        }
        DeviceKind::Pzem => {
            if topic == "pzem" {
                parse_pzem(payload).map(|b| Some(Inbound::Realtime(b)))
            } else {
                Ok(None)
            }
        }
    }
}

fn parse_channel_config(payload: &[u8]) -> Result<Vec<ChannelDescriptor>> {
    let msg: ChannelConfigMessage =
        serde_json::from_slice(payload).context("Malformed channelConfig payload")?;

    let mut channels = Vec::with_capacity(msg.input_channels.len());
    for input in msg.input_channels {
        let role = match input.input_channel_type.as_str() {
            "CONSUMPTION" => Role::Consumption,
            "PRODUCTION" => Role::Production,
            other => {
                debug!("Ignoring CT input {} of type {}", input.ct_input, other);
                continue;
            }
        };
        let phase = Phase::try_from(input.phase)
            .with_context(|| format!("Invalid phase on CT input {}", input.ct_input))?;
        channels.push(ChannelDescriptor::new(input.ct_input, phase, role));
    }
    Ok(channels)
}

fn parse_realtime(payload: &[u8]) -> Result<ReadingBatch> {
    let msg: RealtimeMessage =
        serde_json::from_slice(payload).context("Malformed realtime payload")?;

    let mut batch = ReadingBatch {
        firmware_version: msg.firmware_version,
        serial: msg.serial_nr,
        ..Default::default()
    };
    for v in msg.voltages {
        match Phase::try_from(v.phase_id) {
            Ok(phase) => {
                batch.voltages_by_phase.insert(phase, v.voltage);
            }
            Err(_) => debug!("Ignoring voltage for unknown phase {}", v.phase_id),
        }
    }
    for p in msg.channel_powers {
        batch.readings_by_channel.insert(
            p.ct_input,
            ReadingSample {
                current: p.current,
                power: p.power,
                import_energy: p.import_energy,
                export_energy: p.export_energy,
            },
        );
    }
    Ok(batch)
}

fn parse_pzem(payload: &[u8]) -> Result<ReadingBatch> {
    let msg: PzemMessage = serde_json::from_slice(payload).context("Malformed pzem payload")?;

    let mut batch = ReadingBatch {
        frequency: msg.frequency,
        ..Default::default()
    };
    batch.voltages_by_phase.insert(Phase::L1, msg.voltage);
    batch.readings_by_channel.insert(
        PZEM_CHANNEL,
        ReadingSample {
            current: msg.current,
            power: msg.power,
            import_energy: msg.energy,
            export_energy: 0.0,
        },
    );
    Ok(batch)
}
