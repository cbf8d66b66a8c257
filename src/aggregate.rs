use log::warn;
use serde_json::{json, Value};

use crate::channel::{Phase, ReadingBatch};
use crate::meter::{Meter, SlotValues};
use crate::profile::{round_to, MeterShape, Profile};
use crate::sink::PublicationSink;

/// Apply one realtime batch to every live meter. Returns the number of
/// field writes actually sent to the sink.
pub fn apply(
    batch: &ReadingBatch,
    meters: &mut [Meter],
    profile: &Profile,
    sink: &mut dyn PublicationSink,
) -> usize {
    let mut writes = 0;
    for meter in meters.iter_mut() {
        let mut out = FieldWriter {
            meter,
            sink: &mut *sink,
            writes: 0,
        };
        match profile.shape {
            MeterShape::ThreePhase => apply_three_phase(batch, profile, &mut out),
            MeterShape::SingleAggregate => apply_single(batch, profile, &mut out),
        }
        if let Some(fw) = &batch.firmware_version {
            out.set("/FirmwareVersion", json!(fw));
        }
        if let Some(serial) = &batch.serial {
            out.set("/Serial", json!(serial));
        }
        writes += out.writes;
        out.meter.mark_live();
    }
    writes
}

/// Sink failures are logged and leave the cached value untouched, so the
/// field is retried on the next batch.
struct FieldWriter<'a> {
    meter: &'a mut Meter,
    sink: &'a mut dyn PublicationSink,
    writes: usize,
}

impl FieldWriter<'_> {
    fn set(&mut self, path: &str, value: Value) {
        match self.meter.set_field(self.sink, path, value) {
            Ok(true) => self.writes += 1,
            Ok(false) => {}
            Err(e) => warn!(
                "Failed to publish {} for instance {}: {:#}",
                path, self.meter.identity, e
            ),
        }
    }
}

/// Hand each populated slot that has a reading in this batch to
/// `per_phase`, then total over every slot's last-known values so a channel
/// skipping a tick neither drops out of the power sum nor pulls the energy
/// counters backwards.
fn accumulate(
    batch: &ReadingBatch,
    profile: &Profile,
    out: &mut FieldWriter<'_>,
    mut per_phase: impl FnMut(&mut FieldWriter<'_>, Phase, &SlotValues),
) -> SlotValues {
    let scale = &profile.scale;
    for phase in Phase::ALL {
        let Some(id) = out.meter.channel_ids[phase.index()] else {
            continue;
        };
        let Some(sample) = batch.readings_by_channel.get(&id) else {
            continue;
        };
        let slot = SlotValues {
            power: sample.power / scale.power,
            current: sample.current / scale.current,
            forward: sample.import_energy / scale.energy,
            reverse: sample.export_energy / scale.energy,
        };
        per_phase(out, phase, &slot);
        out.meter.record_slot(phase.index(), slot);
    }
    out.meter.slot_totals()
}

fn apply_three_phase(batch: &ReadingBatch, profile: &Profile, out: &mut FieldWriter<'_>) {
    let precision = profile.energy_precision;
    let voltage_scale = profile.scale.voltage;

    let totals = accumulate(batch, profile, out, |out, phase, slot| {
        let line = format!("/Ac/L{}", phase.line());
        out.set(&format!("{}/Current", line), json!(slot.current));
        out.set(
            &format!("{}/Energy/Forward", line),
            json!(round_to(slot.forward, precision)),
        );
        out.set(
            &format!("{}/Energy/Reverse", line),
            json!(round_to(slot.reverse, precision)),
        );
        out.set(&format!("{}/Power", line), json!(slot.power));
        if let Some(voltage) = batch.voltages_by_phase.get(&phase) {
            out.set(&format!("{}/Voltage", line), json!(voltage / voltage_scale));
        }
    });

    out.set("/Ac/Power", json!(totals.power));
    out.set("/Ac/Energy/Forward", json!(round_to(totals.forward, precision)));
    out.set("/Ac/Energy/Reverse", json!(round_to(totals.reverse, precision)));
}

fn apply_single(batch: &ReadingBatch, profile: &Profile, out: &mut FieldWriter<'_>) {
    let mut voltage = None;
    let totals = accumulate(batch, profile, out, |_, phase, _| {
        if voltage.is_none() {
            voltage = batch.voltages_by_phase.get(&phase).copied();
        }
    });

    // Nothing of this meter was in the batch.
    if out.meter.channels().all(|id| !batch.readings_by_channel.contains_key(&id)) {
        return;
    }

    out.set("/Ac/Power", json!(totals.power));
    out.set("/Ac/Current", json!(totals.current));
    out.set(
        "/Ac/Energy/Forward",
        json!(round_to(totals.forward, profile.energy_precision)),
    );
    if let Some(v) = voltage {
        out.set("/Ac/Voltage", json!(v / profile.scale.voltage));
    }
    if let Some(hz) = batch.frequency {
        out.set("/Ac/Frequency", json!(hz / profile.scale.frequency));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelDescriptor, ChannelId, ReadingSample, Role};
    use crate::meter::{allocate, MeterState};
    use crate::profile::DeviceKind;
    use crate::sink::testing::RecordingSink;

    fn three_phase_meter() -> Vec<Meter> {
        let channels = vec![
            ChannelDescriptor::new(1, Phase::L1, Role::Consumption),
            ChannelDescriptor::new(2, Phase::L2, Role::Consumption),
            ChannelDescriptor::new(3, Phase::L3, Role::Consumption),
        ];
        allocate("Consumption", Role::Consumption, &channels, Some(1), 50)
    }

    fn sample(power: f64) -> ReadingSample {
        ReadingSample {
            current: power / 230.0,
            power,
            import_energy: 36_000_000.0,
            export_energy: 3_600_000.0,
        }
    }

    fn batch(readings: &[(ChannelId, ReadingSample)], voltages: &[(Phase, f64)]) -> ReadingBatch {
        ReadingBatch {
            voltages_by_phase: voltages.iter().copied().collect(),
            readings_by_channel: readings.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn single_channel_scenario() {
        let mut meters = three_phase_meter();
        let profile = Profile::for_kind(DeviceKind::Smappee);
        let mut sink = RecordingSink::default();

        let b = batch(&[(1, sample(100.0))], &[(Phase::L1, 230.0)]);
        apply(&b, &mut meters, &profile, &mut sink);

        let paths = sink.paths_for(50);
        assert!(paths.iter().all(|p| !p.starts_with("/Ac/L2") && !p.starts_with("/Ac/L3")));
        assert!(paths.contains(&"/Ac/L1/Voltage"));
        assert_eq!(meters[0].field("/Ac/Power"), Some(&json!(100.0)));
        assert_eq!(meters[0].field("/Ac/L1/Energy/Forward"), Some(&json!(10.0)));
        assert_eq!(meters[0].field("/Ac/Energy/Reverse"), Some(&json!(1.0)));
        assert_eq!(meters[0].state(), MeterState::Live);
    }

    #[test]
    fn totals_sum_all_phases() {
        let mut meters = three_phase_meter();
        let profile = Profile::for_kind(DeviceKind::Smappee);
        let mut sink = RecordingSink::default();

        let b = batch(
            &[(1, sample(100.0)), (2, sample(50.5)), (3, sample(-20.0))],
            &[(Phase::L1, 230.0), (Phase::L2, 231.0), (Phase::L3, 229.0)],
        );
        apply(&b, &mut meters, &profile, &mut sink);

        assert_eq!(meters[0].field("/Ac/Power"), Some(&json!(130.5)));
        assert_eq!(meters[0].field("/Ac/Energy/Forward"), Some(&json!(30.0)));
        assert_eq!(meters[0].field("/Ac/L3/Power"), Some(&json!(-20.0)));
        assert_eq!(meters[0].field("/Ac/L2/Voltage"), Some(&json!(231.0)));
    }

    #[test]
    fn missing_reading_leaves_slot_untouched() {
        let mut meters = three_phase_meter();
        let profile = Profile::for_kind(DeviceKind::Smappee);
        let mut sink = RecordingSink::default();

        let full = batch(
            &[(1, sample(100.0)), (2, sample(200.0)), (3, sample(300.0))],
            &[(Phase::L1, 230.0), (Phase::L2, 230.0), (Phase::L3, 230.0)],
        );
        apply(&full, &mut meters, &profile, &mut sink);
        let l2_paths = ["/Ac/L2/Power", "/Ac/L2/Current", "/Ac/L2/Energy/Forward"];
        let l2_before: Vec<Option<Value>> =
            l2_paths.iter().map(|p| meters[0].field(p).cloned()).collect();
        sink.take_writes();

        let partial = batch(
            &[(1, sample(110.0)), (3, sample(310.0))],
            &[(Phase::L1, 230.0), (Phase::L2, 230.0), (Phase::L3, 230.0)],
        );
        apply(&partial, &mut meters, &profile, &mut sink);

        let l2_after: Vec<Option<Value>> =
            l2_paths.iter().map(|p| meters[0].field(p).cloned()).collect();
        assert_eq!(l2_before, l2_after);
        assert!(sink.paths_for(50).iter().all(|p| !p.starts_with("/Ac/L2")));
        assert_eq!(meters[0].field("/Ac/L1/Power"), Some(&json!(110.0)));
        // L2 keeps contributing its last-known 200 W.
        assert_eq!(meters[0].field("/Ac/Power"), Some(&json!(620.0)));
    }

    #[test]
    fn skipped_channel_keeps_totals_consistent_and_monotonic() {
        let mut meters = three_phase_meter();
        let profile = Profile::for_kind(DeviceKind::Smappee);
        let mut sink = RecordingSink::default();

        let reading = |power: f64, kwh: f64| ReadingSample {
            current: power / 230.0,
            power,
            import_energy: kwh * 3_600_000.0,
            export_energy: 0.0,
        };
        let number =
            |m: &Meter, path: &str| m.field(path).and_then(Value::as_f64).unwrap_or(0.0);
        let line_sum = |m: &Meter| {
            ["/Ac/L1/Power", "/Ac/L2/Power", "/Ac/L3/Power"]
                .iter()
                .map(|p| number(m, p))
                .sum::<f64>()
        };

        let full = batch(
            &[
                (1, reading(100.0, 10.0)),
                (2, reading(200.0, 20.0)),
                (3, reading(300.0, 30.0)),
            ],
            &[],
        );
        apply(&full, &mut meters, &profile, &mut sink);
        assert_eq!(number(&meters[0], "/Ac/Power"), 600.0);
        let forward_before = number(&meters[0], "/Ac/Energy/Forward");
        assert_eq!(forward_before, 60.0);

        let partial = batch(&[(1, reading(120.0, 10.5)), (3, reading(280.0, 30.5))], &[]);
        apply(&partial, &mut meters, &profile, &mut sink);

        let m = &meters[0];
        assert_eq!(number(m, "/Ac/L2/Power"), 200.0);
        assert_eq!(number(m, "/Ac/Power"), line_sum(m));
        assert_eq!(number(m, "/Ac/Power"), 600.0);
        let forward_after = number(m, "/Ac/Energy/Forward");
        assert!(forward_after >= forward_before);
        assert_eq!(forward_after, 61.0);
    }

    #[test]
    fn identical_batches_write_nothing_second_time() {
        let mut meters = three_phase_meter();
        let profile = Profile::for_kind(DeviceKind::Smappee);
        let mut sink = RecordingSink::default();

        let mut b = batch(
            &[(1, sample(100.0)), (2, sample(200.0)), (3, sample(300.0))],
            &[(Phase::L1, 230.0), (Phase::L2, 230.0), (Phase::L3, 230.0)],
        );
        b.firmware_version = Some("1.2.3".to_string());
        b.serial = Some("5010000123".to_string());

        let first = apply(&b, &mut meters, &profile, &mut sink);
        assert_eq!(first, sink.writes.len());
        assert!(first > 0);
        sink.take_writes();

        assert_eq!(apply(&b, &mut meters, &profile, &mut sink), 0);
        assert!(sink.writes.is_empty());
    }

    #[test]
    fn missing_voltage_is_not_written() {
        let mut meters = three_phase_meter();
        let profile = Profile::for_kind(DeviceKind::Smappee);
        let mut sink = RecordingSink::default();

        apply(&batch(&[(2, sample(10.0))], &[]), &mut meters, &profile, &mut sink);
        assert!(sink.paths_for(50).contains(&"/Ac/L2/Power"));
        assert_eq!(meters[0].field("/Ac/L2/Voltage"), None);
    }

    #[test]
    fn unknown_channels_are_ignored() {
        let mut meters = three_phase_meter();
        let profile = Profile::for_kind(DeviceKind::Smappee);
        let mut sink = RecordingSink::default();

        apply(&batch(&[(99, sample(10.0))], &[]), &mut meters, &profile, &mut sink);
        // Only zero totals, no per-line fields.
        assert!(sink.paths_for(50).iter().all(|p| !p.starts_with("/Ac/L")));
        assert_eq!(meters[0].field("/Ac/Power"), Some(&json!(0.0)));
    }

    #[test]
    fn sink_failure_does_not_stop_other_meters() {
        let mut meters = three_phase_meter();
        let profile = Profile::for_kind(DeviceKind::Smappee);
        let mut sink = RecordingSink {
            fail_writes: true,
            ..Default::default()
        };
        let b = batch(&[(1, sample(100.0))], &[(Phase::L1, 230.0)]);
        assert_eq!(apply(&b, &mut meters, &profile, &mut sink), 0);
        assert_eq!(meters[0].field("/Ac/Power"), None);

        sink.fail_writes = false;
        assert!(apply(&b, &mut meters, &profile, &mut sink) > 0);
        assert_eq!(meters[0].field("/Ac/Power"), Some(&json!(100.0)));
    }

    #[test]
    fn single_aggregate_shape() {
        let profile = Profile::for_kind(DeviceKind::Pzem);
        let channels = profile.builtin_channels().unwrap();
        let mut meters = allocate("PZEM", Role::Consumption, &channels, Some(1), 50);
        let mut sink = RecordingSink::default();

        let mut b = batch(
            &[(
                0,
                ReadingSample {
                    current: 43.0,
                    power: 9875.0,
                    import_energy: 123456.0,
                    export_energy: 0.0,
                },
            )],
            &[(Phase::L1, 2304.0)],
        );
        b.frequency = Some(500.0);
        apply(&b, &mut meters, &profile, &mut sink);

        let m = &meters[0];
        assert_eq!(m.field("/Ac/Power"), Some(&json!(987.5)));
        assert_eq!(m.field("/Ac/Current"), Some(&json!(4.3)));
        assert_eq!(m.field("/Ac/Voltage"), Some(&json!(230.4)));
        assert_eq!(m.field("/Ac/Frequency"), Some(&json!(50.0)));
        assert_eq!(m.field("/Ac/Energy/Forward"), Some(&json!(123.456)));
        assert!(sink.paths_for(50).iter().all(|p| !p.starts_with("/Ac/L")));
    }

    #[test]
    fn single_aggregate_skips_empty_batch() {
        let profile = Profile::for_kind(DeviceKind::Pzem);
        let channels = profile.builtin_channels().unwrap();
        let mut meters = allocate("PZEM", Role::Consumption, &channels, Some(1), 50);
        let mut sink = RecordingSink::default();

        assert_eq!(apply(&ReadingBatch::default(), &mut meters, &profile, &mut sink), 0);
        assert_eq!(meters[0].field("/Ac/Power"), None);
    }
}
