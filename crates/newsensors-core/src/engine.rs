//! Reconciliation engine
//!
//! Consumes telemetry samples and registry snapshots, and once per interval
//! runs the removal, pruning and report passes against the registry.

use chrono::Utc;
use tracing::{debug, info, Span};

use crate::interface::{RegistryError, RegistryWriter, Sample, Snapshot};
use crate::key::{decode_registry_key, DeviceKey};
use crate::state::ReconciliationState;

/// Attribute holding the physical layer byte of a placeholder
pub const PHYSICAL_LAYER_ATTRIBUTE: &str = "physical layer";

/// Attribute holding the device id bytes of a placeholder
pub const DEVICE_ID_ATTRIBUTE: &str = "device id";

/// Marker between the namespace and the key in placeholder identifiers
pub const UNKNOWN_DEVICE_MARKER: &str = "unknown-device";

/// Outcome of one reconciliation cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Placeholders deleted because the device is now registered
    pub removed: usize,
    /// Pending keys dropped without being reported
    pub pruned: usize,
    /// Placeholders created
    pub reported: usize,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        self.removed == 0 && self.pruned == 0 && self.reported == 0
    }
}

/// Owns the reconciliation state and issues registry mutations
pub struct ReconciliationEngine {
    namespace: String,
    state: ReconciliationState,
    span: Span,
}

impl ReconciliationEngine {
    /// Create an engine whose placeholders live under `namespace`.
    /// All events are recorded inside `span`.
    pub fn new(namespace: impl Into<String>, span: Span) -> Self {
        Self {
            namespace: namespace.into(),
            state: ReconciliationState::new(),
            span,
        }
    }

    pub fn state(&self) -> &ReconciliationState {
        &self.state
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Identifier used for the placeholder of `key`
    pub fn placeholder_identifier(&self, key: &DeviceKey) -> String {
        format!("{}.{}.{}", self.namespace, UNKNOWN_DEVICE_MARKER, key)
    }

    /// Announce the attributes written onto placeholders
    pub fn declare_attributes<W: RegistryWriter>(
        &self,
        writer: &mut W,
    ) -> Result<(), RegistryError> {
        let _enter = self.span.enter();
        writer.declare_attribute(PHYSICAL_LAYER_ATTRIBUTE, false)?;
        writer.declare_attribute(DEVICE_ID_ATTRIBUTE, false)?;
        debug!("Declared placeholder attributes");
        Ok(())
    }

    /// Queue the transmitter of a telemetry sample. Returns true if it is newly pending.
    pub fn observe_sample(&mut self, sample: &Sample) -> bool {
        let key = DeviceKey::from_sample(sample.physical_layer, &sample.device_id);
        let queued = self.state.observe(&key);
        if queued {
            let _enter = self.span.enter();
            debug!(key = %key, "Unregistered device seen on telemetry");
        }
        queued
    }

    /// Learn registered devices from a snapshot. Returns the number of new keys.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> usize {
        let _enter = self.span.enter();
        let mut learned = 0;
        for (identifier, attributes) in &snapshot.identifiers {
            for attribute in attributes.iter().filter(|a| a.is_sensor()) {
                let payload = attribute.payload.as_deref();
                let Some(key) = decode_registry_key(identifier, &attribute.name, payload) else {
                    continue;
                };
                if self.state.confirm(key.clone()) {
                    debug!(key = %key, identifier = %identifier, "Device confirmed registered");
                    learned += 1;
                }
            }
        }
        learned
    }

    /// Run the removal, pruning and report passes, in that order.
    ///
    /// A registry failure aborts the cycle and is returned to the caller;
    /// state only changes for operations that were accepted.
    pub fn run_cycle<W: RegistryWriter>(
        &mut self,
        writer: &mut W,
    ) -> Result<CycleReport, RegistryError> {
        let span = self.span.clone();
        let _enter = span.enter();
        let mut report = CycleReport::default();

        for (key, identifier) in self.state.confirmed_placeholders() {
            writer.delete_identifier(&identifier)?;
            self.state.retire(&key);
            info!(
                key = %key,
                identifier = %identifier,
                "Removed placeholder for registered device"
            );
            report.removed += 1;
        }

        report.pruned = self.state.prune_pending();

        for key in self.state.pending_keys() {
            let identifier = self.placeholder_identifier(&key);
            let (physical_layer, device_id) = key.split_for_attributes();
            let now = Utc::now();

            writer.create_identifier(&identifier)?;
            writer.set_attribute(&identifier, PHYSICAL_LAYER_ATTRIBUTE, &[physical_layer], now)?;
            writer.set_attribute(&identifier, DEVICE_ID_ATTRIBUTE, device_id, now)?;

            info!(key = %key, identifier = %identifier, "Reported unregistered device");
            self.state.mark_reported(&key, identifier);
            report.reported += 1;
        }

        if report.is_empty() {
            debug!(
                registered = self.state.registered_count(),
                reported = self.state.reported_count(),
                "Reconciliation cycle had no changes"
            );
        } else {
            info!(
                removed = report.removed,
                pruned = report.pruned,
                reported = report.reported,
                registered = self.state.registered_count(),
                outstanding = self.state.reported_count(),
                "Reconciliation cycle complete"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::Attribute;
    use crate::state::KeyStatus;
    use crate::testing::{Command, RecordingWriter};

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new("host:7008", Span::none())
    }

    fn sample(physical_layer: u8, device_id: &[u8]) -> Sample {
        Sample {
            physical_layer,
            device_id: device_id.to_vec(),
        }
    }

    fn sensor_snapshot(identifier: &str, payload: Vec<u8>) -> Snapshot {
        let mut snapshot = Snapshot::new();
        snapshot.push(identifier, Attribute::new("sensor value", payload));
        snapshot
    }

    #[test]
    fn test_declare_attributes() {
        let engine = engine();
        let mut writer = RecordingWriter::default();
        engine.declare_attributes(&mut writer).unwrap();
        assert_eq!(
            writer.commands,
            vec![
                Command::Declare("physical layer".to_string(), false),
                Command::Declare("device id".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_full_lifecycle() {
        let mut engine = engine();
        let mut writer = RecordingWriter::default();
        let key: DeviceKey = "01abcd".parse().unwrap();

        assert!(engine.observe_sample(&sample(0x01, &[0xAB, 0xCD])));
        assert_eq!(engine.state().status(&key), KeyStatus::PendingReport);

        let report = engine.run_cycle(&mut writer).unwrap();
        assert_eq!(report.reported, 1);
        assert_eq!(
            writer.commands,
            vec![
                Command::Create("host:7008.unknown-device.01abcd".to_string()),
                Command::Set(
                    "host:7008.unknown-device.01abcd".to_string(),
                    "physical layer".to_string(),
                    vec![0x01]
                ),
                Command::Set(
                    "host:7008.unknown-device.01abcd".to_string(),
                    "device id".to_string(),
                    vec![0xAB, 0xCD]
                ),
            ]
        );
        assert_eq!(engine.state().status(&key), KeyStatus::Reported);
        assert_eq!(
            engine.state().placeholder(&key),
            Some("host:7008.unknown-device.01abcd")
        );

        let learned = engine.apply_snapshot(&sensor_snapshot("lab.door", vec![0x01, 0xAB, 0xCD]));
        assert_eq!(learned, 1);
        assert!(engine.state().is_registered(&key));

        writer.commands.clear();
        let report = engine.run_cycle(&mut writer).unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.reported, 0);
        assert_eq!(
            writer.commands,
            vec![Command::Delete("host:7008.unknown-device.01abcd".to_string())]
        );
        assert_eq!(engine.state().placeholder(&key), None);
        assert_eq!(engine.state().status(&key), KeyStatus::Registered);
    }

    #[test]
    fn test_duplicate_samples_report_once() {
        let mut engine = engine();
        let mut writer = RecordingWriter::default();

        for _ in 0..5 {
            engine.observe_sample(&sample(2, &[0x10, 0x20]));
        }
        assert_eq!(engine.state().pending_count(), 1);

        engine.run_cycle(&mut writer).unwrap();
        for _ in 0..5 {
            assert!(!engine.observe_sample(&sample(2, &[0x10, 0x20])));
        }
        engine.run_cycle(&mut writer).unwrap();
        engine.run_cycle(&mut writer).unwrap();

        assert_eq!(writer.creates(), vec!["host:7008.unknown-device.021020"]);
    }

    #[test]
    fn test_registered_device_never_reported() {
        let mut engine = engine();
        let mut writer = RecordingWriter::default();

        engine.apply_snapshot(&sensor_snapshot("lab.chair", vec![0x01, 0x05]));
        assert!(!engine.observe_sample(&sample(0x01, &[0x05])));

        let report = engine.run_cycle(&mut writer).unwrap();
        assert!(report.is_empty());
        assert!(writer.commands.is_empty());
    }

    #[test]
    fn test_confirmation_in_same_cycle_prunes_pending() {
        let mut engine = engine();
        let mut writer = RecordingWriter::default();

        engine.observe_sample(&sample(0x01, &[0x05]));
        engine.observe_sample(&sample(0x01, &[0x06]));
        engine.apply_snapshot(&sensor_snapshot("lab.chair", vec![0x01, 0x05]));

        let report = engine.run_cycle(&mut writer).unwrap();
        assert_eq!(
            report,
            CycleReport {
                removed: 0,
                pruned: 1,
                reported: 1
            }
        );
        assert_eq!(writer.creates(), vec!["host:7008.unknown-device.0106"]);
    }

    #[test]
    fn test_malformed_payload_skipped() {
        let mut engine = engine();
        let mut snapshot = Snapshot::new();
        snapshot.push("lab.lamp", Attribute::new("sensor value", vec![0x01]));
        snapshot.push(
            "lab.lamp",
            Attribute {
                name: "sensor value".to_string(),
                payload: None,
            },
        );
        snapshot.push("lab.lamp", Attribute::new("sensor value", vec![0x01, 0x09]));

        assert_eq!(engine.apply_snapshot(&snapshot), 1);
        assert_eq!(engine.state().registered_count(), 1);
    }

    #[test]
    fn test_non_sensor_attributes_ignored() {
        let mut engine = engine();
        let mut snapshot = Snapshot::new();
        snapshot.push("lab.lamp", Attribute::new("device id", vec![0x01, 0x09]));
        snapshot.push("lab.lamp", Attribute::new("physical layer", vec![0x01, 0x09]));

        assert_eq!(engine.apply_snapshot(&snapshot), 0);
        assert_eq!(engine.state().registered_count(), 0);
    }

    #[test]
    fn test_create_failure_keeps_key_pending() {
        let mut engine = engine();
        let mut writer = RecordingWriter::failing_after(0);

        engine.observe_sample(&sample(0x01, &[0x05]));
        let result = engine.run_cycle(&mut writer);
        assert_eq!(result, Err(RegistryError::Disconnected));
        assert!(engine.state().is_pending(&DeviceKey::from_sample(0x01, &[0x05])));
        assert_eq!(engine.state().reported_count(), 0);
    }

    #[test]
    fn test_delete_failure_keeps_placeholder() {
        let mut engine = engine();
        let mut writer = RecordingWriter::failing_after(3);
        let key = DeviceKey::from_sample(0x01, &[0x05]);

        engine.observe_sample(&sample(0x01, &[0x05]));
        engine.run_cycle(&mut writer).unwrap();
        engine.apply_snapshot(&sensor_snapshot("lab.chair", vec![0x01, 0x05]));

        assert!(engine.run_cycle(&mut writer).is_err());
        assert_eq!(engine.state().status(&key), KeyStatus::Reported);
    }
}
