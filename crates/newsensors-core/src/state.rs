//! Reconciliation bookkeeping

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::key::DeviceKey;

/// Where a device key currently sits in the reconciliation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// Not tracked at all
    Unknown,
    /// Seen on telemetry, waiting for the next report pass
    PendingReport,
    /// Placeholder created in the registry, waiting for confirmation
    Reported,
    /// Confirmed present in the registry with no placeholder outstanding
    Registered,
}

/// The three key sets owned by the engine.
///
/// `reported` doubles as the identity map: a key is in the reported set
/// exactly when it maps to the placeholder identifier created for it.
#[derive(Debug, Default)]
pub struct ReconciliationState {
    registered: HashSet<DeviceKey>,
    pending: BTreeSet<DeviceKey>,
    reported: BTreeMap<DeviceKey, String>,
}

impl ReconciliationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a key seen on telemetry. Returns true if it was newly queued.
    pub fn observe(&mut self, key: &DeviceKey) -> bool {
        if self.registered.contains(key)
            || self.reported.contains_key(key)
            || self.pending.contains(key)
        {
            return false;
        }
        self.pending.insert(key.clone())
    }

    /// Record a key as present in the registry. Returns true if it was new.
    pub fn confirm(&mut self, key: DeviceKey) -> bool {
        self.registered.insert(key)
    }

    /// Reported keys that the registry has since confirmed, with their placeholders
    pub fn confirmed_placeholders(&self) -> Vec<(DeviceKey, String)> {
        self.reported
            .iter()
            .filter(|(key, _)| self.registered.contains(*key))
            .map(|(key, identifier)| (key.clone(), identifier.clone()))
            .collect()
    }

    /// Forget a placeholder after it was deleted from the registry
    pub fn retire(&mut self, key: &DeviceKey) -> Option<String> {
        self.reported.remove(key)
    }

    /// Drop pending keys that are already registered or reported.
    /// Returns the number of keys dropped.
    pub fn prune_pending(&mut self) -> usize {
        let before = self.pending.len();
        let registered = &self.registered;
        let reported = &self.reported;
        self.pending
            .retain(|key| !registered.contains(key) && !reported.contains_key(key));
        before - self.pending.len()
    }

    /// Pending keys in report order
    pub fn pending_keys(&self) -> Vec<DeviceKey> {
        self.pending.iter().cloned().collect()
    }

    /// Move a pending key to the reported set under its placeholder identifier
    pub fn mark_reported(&mut self, key: &DeviceKey, identifier: String) {
        self.pending.remove(key);
        self.reported.insert(key.clone(), identifier);
    }

    pub fn status(&self, key: &DeviceKey) -> KeyStatus {
        if self.reported.contains_key(key) {
            KeyStatus::Reported
        } else if self.pending.contains(key) {
            KeyStatus::PendingReport
        } else if self.registered.contains(key) {
            KeyStatus::Registered
        } else {
            KeyStatus::Unknown
        }
    }

    pub fn is_registered(&self, key: &DeviceKey) -> bool {
        self.registered.contains(key)
    }

    pub fn is_pending(&self, key: &DeviceKey) -> bool {
        self.pending.contains(key)
    }

    /// Placeholder identifier recorded for a reported key
    pub fn placeholder(&self, key: &DeviceKey) -> Option<&str> {
        self.reported.get(key).map(String::as_str)
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn reported_count(&self) -> usize {
        self.reported.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u8) -> DeviceKey {
        DeviceKey::from_sample(1, &[id])
    }

    #[test]
    fn test_observe_is_idempotent() {
        let mut state = ReconciliationState::new();
        assert!(state.observe(&key(1)));
        assert!(!state.observe(&key(1)));
        assert!(!state.observe(&key(1)));
        assert_eq!(state.pending_count(), 1);
        assert_eq!(state.status(&key(1)), KeyStatus::PendingReport);
    }

    #[test]
    fn test_observe_skips_registered_and_reported() {
        let mut state = ReconciliationState::new();
        state.confirm(key(1));
        assert!(!state.observe(&key(1)));

        state.observe(&key(2));
        state.mark_reported(&key(2), "ns.unknown-device.0102".to_string());
        assert!(!state.observe(&key(2)));
        assert_eq!(state.pending_count(), 0);
    }

    #[test]
    fn test_prune_pending() {
        let mut state = ReconciliationState::new();
        state.observe(&key(1));
        state.observe(&key(2));
        state.observe(&key(3));
        state.confirm(key(1));
        assert_eq!(state.prune_pending(), 1);
        assert_eq!(state.pending_keys(), vec![key(2), key(3)]);
    }

    #[test]
    fn test_reported_and_identity_map_move_together() {
        let mut state = ReconciliationState::new();
        state.observe(&key(7));
        state.mark_reported(&key(7), "ns.unknown-device.0107".to_string());
        assert_eq!(state.status(&key(7)), KeyStatus::Reported);
        assert_eq!(state.placeholder(&key(7)), Some("ns.unknown-device.0107"));
        assert!(!state.is_pending(&key(7)));

        assert!(state.confirmed_placeholders().is_empty());
        state.confirm(key(7));
        assert_eq!(
            state.confirmed_placeholders(),
            vec![(key(7), "ns.unknown-device.0107".to_string())]
        );

        assert_eq!(state.retire(&key(7)).as_deref(), Some("ns.unknown-device.0107"));
        assert_eq!(state.placeholder(&key(7)), None);
        assert_eq!(state.status(&key(7)), KeyStatus::Registered);
    }

    #[test]
    fn test_registered_never_shrinks() {
        let mut state = ReconciliationState::new();
        assert!(state.confirm(key(1)));
        assert!(!state.confirm(key(1)));
        state.prune_pending();
        state.retire(&key(1));
        assert!(state.is_registered(&key(1)));
        assert_eq!(state.registered_count(), 1);
    }
}
