//! The single latest-value telemetry record.

use serde::Serialize;

use spinbridge_types::{Metric, TelemetryPayload};

use crate::known::KnownDevice;

/// Latest power, heart rate and cadence plus a connected flag per device.
///
/// Fields owned by a device are zeroed in the same call that clears its
/// connected flag, so a publish never sees a stale value for a device that
/// has gone away.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    power: u16,
    hr: u16,
    cadence: u16,
    connected: Vec<bool>,
}

impl TelemetrySnapshot {
    /// A zeroed snapshot tracking `device_count` devices.
    pub fn new(device_count: usize) -> Self {
        Self {
            connected: vec![false; device_count],
            ..Self::default()
        }
    }

    /// Current value of a metric.
    pub fn get(&self, metric: Metric) -> u16 {
        match metric {
            Metric::Power => self.power,
            Metric::HeartRate => self.hr,
            Metric::Cadence => self.cadence,
        }
    }

    /// Store a decoded value.
    pub fn set(&mut self, metric: Metric, value: u16) {
        match metric {
            Metric::Power => self.power = value,
            Metric::HeartRate => self.hr = value,
            Metric::Cadence => self.cadence = value,
        }
    }

    /// Whether the device at `index` is marked connected.
    pub fn is_connected(&self, index: usize) -> bool {
        self.connected.get(index).copied().unwrap_or(false)
    }

    /// Mark the device at `index` connected.
    pub fn mark_connected(&mut self, index: usize) {
        if let Some(flag) = self.connected.get_mut(index) {
            *flag = true;
        }
    }

    /// Clear the connected flag and zero every metric the device owns.
    pub fn zero_device(&mut self, index: usize, device: &KnownDevice) {
        if let Some(flag) = self.connected.get_mut(index) {
            *flag = false;
        }
        for metric in device.metrics() {
            self.set(metric, 0);
        }
    }

    /// Clear all connected flags and zero every metric.
    pub fn zero_all(&mut self) {
        self.power = 0;
        self.hr = 0;
        self.cadence = 0;
        self.connected.iter_mut().for_each(|flag| *flag = false);
    }

    /// The JSON body for the metrics sink.
    pub fn to_payload(&self, elapsed: Option<u64>) -> TelemetryPayload {
        TelemetryPayload {
            power: self.power,
            hr: self.hr,
            cadence: self.cadence,
            elapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::known::default_devices;

    #[test]
    fn test_new_snapshot_is_zero() {
        let snapshot = TelemetrySnapshot::new(2);
        assert_eq!(snapshot.to_payload(None), TelemetryPayload::default());
        assert!(!snapshot.is_connected(0));
        assert!(!snapshot.is_connected(5));
    }

    #[test]
    fn test_zero_device_only_touches_owned_metrics() {
        let devices = default_devices();
        let mut snapshot = TelemetrySnapshot::new(devices.len());
        snapshot.mark_connected(0);
        snapshot.mark_connected(1);
        snapshot.set(Metric::Power, 210);
        snapshot.set(Metric::Cadence, 88);
        snapshot.set(Metric::HeartRate, 141);

        snapshot.zero_device(0, &devices[0]);

        assert_eq!(snapshot.get(Metric::Power), 0);
        assert_eq!(snapshot.get(Metric::Cadence), 0);
        assert_eq!(snapshot.get(Metric::HeartRate), 141);
        assert!(!snapshot.is_connected(0));
        assert!(snapshot.is_connected(1));
    }

    #[test]
    fn test_zero_all() {
        let mut snapshot = TelemetrySnapshot::new(2);
        snapshot.mark_connected(1);
        snapshot.set(Metric::HeartRate, 90);
        snapshot.zero_all();
        assert_eq!(snapshot, TelemetrySnapshot::new(2));
    }

    #[test]
    fn test_payload_carries_elapsed() {
        let mut snapshot = TelemetrySnapshot::new(0);
        snapshot.set(Metric::Power, 150);
        let payload = snapshot.to_payload(Some(30));
        assert_eq!(payload.power, 150);
        assert_eq!(payload.elapsed, Some(30));
    }
}
