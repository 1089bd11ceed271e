use std::{
    cmp::Ordering,
    collections::HashMap,
    time::{Duration, Instant},
};
use tracing::debug;

use crate::{
    adapter::Advertisement,
    types::{DeviceClass, DeviceRole, DiscoveredPeripheral, Selector},
    FTMS_SERVICE_UUID, HEART_RATE_SERVICE_UUID,
};

/// Peripherals seen by the radio, keyed by identifier
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: HashMap<String, DiscoveredPeripheral>,
    staleness_window: Duration,
}

impl DeviceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(staleness_window: Duration) -> Self {
        Self {
            devices: HashMap::new(),
            staleness_window,
        }
    }

    /// Drop every entry that is not connected
    pub fn begin_scan(&mut self) {
        self.devices.retain(|_, device| device.connected);
    }

    /// Insert or refresh a peripheral from an advertisement
    pub fn on_advertisement(&mut self, adv: Advertisement, now: Instant) -> &DiscoveredPeripheral {
        let class = classify(&adv.services);
        let device = self
            .devices
            .entry(adv.id.clone())
            .or_insert_with(|| DiscoveredPeripheral {
                id: adv.id.clone(),
                name: None,
                services: Vec::new(),
                rssi: None,
                connectable: adv.connectable,
                class,
                connected: false,
                last_seen: now,
            });

        if adv.name.is_some() {
            device.name = adv.name;
        }
        if adv.rssi.is_some() {
            device.rssi = adv.rssi;
        }
        if !adv.services.is_empty() {
            device.services = adv.services;
            device.class = class;
        }
        device.connectable = adv.connectable;
        device.last_seen = now;
        device
    }

    /// Flag a peripheral as bound or unbound
    pub fn set_connected(&mut self, id: &str, connected: bool) {
        if let Some(device) = self.devices.get_mut(id) {
            device.connected = connected;
        }
    }

    /// Look up a peripheral
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&DiscoveredPeripheral> {
        self.devices.get(id)
    }

    /// Best-ranked peripheral matching `selector` for `role`
    #[must_use]
    pub fn find(&self, selector: &Selector, role: DeviceRole) -> Option<&DiscoveredPeripheral> {
        self.devices
            .values()
            .filter(|device| selector.matches(device, role))
            .min_by(|a, b| compare(a, b))
    }

    /// Remove stale, unconnected entries
    pub fn prune(&mut self, now: Instant) {
        let window = self.staleness_window;
        self.devices.retain(|id, device| {
            let keep = device.connected || now.saturating_duration_since(device.last_seen) <= window;
            if !keep {
                debug!("Pruning stale peripheral {id}");
            }
            keep
        });
    }

    /// Prune, then return the sorted device list
    pub fn snapshot(&mut self, now: Instant) -> Vec<DiscoveredPeripheral> {
        self.prune(now);
        let mut devices: Vec<_> = self.devices.values().cloned().collect();
        devices.sort_by(compare);
        devices
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Number of tracked peripherals
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether nothing is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// First matching advertised service wins: control, then heart rate
#[must_use]
pub fn classify(services: &[uuid::Uuid]) -> DeviceClass {
    if services.contains(&FTMS_SERVICE_UUID) {
        DeviceClass::ControlDevice
    } else if services.contains(&HEART_RATE_SERVICE_UUID) {
        DeviceClass::HeartRate
    } else {
        DeviceClass::Unknown
    }
}

/// Connected first, then by class, then by case-insensitive label
fn compare(a: &DiscoveredPeripheral, b: &DiscoveredPeripheral) -> Ordering {
    b.connected
        .cmp(&a.connected)
        .then(a.class.cmp(&b.class))
        .then_with(|| a.label().to_lowercase().cmp(&b.label().to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adv(id: &str, name: &str, services: Vec<uuid::Uuid>) -> Advertisement {
        Advertisement {
            id: id.to_string(),
            name: Some(name.to_string()),
            services,
            rssi: Some(-55),
            connectable: true,
        }
    }

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Duration::from_secs(15))
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify(&[FTMS_SERVICE_UUID]), DeviceClass::ControlDevice);
        assert_eq!(
            classify(&[HEART_RATE_SERVICE_UUID, FTMS_SERVICE_UUID]),
            DeviceClass::ControlDevice
        );
        assert_eq!(classify(&[HEART_RATE_SERVICE_UUID]), DeviceClass::HeartRate);
        assert_eq!(classify(&[]), DeviceClass::Unknown);
    }

    #[test]
    fn test_upsert_keeps_class_when_services_omitted() {
        let mut registry = registry();
        let now = Instant::now();
        registry.on_advertisement(adv("AA", "KICKR", vec![FTMS_SERVICE_UUID]), now);

        let mut update = adv("AA", "KICKR", Vec::new());
        update.name = None;
        update.rssi = Some(-70);
        let device = registry.on_advertisement(update, now + Duration::from_secs(1));

        assert_eq!(device.class, DeviceClass::ControlDevice);
        assert_eq!(device.name.as_deref(), Some("KICKR"));
        assert_eq!(device.rssi, Some(-70));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_sort_order() {
        let mut registry = registry();
        let now = Instant::now();
        registry.on_advertisement(adv("1", "zwift hub", vec![FTMS_SERVICE_UUID]), now);
        registry.on_advertisement(adv("2", "Apple Watch", vec![]), now);
        registry.on_advertisement(adv("3", "HRM-Dual", vec![HEART_RATE_SERVICE_UUID]), now);
        registry.on_advertisement(adv("4", "KICKR", vec![FTMS_SERVICE_UUID]), now);
        registry.on_advertisement(adv("5", "Tickr", vec![HEART_RATE_SERVICE_UUID]), now);
        registry.set_connected("5", true);

        let ids: Vec<_> = registry
            .snapshot(now)
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["5", "4", "1", "3", "2"]);
    }

    #[test]
    fn test_stale_entries_are_pruned_unless_connected() {
        let mut registry = registry();
        let start = Instant::now();
        registry.on_advertisement(adv("old", "Old Trainer", vec![FTMS_SERVICE_UUID]), start);
        registry.on_advertisement(adv("bound", "Bound Trainer", vec![FTMS_SERVICE_UUID]), start);
        registry.set_connected("bound", true);

        let later = start + Duration::from_secs(16);
        let ids: Vec<_> = registry
            .snapshot(later)
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["bound"]);

        // within the window nothing is dropped
        registry.on_advertisement(adv("fresh", "Fresh", vec![]), later);
        assert_eq!(registry.snapshot(later + Duration::from_secs(15)).len(), 2);
    }

    #[test]
    fn test_begin_scan_keeps_connected_entries() {
        let mut registry = registry();
        let now = Instant::now();
        registry.on_advertisement(adv("a", "A", vec![]), now);
        registry.on_advertisement(adv("b", "B", vec![HEART_RATE_SERVICE_UUID]), now);
        registry.set_connected("b", true);

        registry.begin_scan();
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
    }

    #[test]
    fn test_find_prefers_best_ranked() {
        let mut registry = registry();
        let now = Instant::now();
        registry.on_advertisement(adv("x", "Wahoo KICKR", vec![FTMS_SERVICE_UUID]), now);
        registry.on_advertisement(adv("y", "Elite Suito", vec![FTMS_SERVICE_UUID]), now);
        registry.on_advertisement(adv("z", "Polar H10", vec![HEART_RATE_SERVICE_UUID]), now);

        let best = registry.find(&Selector::Any, DeviceRole::Control).unwrap();
        assert_eq!(best.id, "y");
        let named = registry
            .find(&Selector::Name("kickr".to_string()), DeviceRole::Control)
            .unwrap();
        assert_eq!(named.id, "x");
        assert!(registry
            .find(&Selector::Name("kickr".to_string()), DeviceRole::HeartRate)
            .is_none());
        assert!(registry.find(&Selector::Id("missing".to_string()), DeviceRole::Control).is_none());
    }
}
