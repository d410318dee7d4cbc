use std::collections::{BTreeMap, HashMap};

use crate::config::Config;
use crate::device::DeviceHandle;

/// One slice of an incoming universe, destined for a contiguous region of
/// one device's pixel buffer. A device may own several fragments and a
/// universe may feed fragments on several devices.
pub struct UniverseFragment {
    pub device: DeviceHandle,
    pub address_mask: u16,
    pub start_channel: usize,
    pub dest_index: usize,
    pub pixel_count: usize,
}

/// address_mask → fragments, looked up once per incoming ArtDmx packet.
pub struct DispatchTable {
    fragments: HashMap<u16, Vec<UniverseFragment>>,
}

impl DispatchTable {
    /// Build the table from a validated config and the device set created
    /// from it. Devices without fragments simply never receive data.
    pub fn build(config: &Config, devices: &BTreeMap<String, DeviceHandle>) -> Self {
        let mut fragments: HashMap<u16, Vec<UniverseFragment>> = HashMap::new();
        for (key, device_cfg) in &config.devices {
            let Some(device) = devices.get(key) else { continue };
            for frag in device_cfg.data.values() {
                let mask = frag.address_mask();
                fragments.entry(mask).or_default().push(UniverseFragment {
                    device: device.clone(),
                    address_mask: mask,
                    start_channel: frag.start_channel as usize,
                    dest_index: frag.dest_index,
                    pixel_count: frag.pixel_count as usize,
                });
            }
        }
        Self { fragments }
    }

    /// Fan one universe payload out to every fragment listening on it.
    /// Runs synchronously on the receiver task; absorption is index-only
    /// and never copies the payload.
    pub fn dispatch(&self, address: u16, payload: &[u8]) {
        if let Some(list) = self.fragments.get(&address) {
            for frag in list {
                frag.device
                    .absorb(payload, frag.start_channel, frag.dest_index, frag.pixel_count);
            }
        }
    }

    pub fn universe_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceShared;
    use crate::pixel::pack_rgb;
    use std::net::Ipv4Addr;

    fn table_from_json(json: &str) -> (DispatchTable, BTreeMap<String, DeviceHandle>) {
        let config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        let mut devices = BTreeMap::new();
        for (key, cfg) in &config.devices {
            devices.insert(
                key.clone(),
                DeviceShared::new(
                    cfg.name.clone(),
                    cfg.ip.parse::<Ipv4Addr>().unwrap(),
                    cfg.pixel_count,
                    config.effective_fps(cfg),
                ),
            );
        }
        (DispatchTable::build(&config, &devices), devices)
    }

    #[test]
    fn fan_out_to_multiple_devices_and_fragments() {
        let (table, devices) = table_from_json(
            r#"{
                "devices": {
                    "d1": {"ip": "10.0.0.1", "pixelCount": 6, "data": {
                        "a": {"universe": 1, "startChannel": 0, "destIndex": 0, "pixelCount": 3},
                        "b": {"universe": 1, "startChannel": 9, "destIndex": 3, "pixelCount": 3}
                    }},
                    "d2": {"ip": "10.0.0.2", "pixelCount": 3, "data": {
                        "a": {"universe": 1, "startChannel": 0, "destIndex": 0, "pixelCount": 3}
                    }}
                }
            }"#,
        );
        assert_eq!(table.universe_count(), 1);
        assert_eq!(table.fragment_count(), 3);

        let mut payload = vec![0u8; 36];
        payload[0..9].copy_from_slice(&[0xff, 0x00, 0x00, 0x00, 0xff, 0x00, 0x00, 0x00, 0xff]);
        payload[27..36].copy_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99]);
        table.dispatch(0x0001, &payload);

        let d1 = devices["d1"].pixels_snapshot();
        assert_eq!(d1[0], pack_rgb(0xff, 0x00, 0x00));
        assert_eq!(d1[1], pack_rgb(0x00, 0xff, 0x00));
        assert_eq!(d1[2], pack_rgb(0x00, 0x00, 0xff));
        assert_eq!(d1[3], pack_rgb(0x11, 0x22, 0x33));
        assert_eq!(d1[4], pack_rgb(0x44, 0x55, 0x66));
        assert_eq!(d1[5], pack_rgb(0x77, 0x88, 0x99));

        let d2 = devices["d2"].pixels_snapshot();
        assert_eq!(&d2[..], &d1[..3]);
    }

    #[test]
    fn unmatched_universe_is_ignored() {
        let (table, devices) = table_from_json(
            r#"{
                "devices": {
                    "d1": {"ip": "10.0.0.1", "pixelCount": 3, "data": {
                        "a": {"universe": 1, "pixelCount": 3}
                    }}
                }
            }"#,
        );
        table.dispatch(0x0002, &[0xff; 9]);
        assert!(devices["d1"].pixels_snapshot().iter().all(|&v| v == 0.0));
        let (packets_in, _, _) = devices["d1"].counters();
        assert_eq!(packets_in, 0);
    }
}
