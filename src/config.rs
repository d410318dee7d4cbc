use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::artnet::{ArtnetAddress, ARTNET_PORT};

/// Upper bound on pixels per DMX universe: 512 channels / 3 channels per pixel.
pub const MAX_PIXELS_PER_UNIVERSE: u16 = 170;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemConfig {
    pub ip_artnet: String, // e.g., "0.0.0.0"
    pub port_artnet: u16,  // usually 6454
    // web UI address, passed through to the UI collaborator untouched
    pub ip_web_interface: String,
    pub port_web_interface: u16,
    pub max_fps: u32,
    pub pixels_per_universe: u16,
    pub status_update_interval_ms: u64,
    pub drop_out_of_sequence: bool,
    pub discovery: bool,
    pub time_sync: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            ip_artnet: "0.0.0.0".into(),
            port_artnet: ARTNET_PORT,
            ip_web_interface: "127.0.0.1".into(),
            port_web_interface: 8081,
            max_fps: 30,
            pixels_per_universe: MAX_PIXELS_PER_UNIVERSE,
            status_update_interval_ms: 3000,
            drop_out_of_sequence: false,
            discovery: false,
            time_sync: false,
        }
    }
}

fn default_device_fps() -> u32 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    #[serde(default)]
    pub name: String,
    pub ip: String,
    #[serde(default)]
    pub pixel_count: usize,
    #[serde(default = "default_device_fps")]
    pub max_fps: u32,
    #[serde(default)]
    pub data: BTreeMap<String, FragmentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FragmentConfig {
    pub net: u8,
    pub subnet: u8,
    pub universe: u8,
    pub start_channel: u16,
    pub dest_index: usize,
    pub pixel_count: u16,
}

impl FragmentConfig {
    pub fn address_mask(&self) -> u16 {
        ArtnetAddress {
            net: self.net,
            subnet: self.subnet,
            universe: self.universe,
        }
        .to_mask()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let mut config: Config = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Clamp system settings into their documented ranges.
    pub fn normalize(&mut self) {
        let sys = &mut self.system;
        sys.pixels_per_universe = sys.pixels_per_universe.clamp(1, MAX_PIXELS_PER_UNIVERSE);
        sys.status_update_interval_ms = sys.status_update_interval_ms.max(500);
        sys.max_fps = sys.max_fps.max(1);
    }

    /// Reject configurations whose fragments could index outside a universe
    /// or a device buffer. The router refuses to start on any violation.
    pub fn validate(&self) -> Result<()> {
        self.system
            .ip_artnet
            .parse::<Ipv4Addr>()
            .with_context(|| format!("system.ipArtnet {:?} is not an IPv4 address", self.system.ip_artnet))?;

        for (dev_key, device) in &self.devices {
            device
                .ip
                .parse::<Ipv4Addr>()
                .with_context(|| format!("device {:?}: ip {:?} is not an IPv4 address", dev_key, device.ip))?;

            for (frag_key, frag) in &device.data {
                let at = || format!("device {:?}, fragment {:?}", dev_key, frag_key);
                if frag.net > 127 || frag.subnet > 15 || frag.universe > 15 {
                    bail!("{}: address {}/{}/{} out of range", at(), frag.net, frag.subnet, frag.universe);
                }
                if frag.start_channel > 511 {
                    bail!("{}: startChannel {} out of range", at(), frag.start_channel);
                }
                if frag.pixel_count > self.system.pixels_per_universe {
                    bail!(
                        "{}: pixelCount {} exceeds pixelsPerUniverse {}",
                        at(),
                        frag.pixel_count,
                        self.system.pixels_per_universe
                    );
                }
                if frag.start_channel as usize + 3 * frag.pixel_count as usize > 512 {
                    bail!("{}: fragment crosses the end of the universe", at());
                }
                if frag.dest_index + frag.pixel_count as usize > device.pixel_count {
                    bail!(
                        "{}: destIndex {} + pixelCount {} exceeds device pixelCount {}",
                        at(),
                        frag.dest_index,
                        frag.pixel_count,
                        device.pixel_count
                    );
                }
            }
        }
        Ok(())
    }

    /// Device frame-rate cap: the tighter of the device and system limits.
    pub fn effective_fps(&self, device: &DeviceConfig) -> u32 {
        device.max_fps.min(self.system.max_fps).max(1)
    }
}
