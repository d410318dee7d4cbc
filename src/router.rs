use std::collections::BTreeMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::artnet;
use crate::bridge::{BridgeHandle, ExitFlag, UiCommand};
use crate::config::Config;
use crate::device::{self, DeviceHandle, DeviceShared};
use crate::discovery;
use crate::dispatch::DispatchTable;
use crate::receiver;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const RESTART_QUIESCE: Duration = Duration::from_secs(1);

/// A running router: the receiver, one worker per device, the status
/// sampler, and optionally the discovery listener.
pub struct RouterHandle {
    pub ingress_addr: SocketAddr,
    bridge: BridgeHandle,
    tasks: Vec<JoinHandle<()>>,
}

/// The address we advertise in ArtPollReply. A wildcard bind is useless to
/// a console, so substitute the first routable interface address.
fn advertised_ip(bind_ip: Ipv4Addr) -> Ipv4Addr {
    if !bind_ip.is_unspecified() {
        return bind_ip;
    }
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces
            .into_iter()
            .filter(|i| !i.is_loopback())
            .find_map(|i| match i.addr {
                if_addrs::IfAddr::V4(v4) => Some(v4.ip),
                _ => None,
            })
            .unwrap_or(bind_ip),
        Err(_) => bind_ip,
    }
}

/// A task that dies by panic has broken a core invariant; flag the whole
/// router down rather than limp along without it.
fn spawn_supervised(
    name: &'static str,
    exit: ExitFlag,
    fut: impl Future<Output = ()> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
            error!(task = name, "task panicked, shutting the router down");
            exit.set();
        }
    })
}

/// Build and start the full worker set from a validated configuration.
/// Fails (and leaves nothing running) if the config is invalid or the
/// ingress socket cannot be bound.
pub fn start(config: Config, bridge: BridgeHandle) -> Result<RouterHandle> {
    config.validate()?;
    bridge.exit().clear();

    let listen_ip: Ipv4Addr = config.system.ip_artnet.parse()?;
    let socket = receiver::bind_artnet_socket(listen_ip, config.system.port_artnet)?;
    let ingress_addr = socket.local_addr()?;
    if listen_ip.is_unspecified() {
        info!(port = ingress_addr.port(), "listening for Art-Net on all interfaces");
    } else {
        info!(addr = %ingress_addr, "listening for Art-Net");
    }

    let mut devices: BTreeMap<String, DeviceHandle> = BTreeMap::new();
    for (key, device_cfg) in &config.devices {
        let name = if device_cfg.name.is_empty() {
            key.clone()
        } else {
            device_cfg.name.clone()
        };
        let ip = device_cfg
            .ip
            .parse()
            .with_context(|| format!("device {:?} ip", key))?;
        devices.insert(
            key.clone(),
            DeviceShared::new(name, ip, device_cfg.pixel_count, config.effective_fps(device_cfg)),
        );
    }

    let table = Arc::new(DispatchTable::build(&config, &devices));
    info!(
        devices = devices.len(),
        universes = table.universe_count(),
        fragments = table.fragment_count(),
        "router configured"
    );

    let poll_reply = artnet::encode_poll_reply(advertised_ip(listen_ip), ingress_addr.port());
    let exit = bridge.exit().clone();
    let mut tasks = Vec::new();

    tasks.push(spawn_supervised(
        "receiver",
        exit.clone(),
        receiver::run_receiver_task(
            socket,
            table,
            poll_reply,
            config.system.drop_out_of_sequence,
            exit.subscribe(),
        ),
    ));

    for device in devices.values() {
        tasks.push(spawn_supervised(
            "device",
            exit.clone(),
            device::run_device_task(device.clone(), exit.subscribe()),
        ));
    }

    if config.system.discovery {
        // best effort: a missing discovery port never blocks routing
        match discovery::bind_discovery_socket(listen_ip, discovery::DISCOVERY_PORT)
            .map_err(anyhow::Error::from)
            .and_then(|s| UdpSocket::from_std(s).map_err(Into::into))
        {
            Ok(socket) => tasks.push(spawn_supervised(
                "discovery",
                exit.clone(),
                discovery::run_discovery_task(socket, config.system.time_sync, exit.subscribe()),
            )),
            Err(e) => warn!(error = %e, "discovery listener disabled"),
        }
    }

    tasks.push(spawn_supervised(
        "status",
        exit.clone(),
        run_status_task(
            devices.into_values().collect(),
            bridge.clone(),
            config.system.status_update_interval_ms,
        ),
    ));

    Ok(RouterHandle {
        ingress_addr,
        bridge,
        tasks,
    })
}

impl RouterHandle {
    /// Signal every task down and wait for them; abort is the backstop for
    /// anything wedged in I/O past the deadline.
    pub async fn stop(self) {
        self.bridge.exit().set();
        for mut task in self.tasks {
            match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
                Ok(_) => {}
                Err(_) => {
                    task.abort();
                    let _ = task.await;
                }
            }
        }
        info!("router stopped");
    }

    /// Stop, quiesce briefly, and start again — the mechanism for adopting
    /// a new configuration.
    pub async fn restart(self, config: Config) -> Result<RouterHandle> {
        let bridge = self.bridge.clone();
        self.stop().await;
        tokio::time::sleep(RESTART_QUIESCE).await;
        start(config, bridge)
    }
}

/// Periodic status sampler. Snapshots every device each tick, publishes the
/// records only while the UI is listening, and resets the counters either
/// way so each window stands on its own.
async fn run_status_task(devices: Vec<DeviceHandle>, bridge: BridgeHandle, interval_ms: u64) {
    let mut exit = bridge.exit().subscribe();
    let mut ticks = tokio::time::interval(Duration::from_millis(interval_ms));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks.tick().await; // the first tick is immediate; the window starts now
    let mut window_start = tokio::time::Instant::now();

    // the command half of the bridge contract; only shutdown exists today
    let mut commands = bridge.command_rx.lock().await;

    loop {
        tokio::select! {
            _ = exit.wait_for(|stop| *stop) => break,
            command = commands.recv() => match command {
                Some(UiCommand::Shutdown) => bridge.exit().set(),
                None => {}
            },
            _ = ticks.tick() => {
                let elapsed = window_start.elapsed().as_secs_f32();
                window_start = tokio::time::Instant::now();
                for device in &devices {
                    if bridge.ui_is_active() {
                        bridge.publish_status(device.status(elapsed));
                    }
                    device.reset_counters();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ControlBridge;
    use std::time::Duration;

    fn test_config() -> Config {
        let json = r#"{
            "system": {
                "ipArtnet": "127.0.0.1",
                "portArtnet": 0,
                "statusUpdateIntervalMs": 500
            },
            "devices": {
                "d1": {"name": "strip", "ip": "127.0.0.1", "pixelCount": 3, "data": {
                    "a": {"universe": 1, "pixelCount": 3}
                }}
            }
        }"#;
        let mut config: Config = serde_json::from_str(json).unwrap();
        config.normalize();
        config
    }

    fn artdmx(address: u16, payload: &[u8]) -> Vec<u8> {
        let mut pkt = Vec::new();
        pkt.extend_from_slice(b"Art-Net\0");
        pkt.extend_from_slice(&0x5000u16.to_le_bytes());
        pkt.extend_from_slice(&14u16.to_be_bytes());
        pkt.extend_from_slice(&[0, 0]);
        pkt.extend_from_slice(&address.to_le_bytes());
        pkt.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        pkt.extend_from_slice(payload);
        pkt
    }

    #[tokio::test]
    async fn starts_publishes_status_and_stops() {
        let bridge = ControlBridge::new(16);
        let router = start(test_config(), bridge.clone()).unwrap();
        bridge.set_ui_active(true);
        let mut status_rx = bridge.subscribe_status();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for _ in 0..3 {
            client.send_to(&artdmx(0x0001, &[0x42; 9]), router.ingress_addr).await.unwrap();
        }

        let record = loop {
            let record = tokio::time::timeout(Duration::from_secs(3), status_rx.recv())
                .await
                .expect("no status record within 3s")
                .unwrap();
            if record.in_pps > 0.0 {
                break record;
            }
        };
        assert_eq!(record.name, "strip");
        assert!(!record.connected); // nothing serves port 81 in the test

        router.stop().await;
        assert!(bridge.exit().is_set());
    }

    #[tokio::test]
    async fn refuses_invalid_config() {
        let mut config = test_config();
        config
            .devices
            .get_mut("d1")
            .unwrap()
            .data
            .get_mut("a")
            .unwrap()
            .pixel_count = 99; // past the 3-pixel device buffer
        let bridge = ControlBridge::new(16);
        assert!(start(config, bridge).is_err());
    }

    #[tokio::test]
    async fn counters_are_reset_even_without_ui() {
        let bridge = ControlBridge::new(16);
        let router = start(test_config(), bridge.clone()).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&artdmx(0x0001, &[0x42; 9]), router.ingress_addr).await.unwrap();

        // wait past one status tick; the window counters must be zeroed
        tokio::time::sleep(Duration::from_millis(900)).await;
        bridge.set_ui_active(true);
        let mut status_rx = bridge.subscribe_status();
        let record = tokio::time::timeout(Duration::from_secs(3), status_rx.recv())
            .await
            .expect("no status record within 3s")
            .unwrap();
        assert_eq!(record.in_pps, 0.0);

        router.stop().await;
    }

    #[tokio::test]
    async fn shutdown_command_stops_the_router() {
        let bridge = ControlBridge::new(16);
        let router = start(test_config(), bridge.clone()).unwrap();
        bridge.commands().send(UiCommand::Shutdown).await.unwrap();
        let mut exit = bridge.exit().subscribe();
        tokio::time::timeout(Duration::from_secs(2), exit.wait_for(|stop| *stop))
            .await
            .expect("exit flag not set within 2s")
            .unwrap();
        router.stop().await;
    }
}
