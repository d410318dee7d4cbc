use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info};

/// Controllers announce themselves with small UDP beacons on this port.
pub const DISCOVERY_PORT: u16 = 1889;

const BEACON_PACKET: u32 = 42;
const TIMESYNC_PACKET: u32 = 43;
const SYNC_ID: u32 = 890;
const DEVICE_TIMEOUT: Duration = Duration::from_secs(30);
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Beacon {
    packet_type: u32,
    sender_id: u32,
    sender_time: u32,
}

fn parse_beacon(data: &[u8]) -> Option<Beacon> {
    if data.len() < 12 {
        return None;
    }
    let word = |i: usize| u32::from_le_bytes(data[i..i + 4].try_into().unwrap());
    Some(Beacon {
        packet_type: word(0),
        sender_id: word(4),
        sender_time: word(8),
    })
}

fn encode_timesync(now_ms: u32, sender_id: u32, sender_time: u32) -> [u8; 20] {
    let mut pkt = [0u8; 20];
    pkt[0..4].copy_from_slice(&TIMESYNC_PACKET.to_le_bytes());
    pkt[4..8].copy_from_slice(&SYNC_ID.to_le_bytes());
    pkt[8..12].copy_from_slice(&now_ms.to_le_bytes());
    pkt[12..16].copy_from_slice(&sender_id.to_le_bytes());
    pkt[16..20].copy_from_slice(&sender_time.to_le_bytes());
    pkt
}

/// Low 32 bits of the wall clock in milliseconds, the unit controllers
/// keep their pattern clocks in.
fn millis_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u32
}

pub fn bind_discovery_socket(ip: Ipv4Addr, port: u16) -> Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    let addr = SocketAddr::new(IpAddr::V4(ip), port);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    let std_sock: std::net::UdpSocket = socket.into();
    std_sock.set_nonblocking(true)?;
    Ok(std_sock)
}

struct BeaconRecord {
    addr: SocketAddr,
    last_seen: Instant,
}

/// Best-effort controller discovery: keeps a list of beaconing controllers
/// and, when enabled, answers each beacon with a time-sync packet so
/// controllers on the network run their patterns in step. Defers to any
/// other time source heard on the wire.
pub async fn run_discovery_task(socket: UdpSocket, time_sync: bool, mut exit: watch::Receiver<bool>) {
    let mut buf = [0u8; 1024];
    let mut devices: HashMap<u32, BeaconRecord> = HashMap::new();
    let mut auto_sync = time_sync;
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);

    loop {
        enum Event {
            Swept,
            Received(std::io::Result<(usize, SocketAddr)>),
        }

        let event = tokio::select! {
            _ = exit.wait_for(|stop| *stop) => break,
            _ = sweep.tick() => Event::Swept,
            received = socket.recv_from(&mut buf) => Event::Received(received),
        };

        match event {
            Event::Swept => {
                let now = Instant::now();
                devices.retain(|id, record| {
                    let keep = now.duration_since(record.last_seen) <= DEVICE_TIMEOUT;
                    if !keep {
                        debug!(sender_id = *id, "controller beacon timed out");
                    }
                    keep
                });
            }
            Event::Received(received) => {
                let Ok((n, from)) = received else { continue };
                let Some(beacon) = parse_beacon(&buf[..n]) else { continue };
                match beacon.packet_type {
                    BEACON_PACKET => {
                        let known = devices
                            .insert(beacon.sender_id, BeaconRecord { addr: from, last_seen: Instant::now() })
                            .is_some();
                        if !known {
                            info!(sender_id = beacon.sender_id, %from, "controller discovered");
                        }
                        if auto_sync {
                            let reply = encode_timesync(millis_now(), beacon.sender_id, beacon.sender_time);
                            let _ = socket.send_to(&reply, from).await;
                        }
                    }
                    // someone else is already serving time; stand down
                    TIMESYNC_PACKET if auto_sync => {
                        info!(%from, "another time source is active, disabling time sync");
                        auto_sync = false;
                    }
                    _ => {}
                }
            }
        }
    }
    debug!("discovery listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn beacon_codec_round_trip() {
        let pkt = encode_timesync(1234, 42, 99);
        let beacon = parse_beacon(&pkt).unwrap();
        assert_eq!(beacon.packet_type, TIMESYNC_PACKET);
        assert_eq!(beacon.sender_id, SYNC_ID);
        assert_eq!(beacon.sender_time, 1234);
    }

    #[test]
    fn short_datagram_is_ignored() {
        assert!(parse_beacon(&[0u8; 11]).is_none());
    }

    #[tokio::test]
    async fn beacon_gets_timesync_reply() {
        let socket = UdpSocket::from_std(bind_discovery_socket(Ipv4Addr::LOCALHOST, 0).unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        let (exit, exit_rx) = watch::channel(false);
        let task = tokio::spawn(run_discovery_task(socket, true, exit_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut beacon = [0u8; 12];
        beacon[0..4].copy_from_slice(&BEACON_PACKET.to_le_bytes());
        beacon[4..8].copy_from_slice(&7u32.to_le_bytes());
        beacon[8..12].copy_from_slice(&5000u32.to_le_bytes());
        client.send_to(&beacon, addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .expect("no timesync reply within 1s")
            .unwrap();
        assert_eq!(n, 20);
        let reply = parse_beacon(&buf[..n]).unwrap();
        assert_eq!(reply.packet_type, TIMESYNC_PACKET);
        assert_eq!(reply.sender_id, SYNC_ID);
        assert_eq!(&buf[12..16], &7u32.to_le_bytes());
        assert_eq!(&buf[16..20], &5000u32.to_le_bytes());

        exit.send_replace(true);
        task.await.unwrap();
    }
}
