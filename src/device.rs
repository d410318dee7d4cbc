use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};

use crate::bridge::StatusRecord;
use crate::pixel::{encode_set_vars, PixelBuffer};

/// Controllers serve their websocket API on this port.
const DEVICE_WS_PORT: u16 = 81;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_DELAY: Duration = Duration::from_millis(250);
const COOLDOWN_DELAY: Duration = Duration::from_secs(5);
const OPEN_RETRIES: u32 = 5;

/// Per-device state shared between the receiver (absorption), the device
/// worker (send), and the supervisor (status sampling). Single producer and
/// single consumer per device; the buffer lock is held only long enough to
/// copy pixels in or serialize them out.
pub struct DeviceShared {
    pub name: String,
    pub ip: Ipv4Addr,
    pub max_fps: u32,
    buffer: Mutex<PixelBuffer>,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    pixels_received: AtomicU64,
    dirty: AtomicBool,
    connected: AtomicBool,
}

pub type DeviceHandle = Arc<DeviceShared>;

impl DeviceShared {
    pub fn new(name: String, ip: Ipv4Addr, pixel_count: usize, max_fps: u32) -> DeviceHandle {
        Arc::new(Self {
            name,
            ip,
            max_fps: max_fps.max(1),
            buffer: Mutex::new(PixelBuffer::new(pixel_count)),
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            pixels_received: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        })
    }

    pub fn pixel_count(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Copy one fragment's worth of pixels into the buffer and bump the
    /// ingest counters. Called from the receiver task for every matching
    /// ArtDmx packet.
    pub fn absorb(&self, payload: &[u8], start_channel: usize, dest_index: usize, count: usize) {
        let written = self.buffer.lock().absorb(payload, start_channel, dest_index, count);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.pixels_received.fetch_add(written as u64, Ordering::Relaxed);
        if written > 0 {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    /// True once per batch of absorbed data; clears the flag.
    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    fn serialize_frame(&self) -> String {
        encode_set_vars(self.buffer.lock().as_slice())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn pixels_snapshot(&self) -> Vec<f32> {
        self.buffer.lock().as_slice().to_vec()
    }

    /// Status sample over the elapsed window. Counters keep running; the
    /// supervisor resets them separately so the window stays aligned with
    /// its tick.
    pub fn status(&self, interval_s: f32) -> StatusRecord {
        let interval_s = interval_s.max(f32::EPSILON);
        StatusRecord {
            name: self.name.clone(),
            ip: self.ip.to_string(),
            max_fps: self.max_fps,
            in_pps: self.packets_in.load(Ordering::Relaxed) as f32 / interval_s,
            out_fps: self.packets_out.load(Ordering::Relaxed) as f32 / interval_s,
            connected: self.is_connected(),
        }
    }

    pub fn reset_counters(&self) {
        self.packets_in.store(0, Ordering::Relaxed);
        self.packets_out.store(0, Ordering::Relaxed);
        self.pixels_received.store(0, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn counters(&self) -> (u64, u64, u64) {
        (
            self.packets_in.load(Ordering::Relaxed),
            self.packets_out.load(Ordering::Relaxed),
            self.pixels_received.load(Ordering::Relaxed),
        )
    }
}

enum SessionEnd {
    Stopped,
    Failed(anyhow::Error),
}

/// Worker loop for one device. Connects, streams frames under the rate
/// limit, and reconnects on any transport failure until told to stop.
/// Transport errors never propagate past this function.
pub async fn run_device_task(device: DeviceHandle, mut exit: watch::Receiver<bool>) {
    info!(device = %device.name, ip = %device.ip, "device worker started");
    let mut failures: u32 = 0;

    loop {
        if *exit.borrow() {
            break;
        }
        let opened = tokio::select! {
            _ = exit.wait_for(|stop| *stop) => break,
            opened = open_device_socket(&device) => opened,
        };
        match opened {
            Ok(ws) => {
                failures = 0;
                device.connected.store(true, Ordering::Relaxed);
                info!(device = %device.name, ip = %device.ip, "connected");
                let end = run_connected(&device, ws, &mut exit).await;
                device.connected.store(false, Ordering::Relaxed);
                match end {
                    SessionEnd::Stopped => break,
                    SessionEnd::Failed(e) => {
                        debug!(device = %device.name, error = %e, "connection lost, will reconnect");
                    }
                }
            }
            Err(e) => {
                failures += 1;
                debug!(device = %device.name, error = %e, "open failed");
            }
        }

        let delay = if failures >= OPEN_RETRIES {
            failures = 0;
            COOLDOWN_DELAY
        } else {
            RETRY_DELAY
        };
        tokio::select! {
            _ = exit.wait_for(|stop| *stop) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    device.connected.store(false, Ordering::Relaxed);
    debug!(device = %device.name, "device worker stopped");
}

async fn open_device_socket(device: &DeviceShared) -> Result<WebSocketStream<TcpStream>> {
    let addr = SocketAddr::new(device.ip.into(), DEVICE_WS_PORT);
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, socket.connect(addr))
        .await
        .map_err(|_| anyhow!("connect to {} timed out", addr))??;
    stream.set_nodelay(true)?;

    let url = format!("ws://{}:{}/", device.ip, DEVICE_WS_PORT);
    let (mut ws, _response) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::client_async(url, stream))
        .await
        .map_err(|_| anyhow!("websocket handshake with {} timed out", addr))??;

    // suppress the controller's preview-frame stream right away
    ws.send(Message::Text("{\"sendUpdates\":false}".into())).await?;
    Ok(ws)
}

async fn run_connected(
    device: &DeviceShared,
    mut ws: WebSocketStream<TcpStream>,
    exit: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let period = Duration::from_nanos(1_000_000_000 / device.max_fps as u64);
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    enum Event {
        Exit,
        Inbound(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
        Tick,
    }

    loop {
        let event = tokio::select! {
            _ = exit.wait_for(|stop| *stop) => Event::Exit,
            // devour controller-initiated chatter so the transport stays healthy
            inbound = ws.next() => Event::Inbound(inbound),
            _ = ticks.tick() => Event::Tick,
        };

        match event {
            Event::Exit => {
                let _ = ws.close(None).await;
                return SessionEnd::Stopped;
            }
            Event::Inbound(inbound) => match inbound {
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Failed(e.into()),
                None => return SessionEnd::Failed(anyhow!("closed by controller")),
            },
            Event::Tick => {
                if device.take_dirty() {
                    let frame = device.serialize_frame();
                    if let Err(e) = ws.send(Message::Text(frame)).await {
                        // keep the frame pending so it goes out on reconnect
                        device.mark_dirty();
                        return SessionEnd::Failed(e.into());
                    }
                    device.packets_out.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::pack_rgb;

    fn device() -> DeviceHandle {
        DeviceShared::new("test".into(), Ipv4Addr::new(10, 0, 0, 7), 6, 30)
    }

    #[test]
    fn absorb_updates_buffer_and_counters() {
        let dev = device();
        let payload = [0xff, 0x00, 0x00, 0x00, 0xff, 0x00];
        dev.absorb(&payload, 0, 0, 2);
        assert_eq!(dev.counters(), (1, 0, 2));
        assert_eq!(dev.pixels_snapshot()[0], pack_rgb(0xff, 0x00, 0x00));
        assert!(dev.take_dirty());
        assert!(!dev.take_dirty());
    }

    #[test]
    fn counters_accumulate_until_reset() {
        let dev = device();
        let payload = [0u8; 18];
        dev.absorb(&payload, 0, 0, 6);
        dev.absorb(&payload, 0, 0, 6);
        assert_eq!(dev.counters(), (2, 0, 12));
        dev.reset_counters();
        assert_eq!(dev.counters(), (0, 0, 0));
    }

    #[test]
    fn absorb_out_of_range_counts_packet_but_no_pixels() {
        let dev = device();
        dev.absorb(&[0u8; 30], 0, 6, 3);
        assert_eq!(dev.counters(), (1, 0, 0));
        assert!(!dev.take_dirty());
    }

    #[test]
    fn status_reports_rates_over_window() {
        let dev = device();
        for _ in 0..9 {
            dev.absorb(&[0u8; 18], 0, 0, 6);
        }
        let status = dev.status(3.0);
        assert_eq!(status.in_pps, 3.0);
        assert_eq!(status.out_fps, 0.0);
        assert_eq!(status.max_fps, 30);
        assert!(!status.connected);
        assert_eq!(status.ip, "10.0.0.7");
    }
}
