use std::net::{IpAddr, Ipv4Addr, SocketAddr};
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::artnet::{self, ArtnetPacket, SequenceFilter, POLL_REPLY_LEN};
use crate::dispatch::DispatchTable;

/// Bind the ingress socket with SO_REUSEADDR so the router can share the
/// Art-Net port with other listeners on the host.
pub fn bind_artnet_socket(ip: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let addr = SocketAddr::new(IpAddr::V4(ip), port);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    {
        // Try to enable SO_REUSEPORT via libc when available.
        // This may fail on platforms that don't support it; ignore errors.
        let fd = socket.as_raw_fd();
        unsafe {
            let optval: libc::c_int = 1;
            let _ = libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEPORT,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of_val(&optval) as libc::socklen_t,
            );
        }
    }
    socket
        .bind(&addr.into())
        .with_context(|| format!("binding Art-Net socket on {}", addr))?;

    let std_sock: std::net::UdpSocket = socket.into();
    std_sock.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(std_sock)?)
}

/// Ingest loop: validate, dispatch ArtDmx synchronously, answer ArtPoll.
/// Malformed datagrams are dropped without comment. The socket closes when
/// the task returns.
pub async fn run_receiver_task(
    socket: UdpSocket,
    table: Arc<DispatchTable>,
    poll_reply: [u8; POLL_REPLY_LEN],
    drop_out_of_sequence: bool,
    mut exit: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 2048];
    let mut filter = drop_out_of_sequence.then(SequenceFilter::new);

    loop {
        let received = tokio::select! {
            _ = exit.wait_for(|stop| *stop) => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((n, from)) => match artnet::parse_packet(&buf[..n]) {
                Ok(ArtnetPacket::Dmx { address, sequence, data, .. }) => {
                    if let Some(filter) = filter.as_mut() {
                        if !filter.accept(address, sequence) {
                            continue;
                        }
                    }
                    table.dispatch(address, data);
                }
                Ok(ArtnetPacket::Poll) => {
                    debug!(%from, "answering ArtPoll");
                    if let Err(e) = socket.send_to(&poll_reply, from).await {
                        debug!(%from, error = %e, "poll reply failed");
                    }
                }
                Err(_) => {}
            },
            Err(e) => {
                warn!(error = %e, "Art-Net recv failed");
            }
        }
    }
    info!("Art-Net receiver stopped");
}
