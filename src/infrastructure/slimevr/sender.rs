use crate::domain::models::SensorId;
use crate::infrastructure::slimevr::packets::Packet;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
use tracing::{info, trace};

/// Per-tracker UDP link to the tracker server.
///
/// The server tells virtual trackers apart partly by source port, so each
/// tracker owns its own socket. The sequence counter is shared by all packet
/// kinds of the tracker and only ever moves forward.
pub struct PacketSender {
    socket: UdpSocket,
    server: SocketAddr,
    counter: AtomicU64,
    sensor_id: SensorId,
    #[cfg(test)]
    failing_sends: AtomicUsize,
}

impl PacketSender {
    /// Bind a socket on an OS-assigned port, in the server's address family.
    pub fn bind(sensor_id: SensorId, server: SocketAddr) -> io::Result<Self> {
        let local = if server.is_ipv6() {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local)?;
        // Sends must never stall the session's event loop.
        socket.set_nonblocking(true)?;
        info!(
            sensor_id,
            "Tracker {} using local port {}",
            sensor_id,
            socket.local_addr()?.port()
        );

        Ok(Self {
            socket,
            server,
            counter: AtomicU64::new(0),
            sensor_id,
            #[cfg(test)]
            failing_sends: AtomicUsize::new(0),
        })
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Last counter value handed out (0 before the first packet).
    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Take the next counter value, encode and send. Returns the counter used.
    pub fn send(&self, packet: &Packet<'_>) -> io::Result<u64> {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        if self.take_forced_failure() {
            return Err(io::Error::other("simulated send failure"));
        }

        let bytes = packet.encode(counter);
        self.socket.send_to(&bytes, self.server)?;
        trace!(
            sensor_id = self.sensor_id,
            counter,
            "Sent {} packet ({} bytes)",
            packet.name(),
            bytes.len()
        );
        Ok(counter)
    }

    /// Make the next `count` sends fail after taking their counter value.
    #[cfg(test)]
    pub(crate) fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn take_forced_failure(&self) -> bool {
        self.failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[cfg(not(test))]
    fn take_forced_failure(&self) -> bool {
        false
    }
}
