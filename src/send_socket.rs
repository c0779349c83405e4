use std::io::ErrorKind;
use std::net::SocketAddr;

#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace, warn};

/// The outbound side of the datagram substrate. Sending is a fire-and-forget handoff: failures are
///  logged, and recovery is left to the reliability layer.
#[cfg_attr(test, automock)]
pub trait SendSocket: Send + Sync + 'static {
    fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);
}

impl SendSocket for UdpSocket {
    fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("sending {} bytes to {:?}", packet_buf.len(), to);
        match self.try_send_to(packet_buf, to) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                warn!("socket buffer full, dropping datagram to {:?}", to);
            }
            Err(e) => {
                error!("error sending UDP packet to {:?}: {}", to, e);
            }
        }
    }
}
