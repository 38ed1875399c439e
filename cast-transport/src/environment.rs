//! Session environment
//!
//! An `Environment` is what a sender transport or receiver sees of the
//! outside world: a clock, a way to put a datagram on the wire, and the
//! remote endpoint once it is known.

use bytes::Bytes;
use cast_io::{CastSocket, Clock, ManualClock, SocketError, SystemClock};
use cast_protocol::MAX_RTP_PACKET_SIZE;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

pub trait Environment {
    fn now(&self) -> Instant;

    /// Transmit one datagram to the remote endpoint; failures are logged
    /// and the packet is dropped
    fn send_packet(&mut self, packet: &[u8]);

    fn max_packet_size(&self) -> usize {
        MAX_RTP_PACKET_SIZE
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        None
    }

    fn set_remote_endpoint(&mut self, _endpoint: SocketAddr) {}
}

/// Real network environment: system clock and a UDP socket
#[derive(Debug)]
pub struct UdpEnvironment {
    clock: SystemClock,
    socket: CastSocket,
    remote: Option<SocketAddr>,
    packets_dropped: u64,
}

impl UdpEnvironment {
    /// Use `socket`; with no `remote`, sending waits until one is set
    pub fn new(socket: CastSocket, remote: Option<SocketAddr>) -> Self {
        UdpEnvironment {
            clock: SystemClock,
            socket,
            remote,
            packets_dropped: 0,
        }
    }

    pub fn bind(local: SocketAddr, remote: Option<SocketAddr>) -> Result<Self, SocketError> {
        Ok(Self::new(CastSocket::bind(local)?, remote))
    }

    pub fn socket(&self) -> &CastSocket {
        &self.socket
    }

    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped
    }

    /// Receive one datagram, waiting at most `timeout`
    ///
    /// Once the remote endpoint is known, datagrams from anywhere else are
    /// discarded.
    pub fn receive_packet(
        &self,
        buffer: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        match self.socket.recv_from_timeout(buffer, timeout)? {
            Some((len, source)) => match self.remote {
                Some(remote) if remote != source => {
                    trace!(%source, "ignoring datagram from unexpected endpoint");
                    Ok(None)
                }
                _ => Ok(Some((len, source))),
            },
            None => Ok(None),
        }
    }
}

impl Environment for UdpEnvironment {
    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn send_packet(&mut self, packet: &[u8]) {
        let Some(remote) = self.remote else {
            // Nowhere to send yet.
            self.packets_dropped += 1;
            return;
        };
        match self.socket.send_to(packet, remote) {
            Ok(true) => {}
            Ok(false) => {
                self.packets_dropped += 1;
                trace!("socket buffer full, dropped packet");
            }
            Err(e) => {
                self.packets_dropped += 1;
                warn!("send to {} failed: {}", remote, e);
            }
        }
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn set_remote_endpoint(&mut self, endpoint: SocketAddr) {
        self.remote = Some(endpoint);
    }
}

/// In-memory environment for tests
///
/// Time only moves through the shared `ManualClock`, and every sent packet is
/// recorded. Clones share both, so a test keeps one handle while the code
/// under test owns another.
#[derive(Debug, Clone)]
pub struct FakeEnvironment {
    clock: ManualClock,
    sent: Arc<Mutex<Vec<Bytes>>>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    max_packet_size: usize,
}

impl FakeEnvironment {
    pub fn new(clock: ManualClock) -> Self {
        FakeEnvironment {
            clock,
            sent: Arc::new(Mutex::new(Vec::new())),
            remote: Arc::new(Mutex::new(None)),
            max_packet_size: MAX_RTP_PACKET_SIZE,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Drain everything sent so far
    pub fn take_sent_packets(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_packet_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Environment for FakeEnvironment {
    fn now(&self) -> Instant {
        self.clock.now()
    }

    fn send_packet(&mut self, packet: &[u8]) {
        self.sent.lock().push(Bytes::copy_from_slice(packet));
    }

    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        *self.remote.lock()
    }

    fn set_remote_endpoint(&mut self, endpoint: SocketAddr) {
        *self.remote.lock() = Some(endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_environment_records() {
        let clock = ManualClock::new(Instant::now());
        let env = FakeEnvironment::new(clock.clone());
        let mut handle = env.clone();
        handle.send_packet(&[1, 2, 3]);
        handle.send_packet(&[4]);
        assert_eq!(env.sent_packet_count(), 2);

        let sent = env.take_sent_packets();
        assert_eq!(sent[0].as_ref(), &[1, 2, 3]);
        assert_eq!(env.sent_packet_count(), 0);

        let before = env.now();
        clock.advance(Duration::from_millis(5));
        assert_eq!(handle.now(), before + Duration::from_millis(5));
    }

    #[test]
    fn test_fake_environment_remote() {
        let mut env = FakeEnvironment::new(ManualClock::default());
        assert_eq!(env.remote_endpoint(), None);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        env.set_remote_endpoint(addr);
        assert_eq!(env.clone().remote_endpoint(), Some(addr));
    }

    #[test]
    fn test_udp_environment_loopback() {
        let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let rx = UdpEnvironment::bind(local, None).unwrap();
        let rx_addr = rx.socket().local_addr().unwrap();
        let mut tx = UdpEnvironment::bind(local, Some(rx_addr)).unwrap();

        tx.send_packet(&[0x80, 0x60, 0, 1]);
        let mut buffer = [0u8; 64];
        let (len, source) = rx
            .receive_packet(&mut buffer, Duration::from_secs(1))
            .unwrap()
            .expect("loopback datagram");
        assert_eq!(&buffer[..len], &[0x80, 0x60, 0, 1]);
        assert_eq!(source, tx.socket().local_addr().unwrap());
        assert_eq!(tx.packets_dropped(), 0);
    }

    #[test]
    fn test_udp_environment_no_remote_drops() {
        let mut env = UdpEnvironment::bind("127.0.0.1:0".parse().unwrap(), None).unwrap();
        env.send_packet(&[1]);
        assert_eq!(env.packets_dropped(), 1);
    }
}
