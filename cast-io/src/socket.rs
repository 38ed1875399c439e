//! UDP socket wrapper for Cast Streaming
//!
//! Provides a UDP socket configured through socket2. Receive calls report
//! "nothing pending" as `Ok(None)` rather than an error, since that is the
//! common case for a polled media socket.
//!
//! The socket itself stays in blocking mode so that cloned handles never
//! disagree about it. Calls that must not wait ask for that per call with
//! `MSG_DONTWAIT`, and timed receives rely on the socket read timeout.

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::{SocketAddr, UdpSocket};
use std::os::raw::c_int;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[cfg(unix)]
const DONT_WAIT: c_int = libc::MSG_DONTWAIT;
// Without a per-call flag the immediate calls fall back to the read timeout.
#[cfg(not(unix))]
const DONT_WAIT: c_int = 0;
#[cfg(not(unix))]
const IMMEDIATE_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,

    #[error("Datagram truncated: sent {sent} of {len} bytes")]
    Truncated { sent: usize, len: usize },
}

/// UDP socket carrying RTP and RTCP
#[derive(Debug)]
pub struct CastSocket {
    inner: UdpSocket,
}

impl CastSocket {
    /// Create a socket bound to `addr`
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;

        let inner: UdpSocket = socket.into();
        debug!(local = ?inner.local_addr().ok(), "bound cast socket");
        Ok(CastSocket { inner })
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.inner).set_send_buffer_size(size)?;
        Ok(())
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        SockRef::from(&self.inner).set_recv_buffer_size(size)?;
        Ok(())
    }

    pub fn send_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.inner).send_buffer_size()?)
    }

    pub fn recv_buffer_size(&self) -> Result<usize, SocketError> {
        Ok(SockRef::from(&self.inner).recv_buffer_size()?)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.inner.local_addr()?)
    }

    /// Send one datagram to `target`
    ///
    /// Returns `Ok(false)` if the socket buffer is full and the datagram was
    /// dropped; media packets are never queued for later.
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<bool, SocketError> {
        let target = SockAddr::from(target);
        match SockRef::from(&self.inner).send_to_with_flags(buf, &target, DONT_WAIT) {
            Ok(n) if n == buf.len() => Ok(true),
            Ok(n) => Err(SocketError::Truncated {
                sent: n,
                len: buf.len(),
            }),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Receive one datagram if one is pending
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        #[cfg(not(unix))]
        self.inner.set_read_timeout(Some(IMMEDIATE_READ_TIMEOUT))?;

        // socket2 reads into MaybeUninit; an initialized buffer is a valid one.
        let uninit_buf = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
        };
        match SockRef::from(&self.inner).recv_from_with_flags(uninit_buf, DONT_WAIT) {
            Ok((n, addr)) => Ok(Some((n, addr.as_socket().ok_or(SocketError::InvalidAddress)?))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Wait up to `timeout` for a datagram
    ///
    /// For driver loops that have nothing else to do until their next alarm.
    /// Only the read timeout changes; the socket's blocking mode is left
    /// alone, so sends through a cloned handle never wait.
    pub fn recv_from_timeout(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        if timeout.is_zero() {
            return self.recv_from(buf);
        }
        self.inner.set_read_timeout(Some(timeout))?;
        match self.inner.recv_from(buf) {
            Ok((n, addr)) => Ok(Some((n, addr))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Current read timeout, as last set by a timed receive
    pub fn read_timeout(&self) -> Result<Option<Duration>, SocketError> {
        Ok(self.inner.read_timeout()?)
    }

    /// Whether the socket is in non-blocking mode
    pub fn is_nonblocking(&self) -> Result<bool, SocketError> {
        #[cfg(unix)]
        {
            Ok(SockRef::from(&self.inner).nonblocking()?)
        }
        #[cfg(not(unix))]
        {
            Ok(false)
        }
    }

    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(CastSocket {
            inner: self.inner.try_clone()?,
        })
    }

    pub fn as_udp_socket(&self) -> &UdpSocket {
        &self.inner
    }
}
