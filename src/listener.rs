//! TCP listening socket for incoming peers.
//!
//! This is a low-volume control-plane listener: the accept queue is kept
//! minimal and admission control happens in the roster.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{RelayError, Result};

/// Pending connection queue length
const LISTEN_BACKLOG: libc::c_int = 1;

/// A bound, listening TCP socket.
#[derive(Debug)]
pub struct ListeningSocket {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
}

impl ListeningSocket {
    /// Bind and listen.
    ///
    /// `public` selects the wildcard address over loopback. `use_ipv6` selects
    /// the IPv6 family and is ignored when built without the `ipv6` feature.
    /// Port 0 lets the OS choose; the chosen port is available from
    /// [`ListeningSocket::port`].
    pub fn bind(port: u16, use_ipv6: bool, public: bool) -> Result<Self> {
        let addr = bind_addr(port, use_ipv6, public);

        let listener =
            TcpListener::bind(addr).map_err(|source| RelayError::Bind { addr, source })?;

        // std listens with a large backlog; listen() again to shrink it
        let ret = unsafe { libc::listen(listener.as_raw_fd(), LISTEN_BACKLOG) };
        if ret == -1 {
            return Err(RelayError::Bind {
                addr,
                source: io::Error::last_os_error(),
            });
        }

        let local_addr = listener.local_addr()?;
        log::info!("Listening on {}", local_addr);

        Ok(ListeningSocket {
            listener: Some(listener),
            local_addr,
        })
    }

    /// Address actually bound, including an OS-chosen port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn is_open(&self) -> bool {
        self.listener.is_some()
    }

    /// Accept one pending connection. Blocks if none is pending.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match &self.listener {
            Some(listener) => listener.accept(),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listening socket destroyed",
            )),
        }
    }

    /// Close the socket. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.listener.take().is_some() {
            log::debug!("Closed listener on {}", self.local_addr);
        }
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }
}

impl Drop for ListeningSocket {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn bind_addr(port: u16, use_ipv6: bool, public: bool) -> SocketAddr {
    if use_ipv6 && cfg!(feature = "ipv6") {
        let ip = if public {
            Ipv6Addr::UNSPECIFIED
        } else {
            Ipv6Addr::LOCALHOST
        };
        SocketAddr::from((ip, port))
    } else {
        let ip = if public {
            Ipv4Addr::UNSPECIFIED
        } else {
            Ipv4Addr::LOCALHOST
        };
        SocketAddr::from((ip, port))
    }
}
