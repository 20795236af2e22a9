//! Thin TCP veneer over the loop's socket surface.
//!
//! `TcpSocket` is a convenience wrapper: every potentially blocking call
//! goes through the loop (and therefore suspends the calling fiber), while
//! option setters that never block talk to the kernel directly.

use crate::event_loop::EventLoop;
use libc::c_int;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::RawFd;

/// Build a kernel IPv4 socket name.
pub(crate) fn sockaddr_in_of(address: SocketAddrV4) -> libc::sockaddr_in {
    let mut name: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    name.sin_family = libc::AF_INET as libc::sa_family_t;
    name.sin_port = address.port().to_be();
    name.sin_addr = libc::in_addr {
        s_addr: u32::from(*address.ip()).to_be(),
    };
    name
}

/// Read a kernel IPv4 socket name back.
pub(crate) fn socket_addr_of(name: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(name.sin_addr.s_addr)),
        u16::from_be(name.sin_port),
    )
}

/// A TCP socket owned by a loop. Closing happens through the loop on drop.
pub struct TcpSocket {
    event_loop: EventLoop,
    fd: RawFd,
}

impl TcpSocket {
    /// Create a fresh TCP socket managed by `event_loop`.
    pub fn new(event_loop: &EventLoop) -> io::Result<Self> {
        let fd = event_loop.socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP)?;
        Ok(Self {
            event_loop: event_loop.clone(),
            fd,
        })
    }

    fn from_fd(event_loop: &EventLoop, fd: RawFd) -> Self {
        Self {
            event_loop: event_loop.clone(),
            fd,
        }
    }

    /// The managed descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Enable `SO_REUSEADDR`.
    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        self.set_int_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, reuse as c_int)
    }

    /// Enable `TCP_NODELAY`.
    pub fn set_no_delay(&self, no_delay: bool) -> io::Result<()> {
        self.set_int_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, no_delay as c_int)
    }

    /// Enable keep-alive probing with `interval` seconds of idle time.
    pub fn set_keep_alive(&self, keep_alive: bool, interval: c_int) -> io::Result<()> {
        self.set_int_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, keep_alive as c_int)?;
        if keep_alive {
            debug_assert!(interval >= 1);
            let count: c_int = 3;
            self.set_int_option(libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, interval)?;
            self.set_int_option(libc::IPPROTO_TCP, libc::TCP_KEEPCNT, count)?;
            self.set_int_option(libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, (interval / count).max(1))?;
        }
        Ok(())
    }

    /// Configure `SO_LINGER`.
    pub fn set_linger(&self, linger: bool, interval: c_int) -> io::Result<()> {
        let value = libc::linger {
            l_onoff: linger as c_int,
            l_linger: interval,
        };
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &value as *const libc::linger as *const libc::c_void,
                std::mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Bind to `address` and start listening.
    pub fn listen(&self, address: SocketAddrV4, backlog: c_int) -> io::Result<()> {
        let name = sockaddr_in_of(address);
        let rc = unsafe {
            libc::bind(
                self.fd,
                &name as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::listen(self.fd, backlog) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one connection, suspending the calling fiber until a peer
    /// arrives. Returns the connected socket and the peer endpoint.
    pub fn accept(&self) -> io::Result<(TcpSocket, SocketAddrV4)> {
        let fd = self.event_loop.accept(self.fd)?;
        let socket = TcpSocket::from_fd(&self.event_loop, fd);
        let peer = socket.peer_addr()?;
        Ok((socket, peer))
    }

    /// Connect to `address`, suspending until established.
    pub fn connect(&self, address: SocketAddrV4) -> io::Result<()> {
        self.event_loop.connect(self.fd, address)
    }

    /// Read into `buffer` through the loop.
    pub fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        self.event_loop.read(self.fd, buffer)
    }

    /// Write `data` through the loop.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.event_loop.write(self.fd, data)
    }

    /// Write all of `data`, suspending between short writes.
    pub fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let written = self.write(data)?;
            data = &data[written..];
        }
        Ok(())
    }

    /// The locally bound endpoint.
    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        let mut name: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut length = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd,
                &mut name as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut length,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(socket_addr_of(&name))
    }

    /// The connected peer's endpoint.
    pub fn peer_addr(&self) -> io::Result<SocketAddrV4> {
        let mut name: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut length = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(
                self.fd,
                &mut name as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut length,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(socket_addr_of(&name))
    }

    /// Shut down the reading half.
    pub fn shutdown_read(&self) -> io::Result<()> {
        self.event_loop.shutdown(self.fd, libc::SHUT_RD)
    }

    /// Shut down the writing half.
    pub fn shutdown_write(&self) -> io::Result<()> {
        self.event_loop.shutdown(self.fd, libc::SHUT_WR)
    }

    fn set_int_option(&self, level: c_int, option: c_int, value: c_int) -> io::Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                option,
                &value as *const c_int as *const libc::c_void,
                std::mem::size_of::<c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        if let Err(error) = self.event_loop.close(self.fd) {
            if error.raw_os_error() != Some(libc::EINTR) {
                panic!("close of tcp socket failed: {}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_round_trip() {
        let address = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 47900);
        let name = sockaddr_in_of(address);
        assert_eq!(name.sin_family, libc::AF_INET as libc::sa_family_t);
        assert_eq!(socket_addr_of(&name), address);
    }
}
