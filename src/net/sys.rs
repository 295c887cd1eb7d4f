//! Thin wrappers over the platform socket calls via [nix], plus the errno classification the
//! channel state machine relies on. The calls themselves are used as-is; only their error
//! results are folded into the crate's taxonomy.

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, connect, getpeername, getsockname, listen, recv, recvfrom, send, sendto,
    setsockopt, shutdown, socket, sockopt, AddressFamily, Backlog, MsgFlags, Shutdown, SockFlag,
    SockType, SockaddrStorage,
};

use crate::error::{Error, Result};

fn family_of(addr: &SocketAddr) -> AddressFamily {
    if addr.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    }
}

/// Whether the errno is the transient would-block condition absorbed by drain loops.
pub fn is_wouldblock(e: Errno) -> bool {
    e == Errno::EAGAIN || e == Errno::EWOULDBLOCK
}

/// Whether the errno reports a non-blocking connect still in progress.
pub fn is_connecting(e: Errno) -> bool {
    e == Errno::EINPROGRESS
}

/// Create a non-blocking stream socket for the given address family.
pub fn stream_socket(addr: &SocketAddr) -> Result<OwnedFd> {
    let fd = socket(
        family_of(addr),
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    Ok(fd)
}

/// Create a non-blocking datagram socket for the given address family.
pub fn dgram_socket(addr: &SocketAddr) -> Result<OwnedFd> {
    let fd = socket(
        family_of(addr),
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    Ok(fd)
}

pub fn bind_addr(fd: &OwnedFd, addr: &SocketAddr) -> Result<()> {
    setsockopt(fd, sockopt::ReuseAddr, &true)?;
    setsockopt(fd, sockopt::ReusePort, &true)?;
    bind(fd.as_raw_fd(), &SockaddrStorage::from(*addr))?;
    Ok(())
}

pub fn listen_backlog(fd: &OwnedFd, backlog: i32) -> Result<()> {
    let backlog = Backlog::new(backlog).map_err(Error::from)?;
    listen(fd, backlog)?;
    Ok(())
}

/// The result of a synchronous connect attempt on a non-blocking socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStart {
    /// Connected immediately; loopback dials often do.
    Connected,
    /// The would-block style in-progress result; completion arrives as write readiness.
    InProgress,
}

pub fn start_connect(fd: RawFd, addr: &SocketAddr) -> Result<ConnectStart> {
    match connect(fd, &SockaddrStorage::from(*addr)) {
        Ok(()) => Ok(ConnectStart::Connected),
        Err(e) if is_connecting(e) => Ok(ConnectStart::InProgress),
        Err(e) => Err(e.into()),
    }
}

/// One accept attempt. `Ok(None)` means the pending queue is drained (would-block); EINTR is
/// retried internally.
pub fn accept_one(fd: RawFd) -> Result<Option<(OwnedFd, Option<SocketAddr>)>> {
    loop {
        match accept4(fd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC) {
            Ok(nfd) => {
                let nfd = unsafe { OwnedFd::from_raw_fd(nfd) };
                let raddr = peer_addr(nfd.as_raw_fd()).ok();
                return Ok(Some((nfd, raddr)));
            }
            Err(e) if is_wouldblock(e) => return Ok(None),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// One send attempt. `Ok(None)` means would-block.
pub fn send_some(fd: RawFd, buf: &[u8]) -> Result<Option<usize>> {
    loop {
        match send(fd, buf, MsgFlags::MSG_NOSIGNAL) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if is_wouldblock(e) => return Ok(None),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// One sendto attempt. `Ok(None)` means would-block.
pub fn send_to(fd: RawFd, buf: &[u8], to: &SocketAddr) -> Result<Option<usize>> {
    loop {
        match sendto(fd, buf, &SockaddrStorage::from(*to), MsgFlags::MSG_NOSIGNAL) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if is_wouldblock(e) => return Ok(None),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// The result of one non-blocking receive attempt.
pub enum Recv {
    Data(usize),
    /// Orderly shutdown by the peer.
    Eof,
    WouldBlock,
}

pub fn recv_some(fd: RawFd, buf: &mut [u8]) -> Result<Recv> {
    loop {
        match recv(fd, buf, MsgFlags::empty()) {
            Ok(0) => return Ok(Recv::Eof),
            Ok(n) => return Ok(Recv::Data(n)),
            Err(e) if is_wouldblock(e) => return Ok(Recv::WouldBlock),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn recv_from(fd: RawFd, buf: &mut [u8]) -> Result<(Recv, Option<SocketAddr>)> {
    loop {
        match recvfrom::<SockaddrStorage>(fd, buf) {
            Ok((0, _)) => return Ok((Recv::Eof, None)),
            Ok((n, from)) => {
                return Ok((Recv::Data(n), from.as_ref().and_then(sockaddr_to_std)))
            }
            Err(e) if is_wouldblock(e) => return Ok((Recv::WouldBlock, None)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub fn shutdown_read(fd: RawFd) -> Result<()> {
    match shutdown(fd, Shutdown::Read) {
        // The peer may already have torn the connection down; nothing left to shut.
        Ok(()) | Err(Errno::ENOTCONN) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn shutdown_write(fd: RawFd) -> Result<()> {
    match shutdown(fd, Shutdown::Write) {
        Ok(()) | Err(Errno::ENOTCONN) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn local_addr(fd: RawFd) -> Result<SocketAddr> {
    let sa = getsockname::<SockaddrStorage>(fd)?;
    sockaddr_to_std(&sa).ok_or(Error::InvalidState)
}

pub fn peer_addr(fd: RawFd) -> Result<SocketAddr> {
    let sa = getpeername::<SockaddrStorage>(fd)?;
    sockaddr_to_std(&sa).ok_or(Error::InvalidState)
}

fn sockaddr_to_std(sa: &SockaddrStorage) -> Option<SocketAddr> {
    if let Some(v4) = sa.as_sockaddr_in() {
        return Some(SocketAddr::V4(std::net::SocketAddrV4::new(
            v4.ip(),
            v4.port(),
        )));
    }
    if let Some(v6) = sa.as_sockaddr_in6() {
        return Some(SocketAddr::V6(std::net::SocketAddrV6::new(
            v6.ip(),
            v6.port(),
            v6.flowinfo(),
            v6.scope_id(),
        )));
    }
    None
}
