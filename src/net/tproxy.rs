use std::mem;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::error::{Error, Result};

fn set_transparent(fd: i32, addr: &SocketAddr) -> std::io::Result<()> {
    let enable: libc::c_int = 1;
    let (level, opt) = match addr {
        SocketAddr::V4(_) => (libc::IPPROTO_IP, libc::IP_TRANSPARENT),
        SocketAddr::V6(_) => (libc::IPPROTO_IPV6, libc::IPV6_TRANSPARENT),
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &enable as *const _ as *const _,
            mem::size_of_val(&enable) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn set_recv_orig_dst(fd: i32, addr: &SocketAddr) -> std::io::Result<()> {
    let enable: libc::c_int = 1;
    let (level, opt) = match addr {
        SocketAddr::V4(_) => (libc::SOL_IP, libc::IP_RECVORIGDSTADDR),
        SocketAddr::V6(_) => (libc::SOL_IPV6, libc::IPV6_RECVORIGDSTADDR),
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &enable as *const _ as *const _,
            mem::size_of_val(&enable) as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Binds a TCP listener on `addr` with `IP_TRANSPARENT` set, so the kernel
/// will deliver connections whose destination is not a local address.
pub fn bind_tcp_transparent(addr: SocketAddr) -> Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::permission(format!("create tproxy tcp socket: {e}")))?;
    set_transparent(socket.as_raw_fd(), &addr).map_err(|e| Error::permission(e.to_string()))?;
    socket.set_reuse_address(true).map_err(|e| Error::permission(e.to_string()))?;
    socket.set_nonblocking(true).map_err(|e| Error::permission(e.to_string()))?;
    socket.bind(&SockAddr::from(addr)).map_err(|e| Error::permission(format!("bind {addr}: {e}")))?;
    socket.listen(1024).map_err(|e| Error::permission(e.to_string()))?;
    TcpListener::from_std(socket.into()).map_err(|e| Error::permission(e.to_string()))
}

/// Binds a UDP socket on `addr` with `IP_TRANSPARENT` and
/// `IP_RECVORIGDSTADDR`/`IPV6_RECVORIGDSTADDR` set, so `recv_dest_from` can
/// recover each datagram's original destination.
pub fn bind_udp_transparent(addr: SocketAddr) -> Result<UdpSocket> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::permission(format!("create tproxy udp socket: {e}")))?;
    let fd = socket.as_raw_fd();
    set_transparent(fd, &addr).map_err(|e| Error::permission(e.to_string()))?;
    set_recv_orig_dst(fd, &addr).map_err(|e| Error::permission(e.to_string()))?;
    socket.set_reuse_address(true).map_err(|e| Error::permission(e.to_string()))?;
    socket.set_nonblocking(true).map_err(|e| Error::permission(e.to_string()))?;
    socket.bind(&SockAddr::from(addr)).map_err(|e| Error::permission(format!("bind {addr}: {e}")))?;
    let std_socket: StdUdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| Error::permission(e.to_string()))
}

/// The original destination of an accepted TPROXY connection. Under
/// `IP_TRANSPARENT`, the kernel reports the packet's true destination as the
/// socket's local address, so no `getsockopt(SO_ORIGINAL_DST)` call is
/// needed (that mechanism is for NAT/REDIRECT-based proxies).
pub fn original_dst_tcp(stream: &TcpStream) -> Result<SocketAddr> {
    stream.local_addr().map_err(Error::from)
}

fn sockaddr_from_cmsg(msg: &libc::msghdr) -> std::io::Result<SocketAddr> {
    unsafe {
        let mut cmsg: *mut libc::cmsghdr = libc::CMSG_FIRSTHDR(msg);
        while !cmsg.is_null() {
            let rcmsg = &*cmsg;
            let matched = match (rcmsg.cmsg_level, rcmsg.cmsg_type) {
                (libc::SOL_IP, libc::IP_RECVORIGDSTADDR) => {
                    let mut raw: libc::sockaddr_in = mem::zeroed();
                    std::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsg),
                        &mut raw as *mut _ as *mut u8,
                        mem::size_of::<libc::sockaddr_in>(),
                    );
                    let ip = std::net::Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
                    Some(SocketAddr::from((ip, u16::from_be(raw.sin_port))))
                }
                (libc::SOL_IPV6, libc::IPV6_RECVORIGDSTADDR) => {
                    let mut raw: libc::sockaddr_in6 = mem::zeroed();
                    std::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsg),
                        &mut raw as *mut _ as *mut u8,
                        mem::size_of::<libc::sockaddr_in6>(),
                    );
                    let ip = std::net::Ipv6Addr::from(raw.sin6_addr.s6_addr);
                    Some(SocketAddr::from((ip, u16::from_be(raw.sin6_port))))
                }
                _ => None,
            };
            if let Some(addr) = matched {
                return Ok(addr);
            }
            cmsg = libc::CMSG_NXTHDR(msg, cmsg);
        }
        Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing original destination ancillary data"))
    }
}

/// Async counterpart of [`recv_dest_from`] for a tokio-driven TPROXY
/// listener: waits for readability, then performs the same raw `recvmsg`
/// through the socket's file descriptor via `try_io` so the blocking syscall
/// never runs on an executor thread that isn't ready for it.
pub async fn recv_dest_from_async(socket: &UdpSocket, buf: &mut [u8]) -> Result<(usize, SocketAddr, SocketAddr)> {
    loop {
        socket.readable().await.map_err(Error::from)?;
        let fd = socket.as_raw_fd();
        match socket.try_io(tokio::io::Interest::READABLE, || {
            recv_dest_from_fd(fd, buf).map_err(std::io::Error::from)
        }) {
            Ok(result) => return Ok(result),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
}

fn recv_dest_from_fd(fd: i32, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, SocketAddr)> {
    unsafe {
        let mut control_buf = [0u8; 128];
        let mut src_storage: libc::sockaddr_storage = mem::zeroed();

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_name = &mut src_storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of_val(&src_storage) as libc::socklen_t;

        let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control_buf.len() as _;

        let n = libc::recvmsg(fd, &mut msg, 0);
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let (_, src_sockaddr) = SockAddr::try_init(|a, l| {
            std::ptr::copy_nonoverlapping(msg.msg_name as *const u8, a as *mut u8, msg.msg_namelen as usize);
            *l = msg.msg_namelen;
            Ok(())
        })?;

        let dst = sockaddr_from_cmsg(&msg)?;
        let src = src_sockaddr
            .as_socket()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "source address is not inet"))?;
        Ok((n as usize, src, dst))
    }
}

/// Reads one datagram from `socket`, returning `(len, source, original_destination)`.
/// Requires the socket to have been bound with `bind_udp_transparent`. Used
/// directly in tests against a blocking `std::net::UdpSocket` pair; the
/// listener itself goes through [`recv_dest_from_async`].
pub fn recv_dest_from(socket: &StdUdpSocket, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr, SocketAddr)> {
    unsafe {
        let mut control_buf = [0u8; 128];
        let mut src_storage: libc::sockaddr_storage = mem::zeroed();

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_name = &mut src_storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of_val(&src_storage) as libc::socklen_t;

        let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control_buf.len() as _;

        let fd = socket.as_raw_fd();
        let n = libc::recvmsg(fd, &mut msg, 0);
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let (_, src_sockaddr) = SockAddr::try_init(|a, l| {
            std::ptr::copy_nonoverlapping(msg.msg_name as *const u8, a as *mut u8, msg.msg_namelen as usize);
            *l = msg.msg_namelen;
            Ok(())
        })?;

        let dst = sockaddr_from_cmsg(&msg)?;
        let src = src_sockaddr
            .as_socket()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "source address is not inet"))?;
        Ok((n as usize, src, dst))
    }
}

/// Builds the `IP_PKTINFO`/`IPV6_PKTINFO` ancillary data that makes a packet
/// sent from a shared transparent socket appear to originate from `src`, the
/// reply-path mirror of the `IP_RECVORIGDSTADDR`/`IPV6_RECVORIGDSTADDR`
/// cmsg that `sockaddr_from_cmsg` reads on receive.
fn pktinfo_cmsg(control_buf: &mut [u8], src: &SocketAddr) -> usize {
    unsafe {
        match src {
            SocketAddr::V4(addr) => {
                let space = libc::CMSG_SPACE(mem::size_of::<libc::in_pktinfo>() as u32) as usize;
                let mut msg: libc::msghdr = mem::zeroed();
                msg.msg_control = control_buf.as_mut_ptr() as *mut libc::c_void;
                msg.msg_controllen = space as _;

                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::IPPROTO_IP;
                (*cmsg).cmsg_type = libc::IP_PKTINFO;
                (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::in_pktinfo>() as u32) as _;

                let mut pktinfo: libc::in_pktinfo = mem::zeroed();
                pktinfo.ipi_spec_dst = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };
                std::ptr::copy_nonoverlapping(
                    &pktinfo as *const _ as *const u8,
                    libc::CMSG_DATA(cmsg),
                    mem::size_of::<libc::in_pktinfo>(),
                );
                space
            }
            SocketAddr::V6(addr) => {
                let space = libc::CMSG_SPACE(mem::size_of::<libc::in6_pktinfo>() as u32) as usize;
                let mut msg: libc::msghdr = mem::zeroed();
                msg.msg_control = control_buf.as_mut_ptr() as *mut libc::c_void;
                msg.msg_controllen = space as _;

                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::IPPROTO_IPV6;
                (*cmsg).cmsg_type = libc::IPV6_PKTINFO;
                (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<libc::in6_pktinfo>() as u32) as _;

                let mut pktinfo: libc::in6_pktinfo = mem::zeroed();
                pktinfo.ipi6_addr = libc::in6_addr { s6_addr: addr.ip().octets() };
                std::ptr::copy_nonoverlapping(
                    &pktinfo as *const _ as *const u8,
                    libc::CMSG_DATA(cmsg),
                    mem::size_of::<libc::in6_pktinfo>(),
                );
                space
            }
        }
    }
}

fn send_from_fd(fd: i32, buf: &[u8], src: SocketAddr, dst: SocketAddr) -> std::io::Result<usize> {
    unsafe {
        let mut control_buf = [0u8; 128];
        let controllen = pktinfo_cmsg(&mut control_buf, &src);

        let dst_sockaddr = SockAddr::from(dst);
        let mut iov = libc::iovec { iov_base: buf.as_ptr() as *mut libc::c_void, iov_len: buf.len() };

        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_name = dst_sockaddr.as_ptr() as *mut libc::c_void;
        msg.msg_namelen = dst_sockaddr.len();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = controllen as _;

        let n = libc::sendmsg(fd, &msg, 0);
        if n < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

/// Sends `buf` to `dst` over `socket` with the reply's source address
/// spoofed to `src`, so a client on the other end sees a reply that appears
/// to come from the connection's original destination rather than the
/// shared transparent listener's own bind address. Mirrors
/// [`recv_dest_from_async`]'s readable/`try_io` loop on the write side.
pub async fn send_from_async(socket: &UdpSocket, buf: &[u8], src: SocketAddr, dst: SocketAddr) -> Result<usize> {
    loop {
        socket.writable().await.map_err(Error::from)?;
        let fd = socket.as_raw_fd();
        match socket.try_io(tokio::io::Interest::WRITABLE, || {
            send_from_fd(fd, buf, src, dst).map_err(std::io::Error::from)
        }) {
            Ok(n) => return Ok(n),
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
}
