//! SOCKS5 UDP ASSOCIATE, grounded on `UdpSock5Handler.go`: a TCP control
//! connection negotiates the relay endpoint (shared [`socks5::handshake`]
//! with `CMD=3`), then every datagram sent upstream is wrapped in the
//! SOCKS5 UDP request header and unwrapped on the way back. The control
//! socket stays open for the association's lifetime; dropping it tears the
//! association down.

use std::net::SocketAddr;

use tokio::net::{TcpStream, UdpSocket};

use super::context::HandlerContext;
use super::registry::Handler;
use super::socks5::{handshake, BoundAddr, CMD_UDP_ASSOCIATE};
use crate::error::{Error, Result};
use crate::net::TargetAddr;

/// Wraps `payload` bound for `dst` in the SOCKS5 UDP request header:
/// `RSV(2)=0, FRAG=0, ATYP, DST.ADDR, DST.PORT, DATA`.
pub fn wrap_datagram(dst: &TargetAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00];
    match dst {
        TargetAddr::Socket(SocketAddr::V4(a)) => {
            out.push(0x01);
            out.extend_from_slice(&a.ip().octets());
            out.extend_from_slice(&a.port().to_be_bytes());
        }
        TargetAddr::Socket(SocketAddr::V6(a)) => {
            out.push(0x04);
            out.extend_from_slice(&a.ip().octets());
            out.extend_from_slice(&a.port().to_be_bytes());
        }
        TargetAddr::Domain { host, port } => {
            out.push(0x03);
            out.push(host.len() as u8);
            out.extend_from_slice(host.as_bytes());
            out.extend_from_slice(&port.to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
    out
}

/// Strips the SOCKS5 UDP header from a received datagram, returning the
/// payload. Errors if the packet is shorter than the minimum header or
/// carries a fragment (`FRAG != 0`, unsupported).
pub fn unwrap_datagram(buf: &[u8]) -> Result<&[u8]> {
    if buf.len() < 4 {
        return Err(Error::handshake("udp relay packet shorter than header"));
    }
    if buf[2] != 0x00 {
        return Err(Error::handshake("fragmented udp relay packets are not supported"));
    }
    let atyp = buf[3];
    let header_len = match atyp {
        0x01 => 4 + 4 + 2,
        0x04 => 4 + 16 + 2,
        0x03 => {
            let len = *buf.get(4).ok_or_else(|| Error::handshake("truncated domain length"))? as usize;
            4 + 1 + len + 2
        }
        other => return Err(Error::handshake(format!("unsupported udp relay ATYP {other}"))),
    };
    buf.get(header_len..).ok_or_else(|| Error::handshake("truncated udp relay packet"))
}

pub struct Socks5UdpHandler {
    pub ctx: HandlerContext,
    pub control: tokio::sync::Mutex<Option<TcpStream>>,
    pub relay: tokio::sync::Mutex<Option<UdpSocket>>,
}

impl Socks5UdpHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Socks5UdpHandler { ctx, control: tokio::sync::Mutex::new(None), relay: tokio::sync::Mutex::new(None) }
    }
}

#[async_trait::async_trait]
impl Handler for Socks5UdpHandler {
    async fn tunnel(&self) -> Result<()> {
        let mut control = self.ctx.dial_proxy().await?;
        let (bound, bound_port) =
            handshake(&mut control, &self.ctx.proxy, &self.ctx.remote_addr, CMD_UDP_ASSOCIATE).await?;

        let relay_addr: SocketAddr = match bound {
            BoundAddr::Ip(ip) => SocketAddr::new(ip, bound_port),
            BoundAddr::Domain(host) => {
                let mut addrs = tokio::net::lookup_host((host.as_str(), bound_port))
                    .await
                    .map_err(Error::from)?;
                addrs.next().ok_or_else(|| Error::handshake("relay domain resolved to no address"))?
            }
        };

        let bind_addr: SocketAddr = if relay_addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }.parse().unwrap();
        let relay = UdpSocket::bind(bind_addr).await.map_err(Error::from)?;
        relay.connect(relay_addr).await.map_err(Error::from)?;

        *self.control.lock().await = Some(control);
        *self.relay.lock().await = Some(relay);
        Ok(())
    }

    /// The UDP ASSOCIATE control connection carries no traffic of its own;
    /// per RFC 1928 the association is alive exactly as long as it stays
    /// open, so `communicate` just waits for it to EOF or error. Datagram
    /// relaying itself happens out-of-band through [`Self::send`] and
    /// [`Self::recv`], driven by the UDP listener that demultiplexes
    /// client flows.
    async fn communicate(&self) {
        let mut control = self.control.lock().await.take();
        if let Some(stream) = control.as_mut() {
            let mut buf = [0u8; 1];
            let _ = tokio::io::AsyncReadExt::read(stream, &mut buf).await;
        }
    }

    fn close(&self) {
        if let Ok(mut control) = self.control.try_lock() {
            control.take();
        }
        if let Ok(mut relay) = self.relay.try_lock() {
            relay.take();
        }
    }

    async fn send_datagram(&self, dst: &TargetAddr, payload: &[u8]) -> Result<()> {
        self.send(dst, payload).await
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> Result<usize> {
        self.recv(buf).await
    }
}

impl Socks5UdpHandler {
    /// Wraps and forwards a client datagram bound for `dst` over the relay.
    pub async fn send(&self, dst: &TargetAddr, payload: &[u8]) -> Result<()> {
        let relay = self.relay.lock().await;
        let relay = relay.as_ref().ok_or_else(|| Error::handshake("udp relay not established"))?;
        relay.send(&wrap_datagram(dst, payload)).await.map_err(Error::from)?;
        Ok(())
    }

    /// Receives and unwraps one datagram from the relay.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let relay = self.relay.lock().await;
        let relay = relay.as_ref().ok_or_else(|| Error::handshake("udp relay not established"))?;
        let n = relay.recv(buf).await.map_err(Error::from)?;
        let payload_len = unwrap_datagram(&buf[..n])?.len();
        let header_len = n - payload_len;
        buf.copy_within(header_len..n, 0);
        Ok(payload_len)
    }
}
