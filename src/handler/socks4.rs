//! SOCKS4/SOCKS4a `CONNECT`, grounded directly on `Sock4Handler.go`.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::context::HandlerContext;
use super::registry::Handler;
use crate::error::{Error, Result};
use crate::net::TargetAddr;

fn err(msg: impl Into<String>) -> Error {
    Error::handshake(msg.into())
}

async fn connect(stream: &mut TcpStream, user: &str, target: &TargetAddr) -> Result<()> {
    let (ip, port, domain) = match target {
        TargetAddr::Socket(std::net::SocketAddr::V4(a)) => (a.ip().octets(), a.port(), None),
        TargetAddr::Socket(std::net::SocketAddr::V6(_)) => {
            return Err(err("socks4 does not support IPv6 targets"))
        }
        TargetAddr::Domain { host, port } => ([0, 0, 0, 1], *port, Some(host.as_str())),
    };
    let port = if port == 0 { 80 } else { port };

    let mut req = vec![0x04, 0x01];
    req.extend_from_slice(&port.to_be_bytes());
    req.extend_from_slice(&ip);
    req.extend_from_slice(user.as_bytes());
    req.push(0x00);
    if let Some(domain) = domain {
        req.extend_from_slice(domain.as_bytes());
        req.push(0x00);
    }
    stream.write_all(&req).await?;

    let mut resp = [0u8; 8];
    stream.read_exact(&mut resp).await?;
    if resp[0] != 0x00 || resp[1] != 90 {
        return Err(err(format!("socks4 request rejected, VN={} CD={}", resp[0], resp[1])));
    }
    Ok(())
}

pub struct Socks4Handler {
    pub ctx: HandlerContext,
    local: parking_lot::Mutex<Option<TcpStream>>,
    upstream: parking_lot::Mutex<Option<TcpStream>>,
}

impl Socks4Handler {
    pub fn new(ctx: HandlerContext, local: TcpStream) -> Self {
        Socks4Handler { ctx, local: parking_lot::Mutex::new(Some(local)), upstream: parking_lot::Mutex::new(None) }
    }
}

#[async_trait::async_trait]
impl Handler for Socks4Handler {
    async fn tunnel(&self) -> Result<()> {
        let mut stream = self.ctx.dial_proxy().await?;
        let user = self.ctx.proxy.user_name.as_deref().unwrap_or("");
        connect(&mut stream, user, &self.ctx.remote_addr).await?;
        *self.upstream.lock() = Some(stream);
        Ok(())
    }

    async fn communicate(&self) {
        let local = self.local.lock().take();
        let upstream = self.upstream.lock().take();
        if let (Some(mut local), Some(mut upstream)) = (local, upstream) {
            if let Err(e) = super::copy::pump(&mut local, &mut upstream).await {
                log::debug!("socks4 tunnel to {} closed: {e}", self.ctx.remote_addr);
            }
        }
    }

    fn close(&self) {
        self.local.lock().take();
        self.upstream.lock().take();
    }
}
