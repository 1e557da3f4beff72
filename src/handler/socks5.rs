//! Shared SOCKS5 method-negotiation/auth/request logic (RFC 1928 + RFC
//! 1929), factored out of `UdpSock5Handler.go`'s `Tunnel` — the TCP-CONNECT
//! and UDP-ASSOCIATE handlers differ only in the `CMD` byte and in what
//! they do with the bound address afterward, so both call [`handshake`]
//! rather than duplicating the wire logic (spec §9's `HandlerContext`
//! consolidation, not inheritance).

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::Proxy;
use crate::error::{Error, Result};
use crate::net::TargetAddr;

pub const CMD_CONNECT: u8 = 1;
pub const CMD_UDP_ASSOCIATE: u8 = 3;

/// The address the server returns in its reply — the bound relay address
/// for UDP ASSOCIATE, or (conventionally ignored) echo for CONNECT.
#[derive(Debug, Clone)]
pub enum BoundAddr {
    Ip(std::net::IpAddr),
    Domain(String),
}

fn err(msg: impl Into<String>) -> Error {
    Error::handshake(msg.into())
}

/// Runs method negotiation, optional RFC 1929 auth, and the request/reply
/// exchange for `cmd` against `target`. Returns the server's bound address
/// and port from the reply.
pub async fn handshake(
    stream: &mut TcpStream,
    proxy: &Proxy,
    target: &TargetAddr,
    cmd: u8,
) -> Result<(BoundAddr, u16)> {
    let has_creds = proxy.user_name.as_deref().is_some_and(|u| !u.is_empty())
        && proxy.password.as_deref().is_some_and(|p| !p.is_empty());

    // method negotiation: VER NMETHODS METHODS...
    let methods: &[u8] = if has_creds { &[0x00, 0x02] } else { &[0x00] };
    let mut req = vec![0x05, methods.len() as u8];
    req.extend_from_slice(methods);
    stream.write_all(&req).await?;

    let mut resp = [0u8; 2];
    stream.read_exact(&mut resp).await?;
    if resp[0] != 0x05 || (resp[1] != 0x00 && resp[1] != 0x02) {
        return Err(err(format!("unsupported method negotiation reply {resp:?}")));
    }

    if resp[1] == 0x02 {
        let user = proxy.user_name.as_deref().unwrap_or_default();
        let pass = proxy.password.as_deref().unwrap_or_default();
        let mut auth = vec![0x01, user.len() as u8];
        auth.extend_from_slice(user.as_bytes());
        auth.push(pass.len() as u8);
        auth.extend_from_slice(pass.as_bytes());
        stream.write_all(&auth).await?;

        let mut auth_resp = [0u8; 2];
        stream.read_exact(&mut auth_resp).await?;
        let ok = if proxy.strict_socks5_auth {
            auth_resp[0] == 0x00
        } else {
            auth_resp[0] == 0x00 || auth_resp[0] == 0x05
        };
        if !ok {
            return Err(err(format!("socks5 auth rejected, status {}", auth_resp[0])));
        }
    }

    // request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut req = vec![0x05, cmd, 0x00];
    let port = match target {
        TargetAddr::Socket(std::net::SocketAddr::V4(a)) => {
            req.push(0x01);
            req.extend_from_slice(&a.ip().octets());
            a.port()
        }
        TargetAddr::Socket(std::net::SocketAddr::V6(a)) => {
            req.push(0x04);
            req.extend_from_slice(&a.ip().octets());
            a.port()
        }
        TargetAddr::Domain { host, port } => {
            if host.len() > 255 {
                return Err(err("domain name exceeds 255 bytes"));
            }
            req.push(0x03);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
            *port
        }
    };
    let port = if port == 0 { 80 } else { port };
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    // reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != 0x05 || head[1] != 0x00 {
        return Err(err(format!("socks5 request rejected, reply code {}", head[1])));
    }

    let mut atyp = [0u8; 1];
    stream.read_exact(&mut atyp).await?;
    let bound = match atyp[0] {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            BoundAddr::Ip(std::net::IpAddr::from(ip))
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            BoundAddr::Ip(std::net::IpAddr::from(ip))
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            BoundAddr::Domain(String::from_utf8(domain).map_err(|e| err(e.to_string()))?)
        }
        other => return Err(err(format!("unsupported bound ATYP {other}"))),
    };

    let mut port_bytes = [0u8; 2];
    stream.read_exact(&mut port_bytes).await?;
    let bound_port = u16::from_be_bytes(port_bytes);

    Ok((bound, bound_port))
}

/// `BaseHandler` for the `sock5-tcp` protocol: `handshake` with `CMD=1` and
/// hand the now-connected TCP stream straight to the copy pump.
pub struct Socks5TcpHandler {
    pub ctx: crate::handler::context::HandlerContext,
    local: parking_lot::Mutex<Option<TcpStream>>,
    upstream: parking_lot::Mutex<Option<TcpStream>>,
}

impl Socks5TcpHandler {
    pub fn new(ctx: crate::handler::context::HandlerContext, local: TcpStream) -> Self {
        Socks5TcpHandler {
            ctx,
            local: parking_lot::Mutex::new(Some(local)),
            upstream: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait::async_trait]
impl crate::handler::registry::Handler for Socks5TcpHandler {
    async fn tunnel(&self) -> Result<()> {
        let mut stream = self.ctx.dial_proxy().await?;
        handshake(&mut stream, &self.ctx.proxy, &self.ctx.remote_addr, CMD_CONNECT).await?;
        *self.upstream.lock() = Some(stream);
        Ok(())
    }

    async fn communicate(&self) {
        let local = self.local.lock().take();
        let upstream = self.upstream.lock().take();
        if let (Some(mut local), Some(mut upstream)) = (local, upstream) {
            if let Err(e) = super::copy::pump(&mut local, &mut upstream).await {
                log::debug!("socks5 tunnel to {} closed: {e}", self.ctx.remote_addr);
            }
        }
    }

    fn close(&self) {
        self.local.lock().take();
        self.upstream.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn proxy(user: Option<&str>, pass: Option<&str>) -> Proxy {
        Proxy {
            name: "p".into(),
            server: "127.0.0.1".into(),
            port: 0,
            r#type: None,
            user_name: user.map(str::to_string),
            password: pass.map(str::to_string),
            strict_socks5_auth: false,
        }
    }

    #[tokio::test]
    async fn connect_to_a_domain_with_no_auth_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut method_req = [0u8; 3];
            sock.read_exact(&mut method_req).await.unwrap();
            assert_eq!(method_req, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            sock.read_exact(&mut head).await.unwrap();
            assert_eq!(head, [0x05, CMD_CONNECT, 0x00, 0x03]);
            let mut len = [0u8; 1];
            sock.read_exact(&mut len).await.unwrap();
            let mut domain = vec![0u8; len[0] as usize];
            sock.read_exact(&mut domain).await.unwrap();
            assert_eq!(domain, b"example.com");
            let mut port = [0u8; 2];
            sock.read_exact(&mut port).await.unwrap();
            assert_eq!(u16::from_be_bytes(port), 443);

            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90]).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let target = TargetAddr::Domain { host: "example.com".into(), port: 443 };
        let (bound, bound_port) = handshake(&mut client, &proxy(None, None), &target, CMD_CONNECT).await.unwrap();

        assert!(matches!(bound, BoundAddr::Ip(ip) if ip.is_loopback()));
        assert_eq!(bound_port, 8080);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn lenient_auth_accepts_status_five() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut method_req = [0u8; 4];
            sock.read_exact(&mut method_req).await.unwrap();
            assert_eq!(method_req, [0x05, 0x02, 0x00, 0x02]);
            sock.write_all(&[0x05, 0x02]).await.unwrap();

            let mut auth_req = [0u8; 1 + 1 + 1 + 1 + 1];
            sock.read_exact(&mut auth_req).await.unwrap();
            // non-conformant server replies with status 5 instead of 0.
            sock.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 4];
            sock.read_exact(&mut head).await.unwrap();
            assert_eq!(head[3], 0x01);
            let mut rest = [0u8; 4 + 2];
            sock.read_exact(&mut rest).await.unwrap();

            sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let target = TargetAddr::Socket("1.2.3.4:80".parse().unwrap());
        handshake(&mut client, &proxy(Some("u"), Some("p")), &target, CMD_CONNECT)
            .await
            .unwrap();
        server.await.unwrap();
    }
}
