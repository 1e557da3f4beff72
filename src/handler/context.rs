use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::config::{Proxy, ProtocolTag};
use crate::error::{Error, Result};
use crate::net::TargetAddr;
use crate::scope::ScopeId;

/// Identifies one live connection the same way the handler registry does:
/// (local, remote) is unique per accepted flow regardless of protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub local: SocketAddr,
    pub remote: TargetAddr,
}

/// Everything a concrete handler needs besides the wire logic itself.
/// Replaces the source's `handlerPrv` struct-embedding base with an
/// explicitly-owned value (spec §9: "Embedded/struct-composition reuse of a
/// shared handler prefix").
#[derive(Clone)]
pub struct HandlerContext {
    pub protocol: ProtocolTag,
    pub scope: ScopeId,
    pub local_addr: SocketAddr,
    pub remote_addr: TargetAddr,
    pub proxy: Proxy,
}

impl HandlerContext {
    pub fn key(&self) -> HandlerKey {
        HandlerKey { local: self.local_addr, remote: self.remote_addr.clone() }
    }

    /// Dials the configured upstream proxy server.
    pub async fn dial_proxy(&self) -> Result<TcpStream> {
        let ip = self.proxy.server_addr()?;
        TcpStream::connect((ip, self.proxy.port)).await.map_err(Error::from)
    }
}
