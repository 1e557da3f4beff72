//! Protocol handlers and the registry that tracks live connections.
//!
//! Grounded on `tproxy/BaseHandler.go`'s `BaseHandler` interface and
//! `HandlerMgr`, restructured per spec §9: the shared prefix becomes an
//! owned [`context::HandlerContext`] value instead of Go struct embedding,
//! and dispatch is a tagged match on [`config::ProtocolTag`] rather than an
//! interface satisfied by inheritance.

pub mod context;
pub mod copy;
pub mod http;
pub mod registry;
pub mod socks4;
pub mod socks5;
pub mod socks5_udp;

pub use context::{HandlerContext, HandlerKey};
pub use registry::{Handler, HandlerManager};

use std::sync::Arc;

use tokio::net::TcpStream;

use crate::config::ProtocolTag;
use crate::error::{Error, Result};

/// Constructs the concrete handler for `ctx.protocol`. TCP-oriented
/// protocols (`http`, `sock4`, `sock5-tcp`) take ownership of the already
/// accepted client socket, matching `BaseHandler.go`'s `NewHandler` dispatch
/// switch, which wires the accepted `net.Conn` straight into the handler it
/// builds. `sock5-udp` has no accepted client socket at this point — its
/// control connection is established during `tunnel`, against the original
/// destination the UDP listener recovered from the datagram's ancillary
/// data. Errors if the caller's socket shape doesn't match the protocol
/// (e.g. a TCP flow dispatched to a scope whose selected proxy is
/// `sock5-udp`), rather than panicking on a configuration mistake.
pub fn build(ctx: HandlerContext, local: Option<TcpStream>) -> Result<Arc<dyn Handler>> {
    let protocol = ctx.protocol;
    match (protocol, local) {
        (ProtocolTag::Http, Some(local)) => Ok(Arc::new(http::HttpHandler::new(ctx, local))),
        (ProtocolTag::Sock4, Some(local)) => Ok(Arc::new(socks4::Socks4Handler::new(ctx, local))),
        (ProtocolTag::Sock5Tcp, Some(local)) => Ok(Arc::new(socks5::Socks5TcpHandler::new(ctx, local))),
        (ProtocolTag::Sock5Udp, None) => Ok(Arc::new(socks5_udp::Socks5UdpHandler::new(ctx))),
        (proto, _) => Err(Error::config(format!("protocol {} requires a different socket shape", proto.as_str()))),
    }
}
