//! The handler registry: a two-level map under a single mutex, matching
//! `HandlerMgr` in `tproxy/BaseHandler.go` — `{protocol -> {key -> handler}}`
//! with idempotent insert and no iteration exposed while unlocked.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::context::HandlerKey;
use crate::config::ProtocolTag;
use crate::error::{Error, Result};
use crate::net::TargetAddr;

/// Common contract every protocol handler implements (spec §4.6
/// `BaseHandler`). `tunnel` dials and authenticates upstream; `communicate`
/// pumps bytes until either side closes; `close` is idempotent.
///
/// `send_datagram`/`recv_datagram` are only meaningful for the SOCKS5 UDP
/// ASSOCIATE handler, whose data plane is driven by the UDP listener's
/// per-5-tuple demux loop rather than `communicate`'s TCP pump (spec §9:
/// "protocol-specific communicate behavior is expected, not one-size
/// loop"). TCP-oriented handlers keep the default, which reports the
/// protocol as unsupported for datagram relay.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn tunnel(&self) -> Result<()>;
    async fn communicate(&self);
    fn close(&self);

    async fn send_datagram(&self, _dst: &TargetAddr, _payload: &[u8]) -> Result<()> {
        Err(Error::state("this protocol does not support datagram relay"))
    }

    async fn recv_datagram(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::state("this protocol does not support datagram relay"))
    }
}

#[derive(Default)]
pub struct HandlerManager {
    handlers: Mutex<HashMap<ProtocolTag, HashMap<HandlerKey, Arc<dyn Handler>>>>,
}

impl HandlerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `handler` under `(proto, key)`. A no-op if the key is already
    /// present — the original handler keeps running.
    pub fn add(&self, proto: ProtocolTag, key: HandlerKey, handler: Arc<dyn Handler>) -> Arc<dyn Handler> {
        let mut handlers = self.handlers.lock();
        handlers.entry(proto).or_default().entry(key).or_insert(handler).clone()
    }

    pub fn get(&self, proto: ProtocolTag, key: &HandlerKey) -> Option<Arc<dyn Handler>> {
        self.handlers.lock().get(&proto)?.get(key).cloned()
    }

    /// Closes and removes the handler at `(proto, key)`, if any.
    pub fn remove(&self, proto: ProtocolTag, key: &HandlerKey) {
        let removed = self.handlers.lock().get_mut(&proto).and_then(|m| m.remove(key));
        if let Some(handler) = removed {
            handler.close();
        }
    }

    /// Closes and drops every handler of `proto`.
    pub fn close_protocol(&self, proto: ProtocolTag) {
        let removed = self.handlers.lock().remove(&proto);
        if let Some(map) = removed {
            for handler in map.into_values() {
                handler.close();
            }
        }
    }

    pub fn close_all(&self) {
        let removed = std::mem::take(&mut *self.handlers.lock());
        for map in removed.into_values() {
            for handler in map.into_values() {
                handler.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler(Arc<AtomicUsize>);

    #[async_trait]
    impl Handler for CountingHandler {
        async fn tunnel(&self) -> Result<()> {
            Ok(())
        }
        async fn communicate(&self) {}
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn key() -> HandlerKey {
        HandlerKey {
            local: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1234),
            remote: crate::net::TargetAddr::Domain { host: "example.com".into(), port: 443 },
        }
    }

    #[test]
    fn add_is_idempotent_and_keeps_the_original() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mgr = HandlerManager::new();
        let first = Arc::new(CountingHandler(closes.clone()));
        let second = Arc::new(CountingHandler(closes.clone()));

        let got_first = mgr.add(ProtocolTag::Http, key(), first.clone());
        let got_second = mgr.add(ProtocolTag::Http, key(), second);

        assert!(Arc::ptr_eq(&got_first, &got_second));
        assert!(Arc::ptr_eq(&got_first, &(first as Arc<dyn Handler>)));
    }

    #[test]
    fn remove_closes_the_handler() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mgr = HandlerManager::new();
        mgr.add(ProtocolTag::Sock4, key(), Arc::new(CountingHandler(closes.clone())));
        mgr.remove(ProtocolTag::Sock4, &key());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(mgr.get(ProtocolTag::Sock4, &key()).is_none());
    }

    #[test]
    fn close_all_closes_every_protocol() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mgr = HandlerManager::new();
        mgr.add(ProtocolTag::Http, key(), Arc::new(CountingHandler(closes.clone())));
        mgr.add(ProtocolTag::Sock4, key(), Arc::new(CountingHandler(closes.clone())));
        mgr.close_all();
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }
}
