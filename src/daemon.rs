//! Orchestration glue that ties every module into one running scope: cgroup
//! controller, iptables/ip-rule installation, the TPROXY listener, and the
//! DNS hijacker.
//!
//! Grounded on `app/app.go`'s top-level `Runner`, which wires the same
//! collaborators (a cgroup manager, iptables, the proxy servers) behind one
//! `Run`/`Close` pair; this crate splits that into the explicit start/stop
//! sequence spec.md's scope lifecycle section describes instead of the
//! source's single long-lived goroutine group.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cgroup;
use crate::config::{ProtocolTag, Proxy, ScopeProxies};
use crate::dns;
use crate::error::{Error, Result};
use crate::fakeip::Pool;
use crate::handler::{self, Handler, HandlerContext, HandlerKey, HandlerManager};
use crate::ip_route::Route;
use crate::iptables;
use crate::net::{self, TargetAddr};
use crate::runner::ProcessRunner;
use crate::scope::{Manager, ScopeId, State};

/// Everything spawned while one scope is running, torn down together on stop.
pub struct ScopeRuntime {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    plan: iptables::ScopePlan,
    route: Route,
}

/// Runs the scope start sequence (spec §4.9): build the fake-IP pool,
/// install the iptables plan, install the fwmark route, attach the watched
/// executables to this scope's cgroup slice, then spawn the TPROXY and DNS
/// tasks. A failure at any step rolls back everything already applied.
pub async fn start_scope(
    scope: ScopeId,
    cfg: &ScopeProxies,
    manager: &Arc<Manager>,
    cgroup_registry: &Arc<cgroup::Registry>,
    runner: &(dyn ProcessRunner + Send + Sync),
    active_before: &[ScopeId],
    handlers: Arc<HandlerManager>,
) -> Result<ScopeRuntime> {
    manager.advance(scope, State::Starting).await?;

    let pool = match build_pool(cfg) {
        Ok(pool) => pool,
        Err(e) => return abort(manager, scope, e).await,
    };

    let has_udp = cfg.selected_protocol == Some(ProtocolTag::Sock5Udp);
    let plan = iptables::plan(scope, active_before, cfg.t_port, cfg.dns_port, has_udp);
    if let Err(e) = iptables::apply(runner, &plan) {
        return abort(manager, scope, e).await;
    }

    let route = Route::new(cfg.t_port);
    if let Err(e) = route.install(runner) {
        let _ = iptables::teardown(runner, &plan);
        return abort(manager, scope, e).await;
    }

    let controller = match cgroup_registry.controller(scope) {
        Ok(c) => c,
        Err(e) => {
            let _ = route.remove(runner);
            let _ = iptables::teardown(runner, &plan);
            return abort(manager, scope, e).await;
        }
    };
    for path in &cfg.proxy_program {
        controller.add_ctl_app_path(path);
    }

    let bind_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let listener = match net::bind_tcp_transparent(SocketAddr::new(bind_ip, cfg.t_port)) {
        Ok(l) => l,
        Err(e) => {
            let _ = controller.release_all();
            let _ = route.remove(runner);
            let _ = iptables::teardown(runner, &plan);
            return abort(manager, scope, e).await;
        }
    };

    let udp_socket = if has_udp {
        match net::bind_udp_transparent(SocketAddr::new(bind_ip, cfg.t_port)) {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                let _ = controller.release_all();
                let _ = route.remove(runner);
                let _ = iptables::teardown(runner, &plan);
                return abort(manager, scope, e).await;
            }
        }
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if cfg.dns_port > 0 {
        if let Some(pool) = pool.clone() {
            let dns_addr = SocketAddr::new(bind_ip, cfg.dns_port);
            let dns_cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = dns_cancel.cancelled() => {}
                    res = dns::serve(dns_addr, pool) => {
                        if let Err(e) = res {
                            log::error!("dns hijacker for {scope} ({dns_addr}) stopped: {e}");
                        }
                    }
                }
            }));
        }
    }

    let tcp_cancel = cancel.clone();
    let tcp_selection = tcp_selection_for(cfg, has_udp);
    let tcp_handlers = handlers.clone();
    let tcp_pool = pool.clone();
    tasks.push(tokio::spawn(async move {
        tokio::select! {
            _ = tcp_cancel.cancelled() => {}
            res = serve_tcp(listener, scope, tcp_selection, tcp_handlers, tcp_pool) => {
                if let Err(e) = res {
                    log::error!("tproxy listener for {scope} stopped: {e}");
                }
            }
        }
    }));

    if let Some(udp_socket) = udp_socket {
        let udp_cancel = cancel.clone();
        let udp_proxy = cfg.selected_proxy().cloned();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = udp_cancel.cancelled() => {}
                res = serve_udp(udp_socket, scope, udp_proxy, handlers, pool) => {
                    if let Err(e) = res {
                        log::error!("udp tproxy listener for {scope} stopped: {e}");
                    }
                }
            }
        }));
    }

    manager.advance(scope, State::Running).await?;
    Ok(ScopeRuntime { cancel, tasks, plan, route })
}

async fn abort<T>(manager: &Arc<Manager>, scope: ScopeId, e: Error) -> Result<T> {
    let _ = manager.advance(scope, State::Stopped).await;
    Err(e)
}

fn build_pool(cfg: &ScopeProxies) -> Result<Option<Arc<Pool>>> {
    match cfg.fake_ip_net()? {
        Some(net) => Ok(Some(Arc::new(Pool::new(net, 0)?))),
        None => Ok(None),
    }
}

/// Reverses `start_scope` in the opposite order: cancels every spawned task,
/// releases the cgroup slice, removes the fwmark route, then tears down the
/// iptables plan.
pub async fn stop_scope(
    scope: ScopeId,
    manager: &Arc<Manager>,
    cgroup_registry: &Arc<cgroup::Registry>,
    runner: &(dyn ProcessRunner + Send + Sync),
    runtime: ScopeRuntime,
) -> Result<()> {
    manager.advance(scope, State::Stopping).await?;
    runtime.cancel.cancel();
    for task in runtime.tasks {
        let _ = task.await;
    }
    if let Ok(controller) = cgroup_registry.controller(scope) {
        controller.release_all()?;
    }
    runtime.route.remove(runner)?;
    iptables::teardown(runner, &runtime.plan)?;
    manager.advance(scope, State::Stopped).await?;
    Ok(())
}

/// Accepts TPROXY TCP connections, recovers each one's original
/// destination, resolves it back to a domain through the fake-IP pool when
/// the destination was fake-IP-allocated, and hands it off to the protocol
/// handler configured for the scope's selected upstream proxy. `selection`
/// is `None` both when the scope has no selected proxy and when the scope's
/// selected protocol is `sock5-udp` — that protocol has no accepted client
/// socket to dispatch here, it is served entirely by [`serve_udp`].
async fn serve_tcp(
    listener: TcpListener,
    scope: ScopeId,
    selection: Option<(ProtocolTag, Proxy)>,
    handlers: Arc<HandlerManager>,
    pool: Option<Arc<Pool>>,
) -> Result<()> {
    let (protocol, proxy) = match selection {
        Some(s) => s,
        None => {
            log::warn!("scope {scope} has no selected tcp proxy; tproxy listener idle");
            std::future::pending::<()>().await;
            unreachable!("pending future never resolves");
        }
    };

    loop {
        let (stream, _peer) = listener.accept().await.map_err(Error::from)?;
        let local_addr = match net::original_dst_tcp(&stream) {
            Ok(a) => a,
            Err(e) => {
                log::warn!("scope {scope}: failed to recover original destination: {e}");
                continue;
            }
        };
        let remote_addr = resolve_target(local_addr, &pool);

        spawn_tunnel(stream, protocol, scope, local_addr, remote_addr, proxy.clone(), &handlers);
    }
}

fn spawn_tunnel(
    stream: TcpStream,
    protocol: ProtocolTag,
    scope: ScopeId,
    local_addr: SocketAddr,
    remote_addr: TargetAddr,
    proxy: Proxy,
    handlers: &Arc<HandlerManager>,
) {
    let ctx = HandlerContext { protocol, scope, local_addr, remote_addr, proxy };
    let key = ctx.key();
    let handler = match handler::build(ctx, Some(stream)) {
        Ok(h) => h,
        Err(e) => {
            log::warn!("scope {scope}: cannot build handler for {}: {e}", key.remote);
            return;
        }
    };
    let handler = handlers.add(protocol, key.clone(), handler);

    let handlers = handlers.clone();
    tokio::spawn(async move {
        if let Err(e) = handler.tunnel().await {
            log::debug!("tunnel setup to {} failed: {e}", key.remote);
            handlers.remove(protocol, &key);
            return;
        }
        handler.communicate().await;
        handlers.remove(protocol, &key);
    });
}

/// The protocol/proxy pair `serve_tcp` should dispatch to, or `None` when
/// there is nothing for it to do: either the scope has no selected proxy,
/// or the selected protocol is `sock5-udp`, whose TCP-shaped handler
/// construction `handler::build` rejects (that protocol is served entirely
/// by `serve_udp` instead).
fn tcp_selection_for(cfg: &ScopeProxies, has_udp: bool) -> Option<(ProtocolTag, Proxy)> {
    if has_udp {
        return None;
    }
    cfg.selected_protocol.zip(cfg.selected_proxy().cloned())
}

fn resolve_target(local_addr: SocketAddr, pool: &Option<Arc<Pool>>) -> TargetAddr {
    match pool.as_ref().and_then(|p| p.get_domain(local_addr.ip())) {
        Some(host) => TargetAddr::Domain { host, port: local_addr.port() },
        None => TargetAddr::Socket(local_addr),
    }
}

/// Accepts TPROXY UDP datagrams off the one shared transparent socket,
/// demultiplexing them into per-5-tuple `Socks5UdpHandler`s the way
/// `UdpSock5Handler.go` demultiplexes client flows over its relay, except
/// the association itself (rather than the caller) now owns finding or
/// building the per-client handler, since a single socket serves every
/// client instead of one accepted connection per client.
async fn serve_udp(
    socket: Arc<UdpSocket>,
    scope: ScopeId,
    proxy: Option<Proxy>,
    handlers: Arc<HandlerManager>,
    pool: Option<Arc<Pool>>,
) -> Result<()> {
    let proxy = match proxy {
        Some(p) => p,
        None => {
            log::warn!("scope {scope} has no selected proxy; udp tproxy listener idle");
            std::future::pending::<()>().await;
            unreachable!("pending future never resolves");
        }
    };

    let mut buf = vec![0u8; 65536];
    loop {
        let (n, peer_addr, orig_dst) = net::recv_dest_from_async(&socket, &mut buf).await?;
        let remote_addr = resolve_target(orig_dst, &pool);
        let key = HandlerKey { local: peer_addr, remote: remote_addr.clone() };

        let handler = match handlers.get(ProtocolTag::Sock5Udp, &key) {
            Some(h) => h,
            None => {
                let built = spawn_udp_association(
                    scope,
                    peer_addr,
                    orig_dst,
                    remote_addr.clone(),
                    proxy.clone(),
                    &handlers,
                    &socket,
                )
                .await;
                match built {
                    Ok(h) => h,
                    Err(e) => {
                        log::warn!("scope {scope}: cannot build udp handler for {}: {e}", remote_addr);
                        continue;
                    }
                }
            }
        };

        if let Err(e) = handler.send_datagram(&remote_addr, &buf[..n]).await {
            log::debug!("scope {scope}: udp relay send to {} failed: {e}", remote_addr);
            handlers.remove(ProtocolTag::Sock5Udp, &key);
        }
    }
}

/// Builds and registers the handler for a new client 5-tuple, dials and
/// authenticates its upstream relay inline (so the datagram that triggered
/// the association isn't raced against a handshake still in flight), then
/// spawns a background pump that carries relay replies back to the client
/// with the source address spoofed to `orig_dst` via [`net::send_from_async`]
/// until the relay closes, at which point the handler is deregistered.
async fn spawn_udp_association(
    scope: ScopeId,
    peer_addr: SocketAddr,
    orig_dst: SocketAddr,
    remote_addr: TargetAddr,
    proxy: Proxy,
    handlers: &Arc<HandlerManager>,
    socket: &Arc<UdpSocket>,
) -> Result<Arc<dyn Handler>> {
    let ctx = HandlerContext { protocol: ProtocolTag::Sock5Udp, scope, local_addr: peer_addr, remote_addr, proxy };
    let key = ctx.key();
    let handler = handler::build(ctx, None)?;
    handler.tunnel().await?;
    let handler = handlers.add(ProtocolTag::Sock5Udp, key.clone(), handler);

    let reply_handler = handler.clone();
    let reply_handlers = handlers.clone();
    let reply_socket = socket.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            match reply_handler.recv_datagram(&mut buf).await {
                Ok(n) => {
                    if let Err(e) = net::send_from_async(&reply_socket, &buf[..n], orig_dst, peer_addr).await {
                        log::debug!("scope {scope}: udp relay reply to {peer_addr} failed: {e}");
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("scope {scope}: udp relay to {orig_dst} closed: {e}");
                    break;
                }
            }
        }
        reply_handlers.remove(ProtocolTag::Sock5Udp, &key);
    });

    Ok(handler)
}
