//! Integration coverage across the config loader, the scope manager, and the
//! iptables/ip-rule builders: a multi-scope config parses into the rule set
//! and lifecycle transitions a real daemon startup would produce, without
//! touching the kernel (argv builders are asserted against a recording
//! runner rather than real `iptables`/`ip` binaries).

use tproxy_core::cgroup;
use tproxy_core::config;
use tproxy_core::ip_route::Route;
use tproxy_core::iptables;
use tproxy_core::runner::RecordingProcessRunner;
use tproxy_core::scope::{Manager, ScopeId, State};

const CONFIG: &str = "
AllProxies:
  Main:
    Proxies:
      sock5-tcp:
        - Name: home
          Server: 127.0.0.1
          Port: 1080
    ProxyProgram:
      - /usr/bin/curl
    TPort: 8900
    DNSPort: 8901
    FakeIPRange: 198.18.0.0/16
    SelectedProtocol: sock5-tcp
    SelectedName: home
  App:
    Proxies: {}
    ProxyProgram:
      - /opt/app/bin/app
    TPort: 8910
    DNSPort: 0
  Global:
    Proxies: {}
    ProxyProgram: []
    TPort: 8920
    DNSPort: 0
";

#[tokio::test]
async fn a_three_scope_config_starts_in_priority_order_with_non_conflicting_rules() {
    let parsed = config::from_str(CONFIG).unwrap();
    assert_eq!(parsed.all_proxies.len(), 3);

    let cgroup_dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(cgroup::Registry::new(cgroup_dir.path()));
    let mut scopes: Vec<ScopeId> = parsed.all_proxies.keys().copied().collect();
    scopes.sort();
    assert_eq!(scopes, vec![ScopeId::Main, ScopeId::App, ScopeId::Global]);

    let runner = RecordingProcessRunner::new();
    let mut active = Vec::new();

    for scope in &scopes {
        let cfg = &parsed.all_proxies[scope];
        manager.register_scope(*scope, cfg.t_port, cfg.proxy_program.clone()).unwrap();
        manager.advance(*scope, State::Starting).await.unwrap();

        let has_udp = false;
        let plan = iptables::plan(*scope, &active, cfg.t_port, cfg.dns_port, has_udp);
        iptables::apply(&runner, &plan).unwrap();

        let route = Route::new(cfg.t_port);
        route.install(&runner).unwrap();

        manager.advance(*scope, State::Running).await.unwrap();
        active.push(*scope);
    }

    for scope in &scopes {
        assert_eq!(manager.state_of(*scope).await, Some(State::Running));
    }

    // Main's jump rule always lands first in the shared chain; Global's last.
    let calls = runner.calls();
    let jump_indices: Vec<usize> = calls
        .iter()
        .filter(|(prog, args)| prog == "iptables" && args.iter().any(|a| a == "main"))
        .map(|(_, args)| {
            let i_pos = args.iter().position(|a| a == "-I").unwrap();
            args[i_pos + 2].parse::<usize>().unwrap()
        })
        .collect();
    assert_eq!(jump_indices, vec![0, 1, 2]);

    // Each scope's selected proxy, where configured, survives the round trip.
    let main_cfg = &parsed.all_proxies[&ScopeId::Main];
    assert_eq!(main_cfg.selected_proxy().unwrap().server, "127.0.0.1");
    let app_cfg = &parsed.all_proxies[&ScopeId::App];
    assert!(app_cfg.selected_proxy().is_none());
}

#[tokio::test]
async fn stopping_a_scope_out_of_order_is_rejected_by_the_lifecycle_state_machine() {
    let cgroup_dir = tempfile::tempdir().unwrap();
    let manager = Manager::new(cgroup::Registry::new(cgroup_dir.path()));
    manager.register_scope(ScopeId::Main, 8900, vec![]).unwrap();
    // Stopping requires Running first; Starting -> Stopping is not a legal edge.
    manager.advance(ScopeId::Main, State::Starting).await.unwrap();
    assert!(manager.advance(ScopeId::Main, State::Stopping).await.is_err());
}
